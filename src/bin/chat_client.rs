//! Chat client binary
//!
//! Connects to a chat server, prints everything it relays and sends each
//! typed line. `quit` disconnects and asks for another server; `quit` at the
//! server prompt exits.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin chat_client -- --host 127.0.0.1 --port 10997
//! ```
//!
//! Without `--host` the client prompts for host and port.

use std::io::{self, BufRead, Write};
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lineserve::chat::{self, ChatClient, QUIT_COMMAND};
use lineserve::network::config::DEFAULT_PORT;
use lineserve::protocol::{LineBuffer, LineEncoder};
use lineserve::{NetError, PeerConnection};

#[derive(Parser)]
#[command(version, about = "Line-based chat client")]
struct Args {
    /// server to connect to; prompts when omitted
    #[arg(long)]
    host: Option<String>,
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn prompt(input: &mut impl BufRead, question: &str) -> io::Result<Option<String>> {
    print!("{question}");
    io::stdout().flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn main() -> lineserve::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lineserve=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let client = ChatClient::printing();
    let connected = client.connected_flag();
    let peer: PeerConnection<LineBuffer, ChatClient> = PeerConnection::new(client);
    let mut encoder = LineEncoder::new(256);

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut fixed_target = args.host.map(|host| (host, args.port));

    println!("Hello, and welcome to chatter box client!\n");

    loop {
        let (host, port) = match fixed_target.take() {
            Some(target) => target,
            None => {
                let Some(host) = prompt(
                    &mut input,
                    "Please enter the host to connect to (or 'quit' to exit): ",
                )?
                else {
                    break;
                };
                if host.eq_ignore_ascii_case(QUIT_COMMAND) {
                    break;
                }
                let Some(port) = prompt(&mut input, "Please enter the port number: ")? else {
                    break;
                };
                match port.parse::<u16>() {
                    Ok(port) => (host, port),
                    Err(_) => {
                        println!("Only enter a whole number for the port...");
                        continue;
                    }
                }
            }
        };

        match chat::connect(&peer, &host, port) {
            Ok(()) => {}
            Err(NetError::HostResolution { .. }) => {
                println!("Could not find the host specified, {host}");
                continue;
            }
            Err(e) => {
                println!("Could not connect to {host}:{port}: {e}");
                continue;
            }
        }

        let mut line = String::new();
        while connected.load(Ordering::Acquire) {
            line.clear();
            if input.read_line(&mut line)? == 0 {
                let _ = peer.disconnect();
                println!("\n\nThanks for playing! Goodbye.");
                return Ok(());
            }
            // the server may have gone away while we waited on the console
            if !connected.load(Ordering::Acquire) {
                break;
            }

            let text = line.trim();
            if text.eq_ignore_ascii_case(QUIT_COMMAND) {
                let _ = peer.disconnect();
            } else if !text.is_empty() {
                let _ = peer.write(encoder.encode(text));
            }
        }
    }

    println!("\n\nThanks for playing! Goodbye.");
    Ok(())
}
