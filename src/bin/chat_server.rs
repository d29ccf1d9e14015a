//! Chat server binary
//!
//! Relays every line a client sends to all other connected clients. Lines
//! typed on the console are broadcast as `server: <line>`; `shutdown` stops
//! the server.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin chat_server -- --host 0.0.0.0 --port 10997
//! ```

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lineserve::chat::ChatServer;
use lineserve::network::config::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_READ_BUFFER_SIZE};
use lineserve::{Multiplexer, ServerConfig};

#[derive(Parser)]
#[command(version, about = "Line-based chat server")]
struct Args {
    /// address to bind
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// bytes read per readiness event
    #[arg(long, default_value_t = DEFAULT_READ_BUFFER_SIZE)]
    read_buffer: usize,
}

fn main() -> lineserve::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lineserve=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    let args = Args::parse();
    let config = ServerConfig::builder()
        .host(args.host)
        .port(args.port)
        .read_buffer_size(args.read_buffer)
        .build();

    let server = Multiplexer::bind(config, ChatServer::new())?;
    println!("Chatter Box listening on {}", server.local_addr());
    println!("Type a line to broadcast it, or 'shutdown' to stop.");

    server.run()
}
