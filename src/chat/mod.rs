//! Chat room built on the line protocol: the server relays every line to all
//! other clients, the client prints what it receives.

mod client;
mod server;

pub use client::{connect, ChatClient};
pub use server::{ChatServer, GOODBYE, QUIT_COMMAND, SHUTDOWN_COMMAND};
