use clap::{Parser, Subcommand};

use crate::transport::TransportKind;

/// DDALAB Relay - live LSL streams to a WebSocket client
#[derive(Parser)]
#[command(name = "ddalab-relay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server (default)
    Serve {
        /// Port to listen on (overrides RELAY_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides RELAY_BIND_ADDR)
        #[arg(short, long)]
        bind: Option<String>,

        /// Signal bus backend: synthetic or lsl (overrides RELAY_TRANSPORT)
        #[arg(short, long)]
        transport: Option<TransportKind>,
    },

    /// Discover active sources once and print them
    Sources {
        /// Signal bus backend: synthetic or lsl (overrides RELAY_TRANSPORT)
        #[arg(short, long)]
        transport: Option<TransportKind>,
    },
}
