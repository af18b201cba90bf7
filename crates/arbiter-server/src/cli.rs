//! Command line interface definition

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// arbiterd - admission control for shared backend resources
#[derive(Parser)]
#[command(name = "arbiterd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Admission control for shared backend resources")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the arbiter server
    Serve {
        /// Address to listen on
        #[arg(long, env = "ARBITER_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(long, short, env = "ARBITER_PORT", default_value_t = 4000)]
        port: u16,

        /// JSON quota file (built-in read/write limits when omitted)
        #[arg(long, env = "ARBITER_CONFIG", value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Print the quota table of a running arbiter
    ReadConfig {
        #[command(flatten)]
        server: ServerArgs,
    },

    /// Replace the quota table of a running arbiter
    Configure {
        #[command(flatten)]
        server: ServerArgs,

        /// JSON quota file to install
        #[arg(value_name = "PATH")]
        config: PathBuf,
    },

    /// Print in-flight and queued counts of a running arbiter
    Stats {
        #[command(flatten)]
        server: ServerArgs,
    },
}

#[derive(clap::Args)]
pub struct ServerArgs {
    /// Arbiter address (host:port)
    #[arg(long, env = "ARBITER_SERVER", default_value = "127.0.0.1:4000")]
    pub server: String,
}
