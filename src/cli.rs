use clap::{Parser, Subcommand};

/// LLM control plane — governed gateway for chat completions.
#[derive(Parser)]
#[command(name = "control-plane", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server (default).
    Serve {
        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the rate-limit and budget retention sweeps once and exit.
    Cleanup,
}
