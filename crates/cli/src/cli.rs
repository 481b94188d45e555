use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "beacon", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path
    #[arg(short, long, value_name = "FILE")]
    pub config_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway (default)
    Serve {
        /// Gateway host
        #[arg(long)]
        host: Option<String>,

        /// Gateway port
        #[arg(short, long)]
        port: Option<u16>,

        /// Development mode (verbose logging)
        #[arg(short, long)]
        dev: bool,

        /// Use in-process broker and directory instead of Redis
        #[arg(long)]
        memory: bool,
    },

    /// Generate sample configuration
    ConfigSample {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load and validate the configuration, then exit
    CheckConfig,
}
