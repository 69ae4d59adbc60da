//! CLI argument parsing for calltrace

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for decoded events
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "calltrace")]
#[command(version)]
#[command(about = "Inspect calltrace rules and wire captures", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Classify `Path#method` names against a rules file
    Classify {
        /// Rules file (+whitelist / -blacklist lines)
        #[arg(short, long, value_name = "FILE")]
        rules: Option<PathBuf>,

        /// Namespace prefix to treat as a known library (repeatable)
        #[arg(short = 'l', long = "library", value_name = "PREFIX")]
        libraries: Vec<String>,

        /// Method names, e.g. `ActiveRecord::Base#save`
        #[arg(required = true, value_name = "NAME")]
        names: Vec<String>,
    },

    /// Decode a capture of wire bytes (raw or hex)
    Decode {
        /// Capture file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Receive and decode datagrams on a UDP port
    Listen {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// UDP port to bind
        #[arg(short, long, default_value_t = crate::sink::DEFAULT_PORT)]
        port: u16,

        /// Stop after this many datagrams
        #[arg(short = 'n', long, value_name = "COUNT")]
        count: Option<usize>,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,
    },
}
