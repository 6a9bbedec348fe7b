use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "reel",
    author,
    version,
    about = "HLS stream retrieval: discover qualities and download a stream into one playable file"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the quality variants a manifest offers
    List {
        /// Manifest (playlist) URL
        url: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Download a stream and reassemble it into a single playable file
    Get {
        /// Manifest (playlist) URL
        url: String,

        /// Quality to download: a label such as `1080p`, or a zero-based
        /// index into the `list` output. Defaults to the best available.
        #[arg(long)]
        quality: Option<String>,

        /// Output file name. Defaults to the manifest's file name.
        #[arg(short, long)]
        output: Option<String>,

        /// Destination directory
        #[arg(short = 'd', long, default_value = ".")]
        dir: PathBuf,

        /// Maximum segment requests in flight
        #[arg(short = 'c', long)]
        concurrency: Option<usize>,

        /// Seconds per frame for still-image (slide-show) sources
        #[arg(long)]
        frame_seconds: Option<u64>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}
