//! unidl CLI - download video and audio from the command line
//!
//! Thin front end over `unidl-core`: every URL becomes a job, the terminal
//! shows one progress bar per job, and Ctrl-C cancels them cooperatively.

mod commands;
mod logging;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// unidl - media downloader
#[derive(Parser)]
#[command(name = "unidl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long, env = "UNIDL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Folder downloads are written to
    #[arg(long, env = "UNIDL_DOWNLOAD_FOLDER", global = true)]
    download_folder: Option<PathBuf>,

    /// Maximum number of simultaneous downloads
    #[arg(long, env = "UNIDL_MAX_DOWNLOADS", global = true)]
    max_downloads: Option<usize>,

    /// Per-download speed cap in KiB/s (0 for unlimited)
    #[arg(long, env = "UNIDL_SPEED_LIMIT", global = true)]
    limit_rate: Option<u64>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum EngineChoice {
    /// Sites supported by yt-dlp
    #[value(name = "yt-dlp")]
    YtDlp,
    /// Direct file links
    Http,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more URLs
    Get {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Extract audio only (mp3)
        #[arg(short, long)]
        audio: bool,

        /// best, high, medium, low, or an engine format id
        #[arg(short, long, default_value = "best")]
        quality: String,

        /// Extraction engine
        #[arg(long, value_enum, default_value = "yt-dlp")]
        engine: EngineChoice,

        /// Write the run's job history as JSON to this file
        #[arg(long, value_name = "PATH")]
        history: Option<PathBuf>,
    },

    /// Show metadata and available formats for a URL
    Probe {
        /// URL to probe
        url: String,

        /// Extraction engine
        #[arg(long, value_enum, default_value = "yt-dlp")]
        engine: EngineChoice,
    },

    /// Show or create the configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print effective settings
    Show,

    /// Print the config file location
    Path,

    /// Write a default config file if none exists
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let overrides = commands::Overrides {
        config: cli.config,
        download_folder: cli.download_folder,
        max_downloads: cli.max_downloads,
        speed_limit_kbps: cli.limit_rate,
    };

    let succeeded = match cli.command {
        Commands::Get {
            urls,
            audio,
            quality,
            engine,
            history,
        } => {
            let options = commands::GetOptions {
                audio,
                quality,
                engine,
                history,
            };
            commands::get(&overrides, urls, options, cli.output).await?
        }

        Commands::Probe { url, engine } => {
            commands::probe(&overrides, &url, engine, cli.output).await?;
            true
        }

        Commands::Config { action } => {
            commands::config_action(&overrides, action, cli.output)?;
            true
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "unidl", &mut std::io::stdout());
            true
        }
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
