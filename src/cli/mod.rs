pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log debug events
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl from one or more seed URLs, resuming any previous run with the same name
    Crawl {
        /// Seed URLs, one spider each
        #[arg(required = true)]
        seeds: Vec<String>,

        /// Profile to use
        #[arg(short, long, default_value = "default")]
        profile: String,

        /// Spider name; suffixed with the seed index when several seeds are given
        #[arg(short, long, default_value = "spider")]
        name: String,

        /// Maximum crawl depth, 0 for unbounded
        #[arg(short, long)]
        depth: Option<u32>,

        /// URL rule for links to follow, in addition to the profile's
        #[arg(short, long = "rule")]
        rules: Vec<String>,
    },

    /// Show the queue statistics of a spider
    Status {
        /// Spider name
        #[arg(required = true)]
        name: String,

        /// Profile holding the data directory
        #[arg(short, long, default_value = "default")]
        profile: String,
    },

    /// List the items of a spider's queue
    Inspect {
        /// Spider name
        #[arg(required = true)]
        name: String,

        #[arg(short, long, default_value = "default")]
        profile: String,

        /// Items to skip
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Items to show, at most 1000
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Delete the queue and visit history of a spider
    Purge {
        /// Spider name
        #[arg(required = true)]
        name: String,

        #[arg(short, long, default_value = "default")]
        profile: String,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl { seeds, profile, name, depth, rules } => {
            info!("Starting crawl of {} seed(s) with profile {}", seeds.len(), profile);
            commands::crawl(seeds, profile, name, depth, rules).await
        }
        Commands::Status { name, profile } => commands::status(name, profile).await,
        Commands::Inspect { name, profile, offset, limit } => {
            commands::inspect(name, profile, offset, limit).await
        }
        Commands::Purge { name, profile } => {
            info!("Purging spider {}", name);
            commands::purge(name, profile).await
        }
        Commands::Config { profile, list } => {
            if list {
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                commands::manage_profile(profile_name)
            } else {
                commands::show_config()
            }
        }
    }
}
