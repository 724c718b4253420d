pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::CrawlerConfig;
use crate::utils::default_log_file;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the storage backend (postgresql, memory)
    #[arg(long, global = true)]
    storage: Option<String>,

    /// Debug-level logging for the crawler
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also log to a file; without a value the platform data directory is used
    #[arg(long, global = true, value_name = "PATH", num_args = 0..=1)]
    log_file: Option<Option<PathBuf>>,
}

impl Cli {
    /// Resolved log file, if file logging was requested
    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_file.as_ref().map(|path| path.clone().unwrap_or_else(default_log_file))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Search keywords once across engines
    Search {
        /// Keywords to search (defaults to the active keywords)
        keywords: Vec<String>,

        /// Engine ids to use (defaults to every enabled engine)
        #[arg(short, long = "engine")]
        engines: Vec<String>,

        /// Result pages per keyword and engine
        #[arg(short, long)]
        pages: Option<u32>,
    },

    /// Run the scheduler with the default jobs until Ctrl+C
    Schedule,

    /// Show the default jobs and their next run times
    Jobs {
        /// Run one job immediately instead
        #[arg(short, long, value_name = "JOB_ID")]
        run: Option<String>,

        /// Print the job list as JSON
        #[arg(long, conflicts_with = "run")]
        json: bool,
    },

    /// Manage tracked keywords
    Keywords {
        #[command(subcommand)]
        action: KeywordAction,
    },

    /// Show task statistics
    Stats {
        /// Reporting window in days
        #[arg(short, long, default_value_t = 7)]
        days: u32,

        /// Number of recent tasks to list
        #[arg(short, long, default_value_t = 10)]
        recent: usize,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },
}

#[derive(Subcommand)]
enum KeywordAction {
    /// Track new keywords
    Add {
        #[arg(required = true)]
        keywords: Vec<String>,
    },

    /// List tracked keywords
    List,

    /// Stop searching a keyword
    Remove {
        keyword: String,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    if let Commands::Config { init: true } = cli.command {
        let path = cli.config.unwrap_or_else(CrawlerConfig::default_path);
        info!("Writing default configuration to {}", path.display());
        return commands::init_config(&path);
    }

    let mut config = CrawlerConfig::load(cli.config.as_deref())?;
    if let Some(storage_type) = cli.storage {
        config.storage.storage_type = storage_type;
    }

    match cli.command {
        Commands::Search { keywords, engines, pages } => {
            info!("Starting search for {} keyword(s)", keywords.len());
            commands::search(config, keywords, engines, pages).await
        },
        Commands::Schedule => {
            info!("Starting scheduler");
            commands::schedule(config).await
        },
        Commands::Jobs { run, json } => {
            commands::jobs(config, run, json).await
        },
        Commands::Keywords { action } => match action {
            KeywordAction::Add { keywords } => commands::add_keywords(config, keywords).await,
            KeywordAction::List => commands::list_keywords(config).await,
            KeywordAction::Remove { keyword } => commands::remove_keyword(config, keyword).await,
        },
        Commands::Stats { days, recent } => {
            info!("Showing statistics for the last {} days", days);
            commands::stats(config, days, recent).await
        },
        Commands::Config { .. } => {
            commands::show_config(&config)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_search_arguments() {
        let cli = Cli::try_parse_from([
            "crawler", "search", "rust", "tokio", "-e", "bing", "--engine", "baidu", "-p", "2", "--storage", "memory",
        ]).unwrap();

        assert_eq!(cli.storage.as_deref(), Some("memory"));
        match cli.command {
            Commands::Search { keywords, engines, pages } => {
                assert_eq!(keywords, ["rust", "tokio"]);
                assert_eq!(engines, ["bing", "baidu"]);
                assert_eq!(pages, Some(2));
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn test_log_file_flag() {
        let cli = Cli::try_parse_from(["crawler", "schedule"]).unwrap();
        assert!(cli.log_file().is_none());

        let cli = Cli::try_parse_from(["crawler", "schedule", "--log-file"]).unwrap();
        assert_eq!(cli.log_file(), Some(default_log_file()));

        let cli = Cli::try_parse_from(["crawler", "--log-file", "/tmp/kwc.log", "schedule"]).unwrap();
        assert_eq!(cli.log_file(), Some(PathBuf::from("/tmp/kwc.log")));
    }

    #[test]
    fn test_jobs_json_conflicts_with_run() {
        assert!(Cli::try_parse_from(["crawler", "jobs", "--json"]).is_ok());
        assert!(Cli::try_parse_from(["crawler", "jobs", "--json", "--run", "search"]).is_err());
    }

    #[test]
    fn test_keyword_add_requires_a_keyword() {
        assert!(Cli::try_parse_from(["crawler", "keywords", "add"]).is_err());
        assert!(Cli::try_parse_from(["crawler", "keywords", "remove", "rust"]).is_ok());
    }
}
