use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use discoverer_core::{DatasetFormat, TaskStatus};

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "discoverer")]
#[command(author, version, about = "Crowd-sourced portal registry and dataset builder")]
#[command(after_help = "Examples:
  discoverer ingest observations.json
  discoverer publish
  discoverer export --format kml --output portals.kml --if-needed
  discoverer worker
  discoverer locks list

Worker control:
  HEROKU_API_KEY + HEROKU_APP_NAME set - idle shutdown stops the worker dyno
  otherwise                            - idle shutdown stops this process")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Path to discoverer.toml (default: ~/.config/discoverer/discoverer.toml)
    #[arg(long, env = "DISCOVERER_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Merge a JSON array of observations into the portal store
    #[command(after_help = "Example: discoverer ingest observations.json
Each element: {\"name\", \"guid\"?, \"latE6\", \"lngE6\", \"region\"?, \"reporter\"?, \"timestamp\"?}")]
    Ingest {
        /// JSON file to read ("-" for stdin)
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },
    /// Publish a fresh snapshot of the portal index
    Publish {
        /// Resource to publish (default: index name from config)
        #[arg(long)]
        name: Option<String>,
    },
    /// Build (or reuse) a dataset artifact and write it out
    #[command(after_help = "Examples:
  discoverer export --format kml > portals.kml
  discoverer export --format csv --delimiter ';' --since 2024-01-01 -o new.csv
  discoverer export --format kml --if-needed    # skip when the artifact is current
  discoverer export --format kml --force        # rebuild without the cache")]
    Export {
        /// Output format
        #[arg(short, long, default_value = "kml")]
        format: FormatArg,

        /// File to write (default: stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Only build when the artifact is missing or stale
        #[arg(long, conflicts_with = "force")]
        if_needed: bool,

        /// Render from the current store, bypassing the artifact cache
        #[arg(long)]
        force: bool,

        /// Folder title in KML output (default: OPS-mmddyy)
        #[arg(long)]
        title: Option<String>,

        /// Only portals tagged with this region
        #[arg(long)]
        region: Option<String>,

        /// Only portals discovered on or after this date (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        since: Option<NaiveDate>,

        /// CSV field delimiter
        #[arg(long, default_value = ",")]
        delimiter: char,
    },
    /// Run the task worker until it is stopped or goes idle
    Worker {
        /// Process the due tasks and exit
        #[arg(long)]
        once: bool,
    },
    /// Inspect and clear distributed locks
    Locks {
        #[command(subcommand)]
        command: LocksCommand,
    },
    /// List queued tasks
    Tasks {
        /// Only tasks in this status
        #[arg(long)]
        status: Option<TaskStatus>,

        /// Maximum number of tasks to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show index, artifact and worker status
    Status,
}

/// Lock maintenance commands
#[derive(Subcommand, Debug)]
pub enum LocksCommand {
    /// List held locks with their holders
    List,
    /// Delete a lock regardless of holder (orphans left by dead builders)
    Release {
        /// Lock key, as shown by `discoverer locks list`
        key: String,
    },
}

/// Supported dataset formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    /// KML document with one placemark per portal
    Kml,
    /// Delimited text with a header row
    Csv,
}

impl From<FormatArg> for DatasetFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Kml => DatasetFormat::Kml,
            FormatArg::Csv => DatasetFormat::Csv,
        }
    }
}
