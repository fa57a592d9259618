//! Command-line interface.
//!
//! [`Cli`] carries the global overrides (`--config`, `--db`, `--worker-id`,
//! `--max-attempts`, `--verbose`) and one [`Command`].

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// draftline: a three-stage article authoring pipeline over SQLite.
#[derive(Debug, Parser)]
#[command(name = "draftline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (default: ./draftline.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Worker identity stamped on claimed drafts.
    #[arg(long, global = true)]
    pub worker_id: Option<String>,

    /// Transient failures allowed before a draft is marked FAILED.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(long)]
    pub title: String,

    #[arg(long, default_value = "")]
    pub link: String,

    #[arg(long, default_value = "general")]
    pub category: String,

    /// Raw source text.
    #[arg(long, conflicts_with = "content_file")]
    pub content: Option<String>,

    /// Read the raw source text from a file.
    #[arg(long)]
    pub content_file: Option<PathBuf>,

    /// Move the new draft straight to QUEUED.
    #[arg(long, default_value_t = false)]
    pub queue: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest a news item as a NEW draft.
    Add(AddArgs),

    /// Move a NEW draft to QUEUED.
    Queue { id: String },

    /// Run exactly one step: the given draft, or the oldest eligible one.
    Step {
        #[arg(long)]
        draft_id: Option<String>,
    },

    /// Run steps until nothing is eligible.
    Run {
        #[arg(long, default_value_t = 50)]
        max_steps: usize,
    },

    /// Stage counts and the most recent drafts.
    Status {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Full record of one draft as JSON.
    Show { id: String },

    /// Clear a lock left behind by a crashed worker.
    Release { id: String },

    /// Serve the HTTP trigger endpoint.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}
