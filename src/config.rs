//! Configuration loaded from `draftline.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `ANTHROPIC_API_KEY` and `DRAFTLINE_DB` take precedence over the file;
//! command-line flags are applied on top by `main`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::pipeline::RetryPolicy;
use crate::pipeline::retry::MAX_BACKOFF_MINUTES;

const DEFAULT_FILE: &str = "draftline.toml";

/// Longest accepted lock timeout (one week).
const MAX_LOCK_TIMEOUT_MINUTES: i64 = 7 * 24 * 60;

/// Model and token limit for one authoring step.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StageModel {
    pub model: String,
    pub max_tokens: u32,
}

impl StageModel {
    fn sonnet(max_tokens: u32) -> Self {
        Self {
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens,
        }
    }
}

/// Per-step authoring settings. The final step writes the longest output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthoringConfig {
    pub compose: StageModel,
    pub revise: StageModel,
    pub finalize: StageModel,
}

impl Default for AuthoringConfig {
    fn default() -> Self {
        Self {
            compose: StageModel::sonnet(4096),
            revise: StageModel::sonnet(4096),
            finalize: StageModel::sonnet(8192),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Anthropic API key.
    #[serde(default)]
    pub api_key: String,

    /// SQLite database holding the drafts table.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Fixed worker identity. Generated per process when unset.
    #[serde(default)]
    pub worker_id: Option<String>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Age after which a held lock counts as abandoned.
    #[serde(default = "default_lock_timeout_minutes")]
    pub lock_timeout_minutes: i64,

    /// Overall timeout for one authoring request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Listen address for `serve`.
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default)]
    pub authoring: AuthoringConfig,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("draftline.db")
}

fn default_lock_timeout_minutes() -> i64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            db_path: default_db_path(),
            worker_id: None,
            retry: RetryPolicy::default(),
            lock_timeout_minutes: default_lock_timeout_minutes(),
            request_timeout_secs: default_request_timeout_secs(),
            bind: default_bind(),
            authoring: AuthoringConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from `path`, or from `draftline.toml` in the working directory.
    ///
    /// An explicitly named file must exist; the default one may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_FILE), false),
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<PipelineConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else if required {
            bail!("config file {} does not exist", path.display());
        } else {
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Environment overrides. Empty values are ignored.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            self.api_key = key;
        }
        if let Some(db) = lookup("DRAFTLINE_DB")
            && !db.is_empty()
        {
            self.db_path = PathBuf::from(db);
        }
    }

    /// Reject values that would break locking or retry scheduling.
    ///
    /// A lock must outlive the request it guards, otherwise a second worker
    /// can reclaim a draft whose step is still in flight.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_LOCK_TIMEOUT_MINUTES).contains(&self.lock_timeout_minutes) {
            bail!(
                "lock_timeout_minutes must be between 1 and {MAX_LOCK_TIMEOUT_MINUTES}, got {}",
                self.lock_timeout_minutes
            );
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        // Bounded by the check above.
        let lock_secs = self.lock_timeout_minutes as u64 * 60;
        if lock_secs <= self.request_timeout_secs {
            bail!(
                "lock_timeout_minutes ({}) must exceed request_timeout_secs ({}s)",
                self.lock_timeout_minutes,
                self.request_timeout_secs
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !(1..=MAX_BACKOFF_MINUTES).contains(&self.retry.backoff_step_minutes) {
            bail!(
                "retry.backoff_step_minutes must be between 1 and {MAX_BACKOFF_MINUTES}, got {}",
                self.retry.backoff_step_minutes
            );
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lock_timeout_minutes)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}
