//! Engine configuration.

use crate::amount::Amount;
use crate::error::BountyError;
use crate::events::normalize_repo_url;
use crate::repository::ReportStorageConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hex secret of the node identity; generated per process when unset.
    pub secret_key: Option<String>,

    /// Root directory for per-identity token files.
    pub data_dir: PathBuf,

    /// Report repository backend.
    pub report_storage: ReportStorageConfig,

    /// Tracked inboxes.
    pub inboxes: Vec<InboxConfig>,

    /// Inclusion proof wait bound in seconds.
    pub proof_timeout_secs: u64,

    /// Relay publish bound in seconds.
    pub publish_timeout_secs: u64,

    /// Interval between sync cursor checkpoints in seconds.
    pub checkpoint_interval_secs: u64,

    /// How far before the cursor a backfill starts, in seconds.
    pub replay_overlap_secs: i64,

    /// Backfill window when an inbox has no cursor yet, in seconds.
    pub default_lookback_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            data_dir: PathBuf::from("./data"),
            report_storage: ReportStorageConfig::Memory,
            inboxes: Vec::new(),
            proof_timeout_secs: 30,
            publish_timeout_secs: 10,
            checkpoint_interval_secs: 30,
            replay_overlap_secs: 300,
            default_lookback_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl EngineConfig {
    pub fn proof_timeout(&self) -> Duration {
        Duration::from_secs(self.proof_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs.max(1))
    }
}

/// A repository an inbox accepts reports for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRepo {
    pub url: String,
    /// Reward paid on accept when the caller gives none.
    pub default_reward: Option<Amount>,
}

impl TrackedRepo {
    pub fn new(url: impl Into<String>, default_reward: Option<Amount>) -> Self {
        Self {
            url: url.into(),
            default_reward,
        }
    }

    pub fn matches(&self, repo_url: &str) -> bool {
        normalize_repo_url(&self.url) == normalize_repo_url(repo_url)
    }
}

/// One receiving identity and the repositories it tracks.
#[derive(Debug, Clone)]
pub struct InboxConfig {
    /// Hex secret of the inbox identity.
    pub secret_key: String,
    pub repos: Vec<TrackedRepo>,
}

impl InboxConfig {
    pub fn new(secret_key: impl Into<String>, repos: Vec<TrackedRepo>) -> Self {
        Self {
            secret_key: secret_key.into(),
            repos,
        }
    }

    pub fn tracks(&self, repo_url: &str) -> bool {
        self.repos.iter().any(|repo| repo.matches(repo_url))
    }

    pub fn default_reward(&self, repo_url: &str) -> Option<Amount> {
        self.repos
            .iter()
            .find(|repo| repo.matches(repo_url))
            .and_then(|repo| repo.default_reward.clone())
    }
}

/// Parses `secret=repo[@reward],repo[@reward]`.
impl FromStr for InboxConfig {
    type Err = BountyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (secret, repos) = value.split_once('=').ok_or_else(|| {
            BountyError::Validation(format!("inbox '{value}' must look like secret=repo[@reward],..."))
        })?;

        let repos = repos
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.rsplit_once('@') {
                // `git@host:path` locators carry an '@' of their own.
                Some((url, reward)) if reward.chars().all(|c| c.is_ascii_digit()) && !reward.is_empty() => {
                    Ok(TrackedRepo::new(url, Some(reward.parse::<Amount>()?)))
                }
                _ => Ok(TrackedRepo::new(entry, None)),
            })
            .collect::<Result<Vec<_>, BountyError>>()?;

        if repos.is_empty() {
            return Err(BountyError::Validation(format!(
                "inbox '{value}' tracks no repositories"
            )));
        }

        Ok(Self::new(secret.trim(), repos))
    }
}
