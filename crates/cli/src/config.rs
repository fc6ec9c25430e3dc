//! `idena-flows.toml`
//!
//! ```toml
//! [poll]
//! interval_ms = 5000
//! max_interval_ms = 30000
//! backoff = 1.5
//! deadline_secs = 600
//!
//! [store]
//! kind = "file"
//! path = ".idena-flows"
//!
//! [simulation]
//! mine_after = 2
//! epoch = 100
//! balance = 1000.0
//!
//! [log]
//! level = "info"
//! ```
//!
//! Every field is optional. A missing file yields the defaults.

use anyhow::{Context, Result, bail};
use idn_adapters::{FileStore, LocalStore, MemoryStore};
use idn_workflow::PollPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub poll: PollConfig,
    pub store: StoreConfig,
    pub simulation: SimulationConfig,
    pub log: LogConfig,
}

/// `[poll]` section, used when waiting for transactions to be mined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff: f64,
    pub deadline_secs: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_interval_ms: 30_000,
            backoff: 1.5,
            deadline_secs: Some(600),
            max_attempts: None,
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> PollPolicy {
        let mut policy = PollPolicy::fixed(Duration::from_millis(self.interval_ms)).with_backoff(
            self.backoff,
            Duration::from_millis(self.max_interval_ms.max(self.interval_ms)),
        );
        if let Some(secs) = self.deadline_secs {
            policy = policy.with_deadline(Duration::from_secs(secs));
        }
        if let Some(attempts) = self.max_attempts {
            policy = policy.with_max_attempts(attempts);
        }
        policy
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

/// `[store]` section, where drafts and settings are kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: PathBuf::from(".idena-flows"),
        }
    }
}

impl StoreConfig {
    pub fn open(&self) -> Arc<dyn LocalStore> {
        match self.kind {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::File => Arc::new(FileStore::new(&self.path)),
        }
    }
}

/// `[simulation]` section, shaping the simulated node behind `simulate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Receipt polls before a transaction counts as mined
    pub mine_after: u32,
    pub epoch: u64,
    pub balance: f64,
    pub latency_ms: u64,
    /// Poll interval used instead of `[poll]` while simulating
    pub poll_interval_ms: u64,
    /// Give up on a scenario after this long
    pub timeout_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mine_after: 2,
            epoch: 100,
            balance: 1_000.0,
            latency_ms: 0,
            poll_interval_ms: 100,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Read `path`, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let poll = &self.poll;
        if poll.interval_ms == 0 {
            bail!("poll.interval_ms must be greater than zero");
        }
        if poll.max_interval_ms < poll.interval_ms {
            bail!(
                "poll.max_interval_ms ({}) is below poll.interval_ms ({})",
                poll.max_interval_ms,
                poll.interval_ms
            );
        }
        if !(1.0..=10.0).contains(&poll.backoff) {
            bail!("poll.backoff must be between 1.0 and 10.0, got {}", poll.backoff);
        }
        if poll.max_attempts == Some(0) {
            bail!("poll.max_attempts must be greater than zero");
        }
        if self.simulation.poll_interval_ms == 0 {
            bail!("simulation.poll_interval_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("idena-flows.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.poll.policy(), PollPolicy::default());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[poll]\ninterval_ms = 250\ndeadline_secs = 5\n\n[store]\nkind = \"file\"\npath = \"drafts\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.poll.interval_ms, 250);
        assert_eq!(config.poll.backoff, 1.5);
        assert_eq!(config.store.kind, StoreKind::File);
        assert_eq!(config.store.path, PathBuf::from("drafts"));
        assert_eq!(config.simulation.mine_after, 2);

        let policy = config.poll.policy();
        assert_eq!(policy.interval, Duration::from_millis(250));
        assert_eq!(policy.deadline, Some(Duration::from_secs(5)));
    }

    #[test]
    fn rejects_unknown_store_kind() {
        assert!(Config::parse("[store]\nkind = \"postgres\"").is_err());
    }

    #[test]
    fn rejects_unusable_poll_settings() {
        for raw in [
            "[poll]\nbackoff = nan",
            "[poll]\nbackoff = inf",
            "[poll]\nbackoff = -1.0",
            "[poll]\ninterval_ms = 0",
            "[poll]\ninterval_ms = 5000\nmax_interval_ms = 10",
            "[poll]\nmax_attempts = 0",
            "[simulation]\npoll_interval_ms = 0",
        ] {
            assert!(Config::parse(raw).is_err(), "accepted {:?}", raw);
        }

        let config = Config::parse("[poll]\nbackoff = 1.0\nmax_interval_ms = 5000").unwrap();
        assert_eq!(config.poll.policy().next_delay(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn invalid_file_names_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[poll]\nbackoff = -3.0").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("poll.backoff"));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let raw = config.to_toml().unwrap();
        assert_eq!(Config::parse(&raw).unwrap(), config);
    }
}
