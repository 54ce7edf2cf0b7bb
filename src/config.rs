use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{IsoprobeError, Result};

/// Persistence profile selected when a store is opened.
///
/// The profiles mirror the two vendor setups the experiments were written
/// against. They change how flushes are batched and what gets logged, never
/// the locking protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoreProfile {
    #[default]
    Hibernate,
    EclipseLink,
}

impl StoreProfile {
    /// Whether a flush applies all staged writes under a single acquisition of
    /// the table lock instead of one acquisition per write.
    pub fn batch_writing(self) -> bool {
        matches!(self, StoreProfile::EclipseLink)
    }

    /// Whether opening a store on an existing table drops its rows.
    pub fn drop_and_create(self) -> bool {
        matches!(self, StoreProfile::EclipseLink)
    }

    /// Whether row values may appear in log lines.
    pub fn log_parameters(self) -> bool {
        matches!(self, StoreProfile::EclipseLink)
    }

    pub fn name(self) -> &'static str {
        match self {
            StoreProfile::Hibernate => "hibernate",
            StoreProfile::EclipseLink => "eclipse",
        }
    }
}

impl FromStr for StoreProfile {
    type Err = IsoprobeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "hibernate" => Ok(StoreProfile::Hibernate),
            "eclipse" | "eclipselink" => Ok(StoreProfile::EclipseLink),
            other => Err(IsoprobeError::InvalidConfig(format!(
                "unknown store profile '{other}'"
            ))),
        }
    }
}

/// How the row table arbitrates readers against uncommitted writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConcurrencyControl {
    /// Flushed writes hold exclusive row locks; committed-only reads wait on them.
    #[default]
    Locking,
    /// Committed-only reads return the last committed version and never wait.
    Versioned,
}

impl FromStr for ConcurrencyControl {
    type Err = IsoprobeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "locking" => Ok(ConcurrencyControl::Locking),
            "versioned" | "mvcc" => Ok(ConcurrencyControl::Versioned),
            other => Err(IsoprobeError::InvalidConfig(format!(
                "unknown concurrency control '{other}'"
            ))),
        }
    }
}

/// Configuration of a [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub profile: StoreProfile,
    pub concurrency_control: ConcurrencyControl,
    /// Upper bound on how long a lock wait sleeps before re-checking its cancel token.
    pub lock_poll_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            profile: StoreProfile::default(),
            concurrency_control: ConcurrencyControl::default(),
            lock_poll_interval: Duration::from_millis(10),
        }
    }
}

impl StoreConfig {
    pub fn for_profile(profile: StoreProfile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }

    pub fn with_concurrency_control(mut self, concurrency_control: ConcurrencyControl) -> Self {
        self.concurrency_control = concurrency_control;
        self
    }

    /// Reads `ISOPROBE_PROFILE`, `ISOPROBE_CONCURRENCY` and `ISOPROBE_LOCK_POLL_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(profile) = lookup("ISOPROBE_PROFILE") {
            config.profile = profile.parse()?;
        }
        if let Some(cc) = lookup("ISOPROBE_CONCURRENCY") {
            config.concurrency_control = cc.parse()?;
        }
        if let Some(ms) = lookup("ISOPROBE_LOCK_POLL_MS") {
            config.lock_poll_interval = parse_millis("ISOPROBE_LOCK_POLL_MS", &ms)?;
        }
        if config.lock_poll_interval.is_zero() {
            return Err(IsoprobeError::InvalidConfig(
                "lock poll interval must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Timing bounds used by the experiment driver.
///
/// The gate orders the writer's checkpoints exactly; these bounds only cover
/// what the gate cannot see (how long a probe must stay pending to count as
/// blocked, how long to wait for a thread to finish). Tight values make the
/// experiments faster and more likely to flake on a loaded machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// How long a committed-only probe must stay pending to count as blocked.
    pub observation_window: Duration,
    /// Bound on waiting for the writer thread after `flushed` is released.
    pub join_timeout: Duration,
    /// Bound on polling for an eventually visible uncommitted change.
    pub eventual_timeout: Duration,
    /// Bound on waiting for the writer to reach a checkpoint or for a probe to park.
    pub settle_delay: Duration,
    /// How long a READ_UNCOMMITTED read may take before it counts as blocked.
    pub prompt_read_bound: Duration,
    pub poll_interval: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            observation_window: Duration::from_secs(3),
            join_timeout: Duration::from_secs(1),
            eventual_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
            prompt_read_bound: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl HarnessConfig {
    /// Reads `ISOPROBE_OBSERVATION_MS`, `ISOPROBE_JOIN_MS`, `ISOPROBE_EVENTUAL_MS`,
    /// `ISOPROBE_SETTLE_MS`, `ISOPROBE_PROMPT_READ_MS` and `ISOPROBE_POLL_MS` on top
    /// of the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let fields: [(&str, &mut Duration); 6] = [
            ("ISOPROBE_OBSERVATION_MS", &mut config.observation_window),
            ("ISOPROBE_JOIN_MS", &mut config.join_timeout),
            ("ISOPROBE_EVENTUAL_MS", &mut config.eventual_timeout),
            ("ISOPROBE_SETTLE_MS", &mut config.settle_delay),
            ("ISOPROBE_PROMPT_READ_MS", &mut config.prompt_read_bound),
            ("ISOPROBE_POLL_MS", &mut config.poll_interval),
        ];
        for (key, slot) in fields {
            if let Some(raw) = lookup(key) {
                *slot = parse_millis(key, &raw)?;
            }
        }
        if config.poll_interval.is_zero() {
            return Err(IsoprobeError::InvalidConfig(
                "poll interval must be positive".to_string(),
            ));
        }
        if config.prompt_read_bound.is_zero() {
            return Err(IsoprobeError::InvalidConfig(
                "prompt read bound must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| IsoprobeError::InvalidConfig(format!("{key}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap as HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn harness_defaults_apply_without_overrides() {
        let config = HarnessConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.observation_window, Duration::from_secs(3));
        assert_eq!(config.join_timeout, Duration::from_secs(1));
    }

    #[test]
    fn harness_overrides_are_read_in_millis() {
        let config = HarnessConfig::from_lookup(lookup_from(&[
            ("ISOPROBE_OBSERVATION_MS", "250"),
            ("ISOPROBE_POLL_MS", " 5 "),
            ("ISOPROBE_PROMPT_READ_MS", "400"),
        ]))
        .unwrap();
        assert_eq!(config.prompt_read_bound, Duration::from_millis(400));
        assert_eq!(config.observation_window, Duration::from_millis(250));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.eventual_timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = HarnessConfig::from_lookup(lookup_from(&[("ISOPROBE_JOIN_MS", "soon")]));
        assert!(matches!(err, Err(IsoprobeError::InvalidConfig(_))));

        let err = HarnessConfig::from_lookup(lookup_from(&[("ISOPROBE_POLL_MS", "0")]));
        assert!(matches!(err, Err(IsoprobeError::InvalidConfig(_))));
    }

    #[test]
    fn store_profile_is_selected_by_name() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            ("ISOPROBE_PROFILE", "eclipse"),
            ("ISOPROBE_CONCURRENCY", "mvcc"),
        ]))
        .unwrap();
        assert_eq!(config.profile, StoreProfile::EclipseLink);
        assert_eq!(config.concurrency_control, ConcurrencyControl::Versioned);
        assert!(config.profile.batch_writing());

        assert!("oracle".parse::<StoreProfile>().is_err());
        assert_eq!("".parse::<StoreProfile>().unwrap(), StoreProfile::Hibernate);
    }
}
