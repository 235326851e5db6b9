//! Snapshot of the launch environment.
//!
//! Rank discovery reads the variables set by `torchrun`-style launchers and by
//! SLURM, and publishes the rendezvous endpoint back through `MASTER_ADDR` /
//! `MASTER_PORT`. All of that goes through a [`LaunchEnv`] taken once at
//! startup; [`LaunchEnv::export`] is the only place that writes the real
//! process environment.

use std::collections::BTreeMap;
use std::str::FromStr;

use super::error::{DistributedError, Result};

pub const RANK: &str = "RANK";
pub const WORLD_SIZE: &str = "WORLD_SIZE";
pub const LOCAL_RANK: &str = "LOCAL_RANK";
pub const MASTER_ADDR: &str = "MASTER_ADDR";
pub const MASTER_PORT: &str = "MASTER_PORT";

pub const SLURM_JOB_ID: &str = "SLURM_JOB_ID";
pub const SLURM_PROCID: &str = "SLURM_PROCID";
pub const SLURM_NTASKS: &str = "SLURM_NTASKS";
pub const SLURM_LOCALID: &str = "SLURM_LOCALID";
pub const SLURM_NODELIST: &str = "SLURM_NODELIST";

pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
pub const TMPDIR: &str = "TMPDIR";
pub const HOSTNAME: &str = "HOSTNAME";

/// Loopback address used when no rendezvous host is known.
pub const LOOPBACK: &str = "127.0.0.1";

/// Immutable view of the environment plus a record of pending writes.
#[derive(Debug, Clone, Default)]
pub struct LaunchEnv {
    vars: BTreeMap<String, String>,
    changes: Vec<(String, String)>,
}

impl LaunchEnv {
    /// Capture the current process environment.
    ///
    /// Variables whose name or value is not valid unicode are skipped.
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self {
            vars,
            changes: Vec::new(),
        }
    }

    /// Build a snapshot from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            changes: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Parse a variable, returning `Ok(None)` when it is absent.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| DistributedError::InvalidEnv {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
        }
    }

    /// Parse a variable that must be present.
    pub fn require<T: FromStr>(&self, key: &'static str) -> Result<T> {
        self.parse(key)?.ok_or(DistributedError::MissingEnv(key))
    }

    /// Set `key` unless it already has a value. Returns the effective value.
    pub fn set_default(&mut self, key: &str, value: impl Into<String>) -> &str {
        if !self.vars.contains_key(key) {
            let value = value.into();
            self.changes.push((key.to_string(), value.clone()));
            self.vars.insert(key.to_string(), value);
        }
        &self.vars[key]
    }

    /// Overwrite `key`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        self.changes.push((key.to_string(), value.clone()));
        self.vars.insert(key.to_string(), value);
    }

    /// Writes recorded since the snapshot was taken, in order.
    pub fn changes(&self) -> &[(String, String)] {
        &self.changes
    }

    /// Apply the recorded writes to the process environment.
    ///
    /// Must run before any other thread reads the environment.
    pub fn export(&mut self) {
        for (key, value) in self.changes.drain(..) {
            tracing::debug!(key = %key, value = %value, "exporting environment variable");
            std::env::set_var(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_present_absent_and_invalid() {
        let env = LaunchEnv::from_pairs([(RANK, "3"), (WORLD_SIZE, "four")]);
        assert_eq!(env.parse::<usize>(RANK).unwrap(), Some(3));
        assert_eq!(env.parse::<usize>(LOCAL_RANK).unwrap(), None);

        let err = env.parse::<usize>(WORLD_SIZE).unwrap_err();
        assert!(matches!(err, DistributedError::InvalidEnv { ref key, .. } if key == WORLD_SIZE));
    }

    #[test]
    fn require_reports_missing_key() {
        let env = LaunchEnv::default();
        let err = env.require::<usize>(SLURM_NTASKS).unwrap_err();
        assert!(matches!(err, DistributedError::MissingEnv(SLURM_NTASKS)));
    }

    #[test]
    fn set_default_keeps_explicit_value() {
        let mut env = LaunchEnv::from_pairs([(MASTER_ADDR, "10.0.0.5")]);
        assert_eq!(env.set_default(MASTER_ADDR, LOOPBACK), "10.0.0.5");
        assert_eq!(env.set_default(MASTER_PORT, "29500"), "29500");
        assert_eq!(
            env.changes(),
            &[(MASTER_PORT.to_string(), "29500".to_string())]
        );
    }

    #[test]
    fn set_records_overwrite() {
        let mut env = LaunchEnv::from_pairs([(TMPDIR, "/tmp")]);
        env.set(TMPDIR, "/scratch/42");
        assert_eq!(env.get(TMPDIR), Some("/scratch/42"));
        assert_eq!(env.changes().len(), 1);
    }

    #[test]
    fn export_writes_process_env() {
        let key = "DDP_CORE_ENV_EXPORT_TEST";
        std::env::remove_var(key);
        let mut env = LaunchEnv::from_process();
        env.set_default(key, "1");
        env.export();
        assert_eq!(std::env::var(key).as_deref(), Ok("1"));
        assert!(env.changes().is_empty());
        std::env::remove_var(key);
    }
}
