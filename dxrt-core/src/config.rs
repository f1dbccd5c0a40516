//! Service startup configuration — ambient addition, not in spec.md's core
//! (§1 excludes *model*-file config parsing as a Non-goal; the daemon's own
//! startup config is not that, see SPEC_FULL.md §6). Loaded from an optional
//! TOML file with environment-variable overrides, grounded on
//! `original_source/lib/configuration.cpp`'s device-file-prefix / queue-name
//! knobs and on the env vars named in spec.md §6.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::device::pool::{ENV_DEVICE_FILE_PREFIX, ENV_FORCE_DEVICE_ID, ENV_FORCE_NUM_DEV};
use crate::error::{ErrorKind, Result, ServiceError};
use crate::scheduler::SchedPolicyKind;

fn default_queue_name() -> String {
    "dxrt_ipc_queue".to_string()
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from("/var/log/dxrt")
}

/// Startup configuration for `dxrtd`. Every field has a sensible default so
/// `--config` is optional; CLI flags and environment variables both take
/// precedence over the file (`apply_env_overrides` is applied last).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub scheduler_policy: SchedPolicyKind,
    #[serde(default = "default_queue_name")]
    pub ipc_queue_name: String,
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,
    pub device_file_prefix: Option<String>,
    pub force_num_dev: Option<u32>,
    pub force_device_id: Option<u32>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            scheduler_policy: SchedPolicyKind::Fifo,
            ipc_queue_name: default_queue_name(),
            dump_dir: default_dump_dir(),
            device_file_prefix: None,
            force_num_dev: None,
            force_device_id: None,
        }
    }
}

impl ServiceConfig {
    /// Load from `path` if given, else fall back to defaults; either way,
    /// environment-variable overrides are applied afterward.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|_| ServiceError::new(ErrorKind::FileNotFound, -1))?;
                toml::from_str(&text)
                    .map_err(|_| ServiceError::new(ErrorKind::InvalidArgument, -1))?
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Push the device-enumeration knobs named in spec.md §6 into the
    /// process environment so `DevicePool::discover` picks them up, without
    /// requiring every caller to thread `ServiceConfig` through the pool.
    fn apply_env_overrides(&mut self) {
        if let Ok(prefix) = std::env::var(ENV_DEVICE_FILE_PREFIX) {
            self.device_file_prefix = Some(prefix);
        } else if let Some(prefix) = &self.device_file_prefix {
            // SAFETY: single-threaded startup path, before any device or
            // watchdog thread is spawned.
            unsafe { std::env::set_var(ENV_DEVICE_FILE_PREFIX, prefix) };
        }

        if let Ok(n) = std::env::var(ENV_FORCE_NUM_DEV) {
            self.force_num_dev = n.parse().ok();
        } else if let Some(n) = self.force_num_dev {
            unsafe { std::env::set_var(ENV_FORCE_NUM_DEV, n.to_string()) };
        }

        if let Ok(id) = std::env::var(ENV_FORCE_DEVICE_ID) {
            self.force_device_id = id.parse().ok();
        } else if let Some(id) = self.force_device_id {
            unsafe { std::env::set_var(ENV_FORCE_DEVICE_ID, id.to_string()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_a_config_file() {
        let cfg = ServiceConfig::load(None).unwrap();
        assert_eq!(cfg.scheduler_policy, SchedPolicyKind::Fifo);
        assert_eq!(cfg.ipc_queue_name, "dxrt_ipc_queue");
    }

    #[test]
    fn missing_config_file_is_a_file_not_found_error() {
        let err = ServiceConfig::load(Some(Path::new("/nonexistent/dxrt.toml"))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FileNotFound);
    }

    #[test]
    fn parses_scheduler_policy_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dxrt.toml");
        std::fs::write(&path, "scheduler_policy = \"RoundRobin\"\n").unwrap();
        let cfg = ServiceConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.scheduler_policy, SchedPolicyKind::RoundRobin);
    }
}
