//! Configuration resolution for Vigil.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/vigil/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binaries)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Complete Vigil configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub reclaim: ReclaimConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
}

/// Control plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Worker control channel listen address.
    pub listen_addr: String,
    /// Administrative listener; keep it on loopback.
    pub admin_addr: String,
    pub database_path: Option<PathBuf>,
    pub lease_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// How long a STOP/DRAIN waits for an ACK before force-releasing.
    pub drain_ack_timeout_secs: u64,
    /// A worker not seen for this long is stale and never assigned work.
    pub liveness_threshold_secs: u64,
    /// Oldest worker build accepted at REGISTER (semver).
    pub min_worker_version: String,
    /// Model version sent with every START intent.
    pub model_version: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7400".to_string(),
            admin_addr: "127.0.0.1:7401".to_string(),
            database_path: None,
            lease_ttl_secs: 90,
            heartbeat_interval_secs: 10,
            drain_ack_timeout_secs: 8,
            liveness_threshold_secs: 30,
            min_worker_version: "0.1.0-alpha.1".to_string(),
            model_version: "face-embed-v1".to_string(),
        }
    }
}

impl ControlConfig {
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub const fn drain_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_ack_timeout_secs)
    }

    pub const fn liveness_threshold(&self) -> Duration {
        Duration::from_secs(self.liveness_threshold_secs)
    }
}

/// Reclaim scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Sweep period.
    pub tick_secs: u64,
    /// Soft-to-hard reclaim grace window.
    pub grace_secs: u64,
    /// Per-site grace overrides, keyed by site id.
    pub site_grace_secs: HashMap<String, u64>,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            grace_secs: 90,
            site_grace_secs: HashMap::new(),
        }
    }
}

impl ReclaimConfig {
    pub const fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// Grace window for a site, falling back to the global default.
    pub fn grace_for(&self, site_id: &str) -> Duration {
        Duration::from_secs(
            self.site_grace_secs
                .get(site_id)
                .copied()
                .unwrap_or(self.grace_secs),
        )
    }
}

/// Edge worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub control_addr: String,
    pub tenant_id: String,
    pub site_id: String,
    /// Camera source kinds this worker can open (e.g. `rtsp`).
    pub source_types: Vec<String>,
    pub readiness_timeout_secs: u64,
    /// Consecutive unrecoverable pipeline faults before ERROR.
    pub max_consecutive_faults: u32,
    pub retry_initial_secs: u64,
    pub retry_max_secs: u64,
    /// Pipeline reconnect attempts before the worker drains (None = unlimited).
    pub max_retry_attempts: Option<u32>,
    /// Downstream ingestion endpoint; detections are only logged when unset.
    pub ingest_url: Option<String>,
    /// External pipeline executable launched per camera.
    pub pipeline_command: Option<PathBuf>,
    /// Leading arguments for `pipeline_command`.
    pub pipeline_args: Vec<String>,
    /// Where the worker keeps its generated id.
    pub state_dir: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            control_addr: "127.0.0.1:7400".to_string(),
            tenant_id: String::new(),
            site_id: String::new(),
            source_types: vec!["rtsp".to_string()],
            readiness_timeout_secs: 12,
            max_consecutive_faults: 3,
            retry_initial_secs: 1,
            retry_max_secs: 60,
            max_retry_attempts: Some(8),
            ingest_url: None,
            pipeline_command: None,
            pipeline_args: Vec::new(),
            state_dir: None,
        }
    }
}

impl WorkerSettings {
    pub const fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_value(&mut merged, load_config_file(&global_path)?);
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        merge_value(&mut merged, load_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/vigil/settings.json"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("vigil").join("settings.json"))
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`: objects merge key by key, anything else
/// replaces.
fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_value(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("VIGIL_LISTEN_ADDR") {
        config.control.listen_addr = val;
    }
    if let Ok(val) = std::env::var("VIGIL_LEASE_TTL_SECS")
        && let Ok(n) = val.parse()
    {
        config.control.lease_ttl_secs = n;
    }
    if let Ok(val) = std::env::var("VIGIL_RECLAIM_GRACE_SECS")
        && let Ok(n) = val.parse()
    {
        config.reclaim.grace_secs = n;
    }
    if let Ok(val) = std::env::var("VIGIL_CONTROL_ADDR") {
        config.worker.control_addr = val;
    }
    if let Ok(val) = std::env::var("VIGIL_INGEST_URL") {
        config.worker.ingest_url = Some(val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timeouts() {
        let config = Config::default();
        assert_eq!(config.control.lease_ttl(), Duration::from_secs(90));
        assert_eq!(config.control.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.reclaim.grace_for("any-site"), Duration::from_secs(90));
        assert_eq!(config.worker.readiness_timeout(), Duration::from_secs(12));
    }

    #[test]
    fn site_grace_override_wins() {
        let mut reclaim = ReclaimConfig::default();
        reclaim.site_grace_secs.insert("lobby".into(), 30);
        assert_eq!(reclaim.grace_for("lobby"), Duration::from_secs(30));
        assert_eq!(reclaim.grace_for("garage"), Duration::from_secs(90));
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"control": {"lease_ttl_secs": 45}, "reclaim": {"site_grace_secs": {"s1": 10}}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.control.lease_ttl_secs, 45);
        // Untouched keys keep their defaults
        assert_eq!(config.control.heartbeat_interval_secs, 10);
        assert_eq!(config.reclaim.grace_for("s1"), Duration::from_secs(10));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/vigil.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn merge_replaces_scalars_and_merges_objects() {
        let mut base = serde_json::json!({"a": {"x": 1, "y": 2}, "b": [1]});
        merge_value(&mut base, serde_json::json!({"a": {"y": 3}, "b": [2, 3]}));
        assert_eq!(base, serde_json::json!({"a": {"x": 1, "y": 3}, "b": [2, 3]}));
    }
}
