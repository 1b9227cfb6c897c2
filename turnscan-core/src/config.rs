//! Configuration types for peripherals and orchestration timing.
//!
//! Loading from disk or environment is left to the binary; this module only
//! defines the serde shapes and their defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::peripheral::{PeripheralKind, PeripheralRole};

/// Top-level configuration consumed by the orchestrators.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnscanConfig {
    /// Project root holding `items/`, `temp/` and `utils/`.
    pub project_root: PathBuf,
    pub peripherals: PeripheralsConfiguration,
    pub capture: CaptureTuning,
    pub watch: WatchConfig,
}

impl Default for TurnscanConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            peripherals: PeripheralsConfiguration::default(),
            capture: CaptureTuning::default(),
            watch: WatchConfig::default(),
        }
    }
}

/// Configuration of one concrete peripheral instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Opaque identifier, stable across edits.
    pub id: String,
    /// Human readable name, used as the model set comment.
    pub label: String,
    pub kind: PeripheralKind,
    /// Executable path for external-program peripherals.
    pub command: Option<String>,
    /// Argument template with `{placeholder}` substitution. Arguments are
    /// separated by whitespace or newlines.
    pub arguments: Option<String>,
    /// Result directory template for model creators.
    pub result_dir: Option<String>,
    /// Free-form settings interpreted by the selected implementation.
    pub settings: BTreeMap<String, String>,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self::fallback(PeripheralKind::FallbackCamera)
    }
}

impl PeripheralConfig {
    /// Configuration selecting `kind` with no command or settings.
    pub fn fallback(kind: PeripheralKind) -> Self {
        Self {
            id: kind.as_str().to_string(),
            label: kind.label().to_string(),
            kind,
            command: None,
            arguments: None,
            result_dir: None,
            settings: BTreeMap::new(),
        }
    }

    pub fn external(
        kind: PeripheralKind,
        label: impl Into<String>,
        command: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            command: Some(command.into()),
            arguments: Some(arguments.into()),
            ..Self::fallback(kind)
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Parses a setting, ignoring values that do not parse.
    pub fn setting<T: FromStr>(&self, key: &str) -> Option<T> {
        self.settings.get(key).and_then(|value| value.trim().parse().ok())
    }

    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or_default()
    }

    pub fn arguments(&self) -> &str {
        self.arguments.as_deref().unwrap_or_default()
    }
}

/// The selected peripheral per role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralsConfiguration {
    pub turntable: PeripheralConfig,
    pub camera: PeripheralConfig,
    pub background_removal: PeripheralConfig,
    pub model_creator: PeripheralConfig,
    pub model_editor: PeripheralConfig,
}

impl Default for PeripheralsConfiguration {
    fn default() -> Self {
        Self {
            turntable: PeripheralConfig::fallback(PeripheralKind::ManualTurntable),
            camera: PeripheralConfig::fallback(PeripheralKind::FallbackCamera),
            background_removal: PeripheralConfig::fallback(
                PeripheralKind::FallbackBackgroundRemoval,
            ),
            model_creator: PeripheralConfig::fallback(PeripheralKind::FallbackModelCreator),
            model_editor: PeripheralConfig::fallback(PeripheralKind::FallbackModelEditor),
        }
    }
}

impl PeripheralsConfiguration {
    pub fn for_role(&self, role: PeripheralRole) -> &PeripheralConfig {
        match role {
            PeripheralRole::Turntable => &self.turntable,
            PeripheralRole::Camera => &self.camera,
            PeripheralRole::BackgroundRemoval => &self.background_removal,
            PeripheralRole::ModelCreator => &self.model_creator,
            PeripheralRole::ModelEditor => &self.model_editor,
        }
    }
}

/// Source of the current peripheral selection.
///
/// Orchestrators ask again on every run since the selection may change
/// between runs.
pub trait PeripheralConfigProvider: Send + Sync {
    fn peripherals(&self) -> Result<PeripheralsConfiguration>;
}

/// Fixed in-memory peripheral selection.
#[derive(Clone, Debug, Default)]
pub struct StaticPeripheralConfig(pub PeripheralsConfiguration);

impl PeripheralConfigProvider for StaticPeripheralConfig {
    fn peripherals(&self) -> Result<PeripheralsConfiguration> {
        Ok(self.0.clone())
    }
}

/// Timing knobs for the capture loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureTuning {
    /// Total budget for one camera trigger, retries included.
    pub trigger_timeout_ms: u64,
    /// Pause between failed camera trigger attempts.
    pub trigger_retry_interval_ms: u64,
    /// How long the watcher may keep draining after the last trigger.
    pub watch_grace_ms: u64,
    /// Readiness polls before a new file is declared stuck.
    pub readiness_attempts: u32,
    /// Sleep between readiness polls.
    pub readiness_interval_ms: u64,
}

impl Default for CaptureTuning {
    fn default() -> Self {
        Self {
            trigger_timeout_ms: 5_000,
            trigger_retry_interval_ms: 100,
            watch_grace_ms: 2_500,
            readiness_attempts: 100,
            readiness_interval_ms: 100,
        }
    }
}

impl CaptureTuning {
    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_timeout_ms)
    }

    pub fn trigger_retry_interval(&self) -> Duration {
        Duration::from_millis(self.trigger_retry_interval_ms.max(1))
    }

    pub fn watch_grace(&self) -> Duration {
        Duration::from_millis(self.watch_grace_ms)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms.max(1))
    }
}

/// Directory watcher settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Subscribe to OS change notifications. The fallback poll always runs.
    pub notify_events: bool,
    /// Capacity of the channel between the notify thread and the watch task.
    pub channel_capacity: usize,
    /// Interval of the fallback directory poll for filesystems without
    /// reliable change notifications.
    pub poll_interval_ms: u64,
    /// Delay after starting the watcher before the first trigger.
    pub settle_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            notify_events: true,
            channel_capacity: 256,
            poll_interval_ms: 500,
            settle_ms: 50,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_in_defaults() {
        let json = r#"{
            "project_root": "/srv/scans",
            "peripherals": {
                "camera": {
                    "kind": "external-program-camera",
                    "command": "/usr/bin/gphoto2",
                    "arguments": "--filename {targetFile}\n--capture-image-and-download"
                }
            },
            "capture": { "watch_grace_ms": 10 }
        }"#;

        let config: TurnscanConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.project_root, PathBuf::from("/srv/scans"));
        assert_eq!(
            config.peripherals.camera.kind,
            PeripheralKind::ExternalProgramCamera
        );
        assert_eq!(config.peripherals.camera.command(), "/usr/bin/gphoto2");
        assert_eq!(
            config.peripherals.turntable.kind,
            PeripheralKind::ManualTurntable
        );
        assert_eq!(config.capture.watch_grace_ms, 10);
        assert_eq!(config.capture.trigger_timeout_ms, 5_000);
    }

    #[test]
    fn settings_parse_on_demand() {
        let config = PeripheralConfig::fallback(PeripheralKind::ChromaKeyBackgroundRemoval)
            .with_setting("tolerance", " 42 ")
            .with_setting("threads", "many");
        assert_eq!(config.setting::<u8>("tolerance"), Some(42));
        assert_eq!(config.setting::<usize>("threads"), None);
        assert_eq!(config.setting::<usize>("missing"), None);
    }
}
