use anyhow::{Context, anyhow};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use turnscan_core::{
    PeripheralConfigProvider, PeripheralsConfiguration, PipelineError, TurnscanConfig,
};

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    Flag(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl ConfigSource {
    /// File backing the configuration, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Flag(path) | ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
                Some(path)
            }
            ConfigSource::Default | ConfigSource::EnvInline => None,
        }
    }
}

/// Loads the configuration.
///
/// Evaluation order:
/// 1) the `--config` path,
/// 2) `$TURNSCAN_CONFIG_PATH` (TOML or JSON file),
/// 3) `$TURNSCAN_CONFIG_JSON` (inline JSON),
/// 4) the first existing default file,
/// 5) defaults.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<(TurnscanConfig, ConfigSource)> {
    load_with(explicit, |key| env::var(key).ok())
}

fn load_with(
    explicit: Option<&Path>,
    var: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<(TurnscanConfig, ConfigSource)> {
    if let Some(path) = explicit {
        let config = load_from_file(path)?;
        return Ok((config, ConfigSource::Flag(path.to_path_buf())));
    }

    if let Some(path_str) = var("TURNSCAN_CONFIG_PATH")
        && !path_str.trim().is_empty()
    {
        let path = PathBuf::from(path_str);
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::EnvPath(path)));
    }

    if let Some(raw) = var("TURNSCAN_CONFIG_JSON")
        && !raw.trim().is_empty()
    {
        let parsed = parse_json(&raw).context("failed to parse TURNSCAN_CONFIG_JSON")?;
        return Ok((parsed, ConfigSource::EnvInline));
    }

    if let Some(path) = find_default_file() {
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::File(path)));
    }

    Ok((TurnscanConfig::default(), ConfigSource::Default))
}

pub fn load_from_file(path: &Path) -> anyhow::Result<TurnscanConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read turnscan config from {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents)
            .with_context(|| format!("invalid turnscan config {}", path.display())),
        Some("toml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid turnscan config {}: {}", path.display(), err)),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<TurnscanConfig> {
    // TOML first, then JSON.
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse turnscan config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<TurnscanConfig> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid turnscan config json: {err}"))
}

fn find_default_file() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &["turnscan.toml", "turnscan.json", "config/turnscan.toml"];

    CANDIDATES
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

/// Peripheral selection that follows edits to the config file between runs.
#[derive(Debug, Clone)]
pub struct ReloadingPeripheralConfig {
    path: Option<PathBuf>,
    initial: PeripheralsConfiguration,
}

impl ReloadingPeripheralConfig {
    pub fn new(source: &ConfigSource, initial: PeripheralsConfiguration) -> Self {
        Self {
            path: source.path().map(Path::to_path_buf),
            initial,
        }
    }
}

impl PeripheralConfigProvider for ReloadingPeripheralConfig {
    fn peripherals(&self) -> turnscan_core::Result<PeripheralsConfiguration> {
        match &self.path {
            Some(path) => load_from_file(path)
                .map(|config| config.peripherals)
                .map_err(|err| PipelineError::Configuration(format!("{err:#}"))),
            None => Ok(self.initial.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;
    use turnscan_core::PeripheralKind;

    const TOML: &str = r#"
project_root = "/srv/turnscan"

[peripherals.camera]
id = "gphoto2"
label = "gphoto2"
kind = "external-program-camera"
command = "/usr/bin/gphoto2"
arguments = "--filename {targetFile} --capture-image-and-download"

[capture]
trigger_timeout_ms = 8000
"#;

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let config = parse_from_str(TOML, "inline").unwrap();
        assert_eq!(config.project_root, PathBuf::from("/srv/turnscan"));
        assert_eq!(
            config.peripherals.camera.kind,
            PeripheralKind::ExternalProgramCamera
        );
        assert_eq!(config.capture.trigger_timeout_ms, 8000);
        assert_eq!(config.capture.watch_grace_ms, 2_500);
        assert_eq!(
            config.peripherals.turntable.kind,
            PeripheralKind::ManualTurntable
        );
    }

    #[test]
    fn explicit_path_wins_over_environment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, TOML).unwrap();

        let (config, source) = load_with(Some(&path), |_| {
            Some(r#"{"project_root": "/elsewhere"}"#.to_string())
        })
        .unwrap();
        assert_eq!(source, ConfigSource::Flag(path));
        assert_eq!(config.project_root, PathBuf::from("/srv/turnscan"));
    }

    #[test]
    fn inline_json_from_environment() {
        let (config, source) = load_with(None, |key| {
            (key == "TURNSCAN_CONFIG_JSON")
                .then(|| r#"{"project_root": "/from/env"}"#.to_string())
        })
        .unwrap();
        assert_eq!(source, ConfigSource::EnvInline);
        assert_eq!(config.project_root, PathBuf::from("/from/env"));
    }

    #[test]
    fn reloading_provider_reads_file_again() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("turnscan.toml");
        fs::write(&path, TOML).unwrap();
        let provider = ReloadingPeripheralConfig::new(
            &ConfigSource::File(path.clone()),
            PeripheralsConfiguration::default(),
        );
        assert_eq!(
            provider.peripherals().unwrap().camera.kind,
            PeripheralKind::ExternalProgramCamera
        );

        fs::write(&path, "").unwrap();
        assert_eq!(
            provider.peripherals().unwrap().camera.kind,
            PeripheralKind::FallbackCamera
        );

        fs::write(&path, "[peripherals\n").unwrap();
        assert!(matches!(
            provider.peripherals(),
            Err(PipelineError::Configuration(_))
        ));
    }
}
