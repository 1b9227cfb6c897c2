use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{
    ModelEditorPeripheral, Peripheral, PeripheralInitParams, PeripheralKind, PeripheralLifecycle,
    PeripheralStatus, RunSlot,
};
use crate::config::PeripheralConfig;
use crate::creation::ModelSet;
use crate::error::{PipelineError, Result};
use crate::os::{MODEL_DIR, OsGateway, PROJECT_DIR, expand_arguments};
use crate::progress::ProgressMonitor;

const BLENDER_ARGUMENTS: &str =
    "--python {projectDir}/utils/Blender/blender-import.py\n-- {modelDir}";

#[derive(Clone, Debug)]
struct EditorRun {
    config: PeripheralConfig,
    project_root: PathBuf,
    monitor: Arc<ProgressMonitor>,
}

/// Opens model sets in an external 3D editor such as Blender.
pub struct ExternalProgramModelEditor {
    os: Arc<dyn OsGateway>,
    lifecycle: PeripheralLifecycle,
    run: RunSlot<EditorRun>,
}

impl ExternalProgramModelEditor {
    pub fn new(os: Arc<dyn OsGateway>) -> Self {
        Self {
            os,
            lifecycle: PeripheralLifecycle::new(PeripheralKind::ExternalProgramModelEditor),
            run: RunSlot::new(),
        }
    }
}

impl fmt::Debug for ExternalProgramModelEditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalProgramModelEditor")
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

#[async_trait]
impl Peripheral for ExternalProgramModelEditor {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::ExternalProgramModelEditor
    }

    async fn initialize(
        &self,
        monitor: Arc<ProgressMonitor>,
        params: PeripheralInitParams,
    ) -> Result<()> {
        if params.config.command().trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "model editor '{}' has no command configured",
                params.config.id
            )));
        }
        self.lifecycle.begin();
        self.run.set(EditorRun {
            config: params.config,
            project_root: params.project_root,
            monitor,
        });
        Ok(())
    }

    async fn status(&self, config: &PeripheralConfig) -> PeripheralStatus {
        if self.lifecycle.is_initialized() {
            return PeripheralStatus::Available;
        }
        if config.command().trim().is_empty() {
            PeripheralStatus::NotConfigured
        } else if self.os.is_executable(config.command()) {
            PeripheralStatus::Available
        } else {
            PeripheralStatus::NotExecutable
        }
    }

    async fn scan(&self) -> Vec<PeripheralConfig> {
        self.os
            .find_program("blender")
            .map(|path| {
                vec![PeripheralConfig::external(
                    self.kind(),
                    "blender",
                    path.to_string_lossy(),
                    BLENDER_ARGUMENTS,
                )]
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelEditorPeripheral for ExternalProgramModelEditor {
    async fn open(&self, model_set: &ModelSet) -> Result<()> {
        let run = self.run.get().ok_or_else(|| {
            PipelineError::peripheral(self.kind(), "editor opened before initialization")
        })?;

        run.monitor.update_label("start");
        let project_dir = run.project_root.to_string_lossy().into_owned();
        let model_dir = run
            .project_root
            .join(&model_set.directory)
            .to_string_lossy()
            .into_owned();
        let arguments = expand_arguments(
            run.config.arguments(),
            &[
                (PROJECT_DIR, project_dir.as_str()),
                (MODEL_DIR, model_dir.as_str()),
            ],
        );

        if self.os.execute(run.config.command(), &arguments).await {
            Ok(())
        } else {
            Err(PipelineError::peripheral(
                self.kind(),
                format!("'{}' could not open {model_dir}", run.config.command()),
            ))
        }
    }

    async fn teardown(&self) -> Result<()> {
        self.run.take();
        self.lifecycle.end();
        Ok(())
    }
}

/// Model editor that only reports where the model lives.
#[derive(Debug)]
pub struct FallbackModelEditor {
    lifecycle: PeripheralLifecycle,
}

impl FallbackModelEditor {
    pub fn new() -> Self {
        Self {
            lifecycle: PeripheralLifecycle::new(PeripheralKind::FallbackModelEditor),
        }
    }
}

impl Default for FallbackModelEditor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Peripheral for FallbackModelEditor {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::FallbackModelEditor
    }

    async fn initialize(
        &self,
        _monitor: Arc<ProgressMonitor>,
        _params: PeripheralInitParams,
    ) -> Result<()> {
        self.lifecycle.begin();
        Ok(())
    }

    async fn status(&self, _config: &PeripheralConfig) -> PeripheralStatus {
        PeripheralStatus::Available
    }
}

#[async_trait]
impl ModelEditorPeripheral for FallbackModelEditor {
    async fn open(&self, model_set: &ModelSet) -> Result<()> {
        info!(
            directory = %model_set.directory,
            "no model editor configured, open the model manually"
        );
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.lifecycle.end();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::os::MockOsGateway;

    #[tokio::test]
    async fn editor_receives_absolute_model_dir() {
        let mut os = MockOsGateway::new();
        os.expect_execute()
            .withf(|command, args| {
                command == "/usr/bin/blender"
                    && args
                        == [
                            "--python".to_string(),
                            "/srv/project/utils/Blender/blender-import.py".to_string(),
                            "--".to_string(),
                            "/srv/project/items/abc/def/abcdef/models/001".to_string(),
                        ]
            })
            .times(1)
            .returning(|_, _| true);

        let editor = ExternalProgramModelEditor::new(Arc::new(os));
        let config = PeripheralConfig::external(
            PeripheralKind::ExternalProgramModelEditor,
            "blender",
            "/usr/bin/blender",
            BLENDER_ARGUMENTS,
        );
        let monitor = Arc::new(ProgressMonitor::new("EditModel", "start"));
        editor
            .initialize(monitor, PeripheralInitParams::new(config, "/srv/project"))
            .await
            .unwrap();

        let model_set = ModelSet {
            directory: "items/abc/def/abcdef/models/001".to_string(),
            comment: "meshroom".to_string(),
        };
        editor.open(&model_set).await.unwrap();
        editor.teardown().await.unwrap();
    }
}
