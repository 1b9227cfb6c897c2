use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    ModelCreatorPeripheral, Peripheral, PeripheralInitParams, PeripheralKind,
    PeripheralLifecycle, PeripheralStatus, RunSlot,
};
use crate::assets::UTILS_DIR;
use crate::config::PeripheralConfig;
use crate::creation::ModelCreationResult;
use crate::error::{PipelineError, Result};
use crate::fs_repo::FileRepository;
use crate::os::{INPUT_DIR, OsGateway, PROJECT_DIR, expand_arguments, substitute};
use crate::progress::ProgressMonitor;

/// Result directory used when the configuration does not name one.
pub const DEFAULT_RESULT_DIR: &str = "{projectDir}/temp/export/";

#[derive(Clone, Debug)]
struct CreatorRun {
    config: PeripheralConfig,
    work_dir: PathBuf,
    project_root: PathBuf,
    monitor: Arc<ProgressMonitor>,
}

fn run_params(monitor: Arc<ProgressMonitor>, params: PeripheralInitParams) -> Result<CreatorRun> {
    let work_dir = params.work_dir.clone().ok_or_else(|| {
        PipelineError::InvalidArgument("model creators need a work directory".to_string())
    })?;
    Ok(CreatorRun {
        config: params.config,
        work_dir,
        project_root: params.project_root,
        monitor,
    })
}

/// Empties the work dir and copies the input images into it.
fn stage_images(fs: &dyn FileRepository, run: &CreatorRun, images: &[PathBuf]) -> Result<()> {
    fs.empty_dir(&run.work_dir)?;
    run.monitor.update_label("copyImages");
    let total = u32::try_from(images.len()).unwrap_or(u32::MAX);
    for (index, image) in images.iter().enumerate() {
        let Some(file_name) = image.file_name() else {
            continue;
        };
        fs.copy(image, &run.work_dir.join(file_name))?;
        run.monitor
            .update_progress(u32::try_from(index + 1).unwrap_or(u32::MAX), total);
    }
    Ok(())
}

/// Photogrammetry tool such as Meshroom, Metashape or RealityScan, run as an
/// external program.
///
/// Placeholders: `{projectDir}` in arguments and result dir, `{inputDir}`
/// for the directory holding the staged images.
pub struct ExternalProgramModelCreator {
    fs: Arc<dyn FileRepository>,
    os: Arc<dyn OsGateway>,
    lifecycle: PeripheralLifecycle,
    run: RunSlot<CreatorRun>,
}

impl ExternalProgramModelCreator {
    pub fn new(fs: Arc<dyn FileRepository>, os: Arc<dyn OsGateway>) -> Self {
        Self {
            fs,
            os,
            lifecycle: PeripheralLifecycle::new(PeripheralKind::ExternalProgramModelCreator),
            run: RunSlot::new(),
        }
    }
}

impl fmt::Debug for ExternalProgramModelCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalProgramModelCreator")
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

#[async_trait]
impl Peripheral for ExternalProgramModelCreator {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::ExternalProgramModelCreator
    }

    async fn initialize(
        &self,
        monitor: Arc<ProgressMonitor>,
        params: PeripheralInitParams,
    ) -> Result<()> {
        if params.config.command().trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "model creator '{}' has no command configured",
                params.config.id
            )));
        }
        self.lifecycle.begin();
        self.run.set(run_params(monitor, params)?);
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
        let mut found = Vec::new();
        let candidates = [
            (
                "meshroom",
                "meshroom_batch",
                "--input {inputDir} --output {projectDir}/temp/export",
            ),
            ("metashape", "metashape", ""),
        ];
        for (label, program, arguments) in candidates {
            if let Some(path) = self.os.find_program(program) {
                let mut config = PeripheralConfig::external(
                    self.kind(),
                    label,
                    path.to_string_lossy(),
                    arguments,
                );
                config.result_dir = Some(DEFAULT_RESULT_DIR.to_string());
                found.push(config);
            }
        }
        found
    }
}

#[async_trait]
impl ModelCreatorPeripheral for ExternalProgramModelCreator {
    async fn create_model(&self, images: &[PathBuf]) -> Result<ModelCreationResult> {
        let run = self.run.get().ok_or_else(|| {
            PipelineError::peripheral(
                self.kind(),
                "model creation requested before initialization",
            )
        })?;

        stage_images(self.fs.as_ref(), &run, images)?;

        let project_dir = run.project_root.to_string_lossy().into_owned();
        let input_dir = run.work_dir.to_string_lossy().into_owned();
        let template = run.config.result_dir.as_deref().unwrap_or(DEFAULT_RESULT_DIR);
        let result_dir =
            PathBuf::from(substitute(template, &[(PROJECT_DIR, project_dir.as_str())]));
        self.fs.empty_dir(&result_dir)?;

        run.monitor.update_label("createModelStart");
        let arguments = expand_arguments(
            run.config.arguments(),
            &[
                (PROJECT_DIR, project_dir.as_str()),
                (INPUT_DIR, input_dir.as_str()),
            ],
        );
        if !self.os.execute(run.config.command(), &arguments).await {
            warn!(
                command = run.config.command(),
                "model creator exited unsuccessfully, checking its output anyway"
            );
        }

        Ok(ModelCreationResult {
            result_dir,
            comment: run.config.label.clone(),
            empty_output_allowed: false,
        })
    }

    async fn teardown(&self) -> Result<()> {
        self.run.take();
        self.lifecycle.end();
        Ok(())
    }
}

/// Model creator without a photogrammetry tool.
///
/// Copies `utils/fallback-model.*` from the project when present and
/// otherwise produces an empty export, which is accepted.
pub struct FallbackModelCreator {
    fs: Arc<dyn FileRepository>,
    lifecycle: PeripheralLifecycle,
    run: RunSlot<CreatorRun>,
}

impl FallbackModelCreator {
    pub fn new(fs: Arc<dyn FileRepository>) -> Self {
        Self {
            fs,
            lifecycle: PeripheralLifecycle::new(PeripheralKind::FallbackModelCreator),
            run: RunSlot::new(),
        }
    }
}

impl fmt::Debug for FallbackModelCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackModelCreator")
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

fn fallback_model_files(fs: &dyn FileRepository, utils_dir: &Path) -> Vec<PathBuf> {
    if !fs.exists(utils_dir) {
        return Vec::new();
    }
    fs.list(utils_dir)
        .unwrap_or_default()
        .into_iter()
        .filter(|path| {
            path.file_stem()
                .is_some_and(|stem| stem.to_string_lossy() == "fallback-model")
        })
        .collect()
}

#[async_trait]
impl Peripheral for FallbackModelCreator {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::FallbackModelCreator
    }

    async fn initialize(
        &self,
        monitor: Arc<ProgressMonitor>,
        params: PeripheralInitParams,
    ) -> Result<()> {
        self.lifecycle.begin();
        self.run.set(run_params(monitor, params)?);
        Ok(())
    }

    async fn status(&self, _config: &PeripheralConfig) -> PeripheralStatus {
        PeripheralStatus::Available
    }
}

#[async_trait]
impl ModelCreatorPeripheral for FallbackModelCreator {
    async fn create_model(&self, images: &[PathBuf]) -> Result<ModelCreationResult> {
        let run = self.run.get().ok_or_else(|| {
            PipelineError::peripheral(
                self.kind(),
                "model creation requested before initialization",
            )
        })?;

        let result_dir = run.work_dir.join("export");
        self.fs.empty_dir(&result_dir)?;

        let models = fallback_model_files(self.fs.as_ref(), &run.project_root.join(UTILS_DIR));
        for model in &models {
            if let Some(file_name) = model.file_name() {
                self.fs.copy(model, &result_dir.join(file_name))?;
            }
        }
        info!(
            images = images.len(),
            files = models.len(),
            "fallback model creator finished"
        );

        Ok(ModelCreationResult {
            result_dir,
            comment: "fallback".to_string(),
            empty_output_allowed: true,
        })
    }

    async fn teardown(&self) -> Result<()> {
        self.run.take();
        self.lifecycle.end();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fs_repo::FilesystemFileRepository;
    use crate::os::MockOsGateway;

    use std::fs;
    use tempfile::tempdir;

    fn monitor() -> Arc<ProgressMonitor> {
        Arc::new(ProgressMonitor::new("CreateModel", "start"))
    }

    #[tokio::test]
    async fn external_creator_stages_images_and_runs_tool() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let image = root.join("items/abc/def/abcdef/images/001.jpg");
        fs::create_dir_all(image.parent().unwrap()).unwrap();
        fs::write(&image, b"jpg").unwrap();

        let expected_input = root.join("temp").to_string_lossy().into_owned();
        let mut os = MockOsGateway::new();
        os.expect_execute()
            .withf(move |command, args| {
                command == "/opt/meshroom/meshroom_batch" && args[1] == expected_input
            })
            .times(1)
            .returning(|_, _| true);

        let creator =
            ExternalProgramModelCreator::new(Arc::new(FilesystemFileRepository), Arc::new(os));
        let config = PeripheralConfig::external(
            PeripheralKind::ExternalProgramModelCreator,
            "meshroom",
            "/opt/meshroom/meshroom_batch",
            "--input {inputDir}",
        );
        let params = PeripheralInitParams::new(config, &root).with_work_dir(root.join("temp"));
        creator.initialize(monitor(), params).await.unwrap();

        let result = creator.create_model(&[image]).await.unwrap();
        assert_eq!(result.result_dir, root.join("temp/export/"));
        assert_eq!(result.comment, "meshroom");
        assert!(!result.empty_output_allowed);
        assert!(root.join("temp/001.jpg").is_file());
        assert!(result.result_dir.is_dir());
        creator.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn fallback_creator_allows_empty_output() {
        let tmp = tempdir().unwrap();
        let creator = FallbackModelCreator::new(Arc::new(FilesystemFileRepository));
        let params = PeripheralInitParams::new(
            PeripheralConfig::fallback(PeripheralKind::FallbackModelCreator),
            tmp.path(),
        )
        .with_work_dir(tmp.path().join("temp"));
        creator.initialize(monitor(), params).await.unwrap();

        let result = creator.create_model(&[]).await.unwrap();
        assert_eq!(result.result_dir, tmp.path().join("temp/export"));
        assert!(result.empty_output_allowed);
        assert!(result.result_dir.is_dir());
    }

    #[tokio::test]
    async fn fallback_creator_copies_shipped_model() {
        let tmp = tempdir().unwrap();
        let utils = tmp.path().join(UTILS_DIR);
        fs::create_dir_all(&utils).unwrap();
        fs::write(utils.join("fallback-model.obj"), b"o cube").unwrap();
        fs::write(utils.join("fallback-model.mtl"), b"newmtl a").unwrap();
        fs::write(utils.join("other.txt"), b"x").unwrap();

        let creator = FallbackModelCreator::new(Arc::new(FilesystemFileRepository));
        let params = PeripheralInitParams::new(
            PeripheralConfig::fallback(PeripheralKind::FallbackModelCreator),
            tmp.path(),
        )
        .with_work_dir(tmp.path().join("temp"));
        creator.initialize(monitor(), params).await.unwrap();

        let result = creator.create_model(&[]).await.unwrap();
        let mut names: Vec<_> = fs::read_dir(&result.result_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["fallback-model.mtl", "fallback-model.obj"]);
    }
}
