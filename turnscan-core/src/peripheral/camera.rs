use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use tracing::{debug, info};

use super::{
    CameraPeripheral, Peripheral, PeripheralInitParams, PeripheralKind, PeripheralLifecycle,
    PeripheralStatus, RunSlot,
};
use crate::assets::UTILS_DIR;
use crate::config::PeripheralConfig;
use crate::error::{PipelineError, Result};
use crate::fs_repo::FileRepository;
use crate::os::{OsGateway, TARGET_FILE, expand_arguments};
use crate::progress::ProgressMonitor;

const GPHOTO2_ARGUMENTS: &str = "--filename {targetFile}\n--capture-image-and-download";
const DIGICAMCONTROL_ARGUMENTS: &str = "/filename {targetFile}\n/capture";
const DIGICAMCONTROL_PATH: &str = "C:\\Program Files (x86)\\digiCamControl\\CameraControlCmd.exe";

/// Camera driven by a command-line tool such as gphoto2 or digiCamControl.
pub struct ExternalProgramCamera {
    os: Arc<dyn OsGateway>,
    lifecycle: PeripheralLifecycle,
    config: RunSlot<PeripheralConfig>,
}

impl ExternalProgramCamera {
    pub fn new(os: Arc<dyn OsGateway>) -> Self {
        Self {
            os,
            lifecycle: PeripheralLifecycle::new(PeripheralKind::ExternalProgramCamera),
            config: RunSlot::new(),
        }
    }
}

impl fmt::Debug for ExternalProgramCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalProgramCamera")
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

#[async_trait]
impl Peripheral for ExternalProgramCamera {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::ExternalProgramCamera
    }

    async fn initialize(
        &self,
        _monitor: Arc<ProgressMonitor>,
        params: PeripheralInitParams,
    ) -> Result<()> {
        if params.config.command().trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "camera '{}' has no command configured",
                params.config.id
            )));
        }
        if self.lifecycle.begin() {
            self.config.take();
        }
        self.config.set(params.config);
        Ok(())
    }

    async fn status(&self, config: &PeripheralConfig) -> PeripheralStatus {
        if self.lifecycle.is_initialized() {
            return PeripheralStatus::Available;
        }
        if config.command().trim().is_empty() {
            return PeripheralStatus::NotConfigured;
        }
        if self.os.is_executable(config.command()) {
            PeripheralStatus::Available
        } else {
            PeripheralStatus::NotExecutable
        }
    }

    async fn scan(&self) -> Vec<PeripheralConfig> {
        let mut found = Vec::new();
        if let Some(path) = self.os.find_program("gphoto2") {
            found.push(PeripheralConfig::external(
                self.kind(),
                "gphoto2",
                path.to_string_lossy(),
                GPHOTO2_ARGUMENTS,
            ));
        }
        if cfg!(windows) && self.os.is_executable(DIGICAMCONTROL_PATH) {
            found.push(PeripheralConfig::external(
                self.kind(),
                "digiCamControl",
                DIGICAMCONTROL_PATH,
                DIGICAMCONTROL_ARGUMENTS,
            ));
        }
        found
    }
}

#[async_trait]
impl CameraPeripheral for ExternalProgramCamera {
    async fn capture_image(&self, target: &Path) -> Result<bool> {
        let config = self.config.get().ok_or_else(|| {
            PipelineError::peripheral(self.kind(), "capture requested before initialization")
        })?;

        let target_file = target.to_string_lossy();
        let arguments =
            expand_arguments(config.arguments(), &[(TARGET_FILE, target_file.as_ref())]);
        if !self.os.execute(config.command(), &arguments).await {
            return Err(PipelineError::peripheral(
                self.kind(),
                format!("'{}' could not capture {}", config.command(), target.display()),
            ));
        }
        Ok(true)
    }

    async fn teardown(&self) -> Result<()> {
        self.config.take();
        self.lifecycle.end();
        Ok(())
    }
}

/// Camera without hardware: writes a placeholder JPEG for every trigger.
///
/// Uses `utils/fallback-image.jpg` from the project when present.
pub struct FallbackCamera {
    fs: Arc<dyn FileRepository>,
    lifecycle: PeripheralLifecycle,
    run: RunSlot<FallbackRun>,
}

#[derive(Clone, Debug)]
struct FallbackRun {
    template: PathBuf,
    delay: Duration,
}

impl FallbackCamera {
    pub fn new(fs: Arc<dyn FileRepository>) -> Self {
        Self {
            fs,
            lifecycle: PeripheralLifecycle::new(PeripheralKind::FallbackCamera),
            run: RunSlot::new(),
        }
    }
}

impl fmt::Debug for FallbackCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackCamera")
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

#[async_trait]
impl Peripheral for FallbackCamera {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::FallbackCamera
    }

    async fn initialize(
        &self,
        _monitor: Arc<ProgressMonitor>,
        params: PeripheralInitParams,
    ) -> Result<()> {
        self.lifecycle.begin();
        let delay = params.config.setting::<u64>("delay_ms").unwrap_or(0);
        self.run.set(FallbackRun {
            template: params.project_root.join(UTILS_DIR).join("fallback-image.jpg"),
            delay: Duration::from_millis(delay),
        });
        Ok(())
    }

    async fn status(&self, _config: &PeripheralConfig) -> PeripheralStatus {
        PeripheralStatus::Available
    }
}

#[async_trait]
impl CameraPeripheral for FallbackCamera {
    async fn capture_image(&self, target: &Path) -> Result<bool> {
        let run = self.run.get().ok_or_else(|| {
            PipelineError::peripheral(self.kind(), "capture requested before initialization")
        })?;

        if !run.delay.is_zero() {
            tokio::time::sleep(run.delay).await;
        }

        if self.fs.exists(&run.template) {
            self.fs.copy(&run.template, target)?;
        } else {
            let bytes = tokio::task::spawn_blocking(placeholder_jpeg)
                .await
                .map_err(|err| PipelineError::Internal(err.to_string()))??;
            self.fs.write(target, &bytes)?;
        }

        debug!(path = %target.display(), "fallback camera wrote placeholder image");
        Ok(true)
    }

    async fn teardown(&self) -> Result<()> {
        self.run.take();
        self.lifecycle.end();
        info!("fallback camera torn down");
        Ok(())
    }
}

fn placeholder_jpeg() -> Result<Vec<u8>> {
    let image = RgbImage::from_fn(320, 240, |x, y| {
        let shade = if (x / 40 + y / 40) % 2 == 0 { 96 } else { 160 };
        Rgb([shade, shade, shade])
    });
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Jpeg)?;
    Ok(bytes.into_inner())
}
