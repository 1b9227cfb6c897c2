#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use turnscan_core::config::{CaptureTuning, WatchConfig};
use turnscan_core::peripheral::{
    BackgroundRemovalPeripheral, CameraPeripheral, ModelCreatorPeripheral, ModelEditorPeripheral,
    Peripheral, PeripheralInitParams, PeripheralKind, PeripheralStatus, TurntablePeripheral,
};
use turnscan_core::{
    ModelCreationResult, ModelSet, PeripheralConfig, PeripheralRegistry, PipelineError,
    ProgressMonitor, Result,
};

pub const ITEM_ID: &str = "0a1b2c3d4e";

#[derive(Debug, Default)]
pub struct Calls {
    pub initialize: AtomicUsize,
    pub teardown: AtomicUsize,
    pub operations: AtomicUsize,
}

impl Calls {
    pub fn initialized(&self) -> usize {
        self.initialize.load(Ordering::SeqCst)
    }

    pub fn torn_down(&self) -> usize {
        self.teardown.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }
}

pub fn fast_tuning() -> CaptureTuning {
    CaptureTuning {
        trigger_timeout_ms: 300,
        trigger_retry_interval_ms: 20,
        watch_grace_ms: 5_000,
        readiness_attempts: 100,
        readiness_interval_ms: 10,
    }
}

pub fn fast_watch() -> WatchConfig {
    WatchConfig {
        poll_interval_ms: 50,
        settle_ms: 10,
        ..WatchConfig::default()
    }
}

#[derive(Debug, Default)]
pub struct RecordingTurntable {
    pub calls: Calls,
    pub divisions: Mutex<Vec<u32>>,
}

#[async_trait]
impl Peripheral for RecordingTurntable {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::ManualTurntable
    }

    async fn initialize(&self, _: Arc<ProgressMonitor>, _: PeripheralInitParams) -> Result<()> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self, _: &PeripheralConfig) -> PeripheralStatus {
        PeripheralStatus::Available
    }
}

#[async_trait]
impl TurntablePeripheral for RecordingTurntable {
    async fn rotate(&self, divisions: u32) -> Result<()> {
        self.calls.operations.fetch_add(1, Ordering::SeqCst);
        self.divisions.lock().unwrap().push(divisions);
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.calls.teardown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Where and what a [`RecordingCamera`] writes per trigger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Shot {
    /// A small file at the requested target.
    #[default]
    AtTarget,
    /// `<n>.jpg` next to the target, counting up from the given number,
    /// like a camera that ignores the requested file name.
    Unpadded(usize),
    /// An empty file at the requested target that never fills up.
    Empty,
}

/// Camera writing a small file per trigger.
#[derive(Debug, Default)]
pub struct RecordingCamera {
    pub calls: Calls,
    /// Never captures anything.
    pub broken: bool,
    pub shot: Shot,
    /// Cancels the run after this many captures.
    pub cancel_after: Option<usize>,
    monitor: Mutex<Option<Arc<ProgressMonitor>>>,
}

impl RecordingCamera {
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn cancelling_after(captures: usize) -> Self {
        Self {
            cancel_after: Some(captures),
            ..Self::default()
        }
    }

    pub fn shooting(shot: Shot) -> Self {
        Self {
            shot,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Peripheral for RecordingCamera {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::FallbackCamera
    }

    async fn initialize(
        &self,
        monitor: Arc<ProgressMonitor>,
        _: PeripheralInitParams,
    ) -> Result<()> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        *self.monitor.lock().unwrap() = Some(monitor);
        Ok(())
    }

    async fn status(&self, _: &PeripheralConfig) -> PeripheralStatus {
        PeripheralStatus::Available
    }
}

#[async_trait]
impl CameraPeripheral for RecordingCamera {
    async fn capture_image(&self, target: &Path) -> Result<bool> {
        if self.broken {
            return Ok(false);
        }
        let taken = self.calls.operations();
        match self.shot {
            Shot::AtTarget => fs::write(target, b"\xFF\xD8 not really a jpeg \xFF\xD9").unwrap(),
            Shot::Unpadded(first) => {
                let path = target.with_file_name(format!("{}.jpg", first + taken));
                fs::write(path, b"\xFF\xD8 not really a jpeg \xFF\xD9").unwrap();
            }
            Shot::Empty => fs::write(target, b"").unwrap(),
        }
        let captured = self.calls.operations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.cancel_after == Some(captured)
            && let Some(monitor) = self.monitor.lock().unwrap().as_ref()
        {
            monitor.cancel();
        }
        Ok(true)
    }

    async fn teardown(&self) -> Result<()> {
        self.calls.teardown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Background remover writing `<stem>.png` next to each image.
#[derive(Debug, Default)]
pub struct RecordingBackgroundRemoval {
    pub calls: Calls,
    /// Reports a failed removal from `teardown`.
    pub failing: bool,
    produced: Mutex<Vec<PathBuf>>,
}

impl RecordingBackgroundRemoval {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Peripheral for RecordingBackgroundRemoval {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::FallbackBackgroundRemoval
    }

    async fn initialize(&self, _: Arc<ProgressMonitor>, _: PeripheralInitParams) -> Result<()> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        self.produced.lock().unwrap().clear();
        Ok(())
    }

    async fn status(&self, _: &PeripheralConfig) -> PeripheralStatus {
        PeripheralStatus::Available
    }
}

#[async_trait]
impl BackgroundRemovalPeripheral for RecordingBackgroundRemoval {
    async fn remove_background(&self, image: &Path) -> Result<()> {
        self.calls.operations.fetch_add(1, Ordering::SeqCst);
        let target = image.with_extension("png");
        fs::write(&target, b"png").unwrap();
        self.produced.lock().unwrap().push(target);
        Ok(())
    }

    async fn teardown(&self) -> Result<Option<Vec<PathBuf>>> {
        self.calls.teardown.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(PipelineError::peripheral(
                self.kind(),
                "remover exited without writing an image",
            ));
        }
        Ok(Some(self.produced.lock().unwrap().clone()))
    }
}

/// What a [`RecordingModelCreator`] leaves in its result directory.
#[derive(Clone, Debug)]
pub enum CreatorOutput {
    Missing,
    Empty,
    Files(Vec<(&'static str, &'static [u8])>),
}

#[derive(Debug)]
pub struct RecordingModelCreator {
    pub calls: Calls,
    pub output: CreatorOutput,
    pub empty_output_allowed: bool,
    pub images: Mutex<Vec<PathBuf>>,
    work_dir: Mutex<Option<PathBuf>>,
}

impl RecordingModelCreator {
    pub fn new(output: CreatorOutput, empty_output_allowed: bool) -> Self {
        Self {
            calls: Calls::default(),
            output,
            empty_output_allowed,
            images: Mutex::new(Vec::new()),
            work_dir: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Peripheral for RecordingModelCreator {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::FallbackModelCreator
    }

    async fn initialize(
        &self,
        _: Arc<ProgressMonitor>,
        params: PeripheralInitParams,
    ) -> Result<()> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        *self.work_dir.lock().unwrap() = params.work_dir;
        Ok(())
    }

    async fn status(&self, _: &PeripheralConfig) -> PeripheralStatus {
        PeripheralStatus::Available
    }
}

#[async_trait]
impl ModelCreatorPeripheral for RecordingModelCreator {
    async fn create_model(&self, images: &[PathBuf]) -> Result<ModelCreationResult> {
        self.calls.operations.fetch_add(1, Ordering::SeqCst);
        self.images.lock().unwrap().extend_from_slice(images);

        let work_dir = self
            .work_dir
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PipelineError::Internal("no work dir".to_string()))?;
        let result_dir = work_dir.join("export");
        let _ = fs::remove_dir_all(&result_dir);
        match &self.output {
            CreatorOutput::Missing => {}
            CreatorOutput::Empty => fs::create_dir_all(&result_dir).unwrap(),
            CreatorOutput::Files(files) => {
                for (name, bytes) in files {
                    let path = result_dir.join(name);
                    fs::create_dir_all(path.parent().unwrap()).unwrap();
                    fs::write(path, bytes).unwrap();
                }
            }
        }

        Ok(ModelCreationResult {
            result_dir,
            comment: "recorder".to_string(),
            empty_output_allowed: self.empty_output_allowed,
        })
    }

    async fn teardown(&self) -> Result<()> {
        self.calls.teardown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingModelEditor {
    pub calls: Calls,
    pub opened: Mutex<Vec<ModelSet>>,
}

#[async_trait]
impl Peripheral for RecordingModelEditor {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::FallbackModelEditor
    }

    async fn initialize(&self, _: Arc<ProgressMonitor>, _: PeripheralInitParams) -> Result<()> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self, _: &PeripheralConfig) -> PeripheralStatus {
        PeripheralStatus::Available
    }
}

#[async_trait]
impl ModelEditorPeripheral for RecordingModelEditor {
    async fn open(&self, model_set: &ModelSet) -> Result<()> {
        self.calls.operations.fetch_add(1, Ordering::SeqCst);
        self.opened.lock().unwrap().push(model_set.clone());
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.calls.teardown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry holding only the given capture peripherals.
pub fn capture_registry(
    turntable: Arc<RecordingTurntable>,
    camera: Arc<RecordingCamera>,
    remover: Arc<RecordingBackgroundRemoval>,
) -> Arc<PeripheralRegistry> {
    let mut registry = PeripheralRegistry::new();
    registry
        .register_turntable(turntable)
        .register_camera(camera)
        .register_background_removal(remover);
    Arc::new(registry)
}
