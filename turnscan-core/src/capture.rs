//! The capture loop.
//!
//! One run initializes the selected turntable, camera and background remover,
//! triggers the camera `num_photos` times and merges the files a
//! [`DirectoryWatcher`] discovers into [`ImageSet`]s. Cameras write their files
//! whenever they are done, so the order of discovered files is never assumed
//! to match trigger order.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::assets::{ProjectDirs, asset_name, next_asset_number, normalized_file_name};
use crate::config::{CaptureTuning, PeripheralConfigProvider, WatchConfig};
use crate::error::{PipelineError, Result};
use crate::fs_repo::FileRepository;
use crate::peripheral::{
    BackgroundRemovalPeripheral, CameraPeripheral, PeripheralInitParams, TurntablePeripheral,
};
use crate::progress::ProgressMonitor;
use crate::registry::PeripheralRegistry;
use crate::watch::{
    DirectoryWatcher, FileTypeFilter, NewFileHandler, ReadinessPolicy, wait_until_ready,
};

/// Extension of the files the camera is asked to write.
const CAPTURE_EXTENSION: &str = "jpg";

/// Parameters of one capture run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureParams {
    pub num_photos: u32,
    pub use_turntable: bool,
    /// Pause after each rotation, in milliseconds.
    pub turntable_delay_ms: u64,
    pub remove_backgrounds: bool,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            num_photos: 30,
            use_turntable: true,
            turntable_delay_ms: 0,
            remove_backgrounds: false,
        }
    }
}

/// Image file names of one item produced by one capture or derivation step.
///
/// `files` are names of files in the item's images directory, sorted
/// ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageSet {
    pub files: Vec<String>,
    pub model_input: bool,
    pub background_removed: bool,
}

impl ImageSet {
    pub fn from_paths(paths: &[PathBuf], model_input: bool, background_removed: bool) -> Self {
        let mut files: Vec<String> = paths
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        files.sort();
        files.dedup();
        Self {
            files,
            model_input,
            background_removed,
        }
    }

    /// The sets of `sets` usable as photogrammetry input.
    pub fn model_inputs(sets: &[ImageSet]) -> Vec<ImageSet> {
        sets.iter().filter(|set| set.model_input).cloned().collect()
    }
}

/// Watcher callback: readiness check, bookkeeping and per-file background
/// removal.
struct CapturedFiles {
    files: Mutex<Vec<PathBuf>>,
    remover: Option<Arc<dyn BackgroundRemovalPeripheral>>,
    readiness: ReadinessPolicy,
}

#[async_trait]
impl NewFileHandler for CapturedFiles {
    async fn on_new_file(&self, path: &Path) -> Result<()> {
        if !wait_until_ready(path, self.readiness).await {
            return Err(PipelineError::FileNotReady(path.to_path_buf()));
        }
        debug!(path = %path.display(), "captured image found");
        self.files.lock().await.push(path.to_path_buf());

        if let Some(remover) = &self.remover {
            // Another process may have reopened the file in the meantime.
            if wait_until_ready(path, self.readiness).await {
                remover.remove_background(path).await?;
            } else {
                warn!(path = %path.display(), "image locked again, background not removed");
            }
        }
        Ok(())
    }
}

/// Peripherals that completed `initialize` and still need a teardown.
#[derive(Default)]
struct Initialized {
    turntable: Option<Arc<dyn TurntablePeripheral>>,
    camera: Option<Arc<dyn CameraPeripheral>>,
    remover: Option<Arc<dyn BackgroundRemovalPeripheral>>,
}

impl Initialized {
    /// Tears down everything initialized, continuing past failures. Returns
    /// the remover's derivative images or the first teardown error.
    async fn teardown(&mut self) -> Result<Option<Vec<PathBuf>>> {
        let mut first_error = None;
        if let Some(turntable) = self.turntable.take()
            && let Err(err) = turntable.teardown().await
        {
            warn!(peripheral = %turntable.kind(), error = %err, "teardown failed");
            first_error.get_or_insert(err);
        }
        if let Some(camera) = self.camera.take()
            && let Err(err) = camera.teardown().await
        {
            warn!(peripheral = %camera.kind(), error = %err, "teardown failed");
            first_error.get_or_insert(err);
        }
        let mut derivatives = None;
        if let Some(remover) = self.remover.take() {
            match remover.teardown().await {
                Ok(produced) => derivatives = produced,
                Err(err) => {
                    warn!(peripheral = %remover.kind(), error = %err, "teardown failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(derivatives),
        }
    }
}

/// Drives capture runs and standalone background removal.
pub struct CaptureOrchestrator {
    registry: Arc<PeripheralRegistry>,
    config: Arc<dyn PeripheralConfigProvider>,
    fs: Arc<dyn FileRepository>,
    dirs: ProjectDirs,
    tuning: CaptureTuning,
    watch: WatchConfig,
}

impl fmt::Debug for CaptureOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureOrchestrator")
            .field("registry", &self.registry)
            .field("project_root", &self.dirs.root())
            .field("tuning", &self.tuning)
            .field("watch", &self.watch)
            .finish()
    }
}

impl CaptureOrchestrator {
    pub fn new(
        registry: Arc<PeripheralRegistry>,
        config: Arc<dyn PeripheralConfigProvider>,
        fs: Arc<dyn FileRepository>,
        dirs: ProjectDirs,
        tuning: CaptureTuning,
        watch: WatchConfig,
    ) -> Self {
        Self {
            registry,
            config,
            fs,
            dirs,
            tuning,
            watch,
        }
    }

    fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            attempts: self.tuning.readiness_attempts,
            interval: self.tuning.readiness_interval(),
        }
    }

    /// Captures `params.num_photos` images of `item_id`.
    ///
    /// Returns the as-shot set and, when backgrounds were removed and the
    /// remover produced derivatives, a second background-free set. A
    /// cancelled run returns what was captured up to that point. Every
    /// initialized peripheral is torn down before this returns.
    pub async fn capture_photos(
        &self,
        item_id: &str,
        params: &CaptureParams,
        monitor: Arc<ProgressMonitor>,
    ) -> Result<Vec<ImageSet>> {
        if params.num_photos == 0 {
            return Err(PipelineError::InvalidArgument(
                "a capture needs at least one photo".to_string(),
            ));
        }

        let images_dir = self.dirs.images_dir(item_id)?;
        self.fs.create_dir_if_required(&images_dir)?;

        let peripherals = self.config.peripherals()?;
        let turntable = self.registry.turntable(&peripherals.turntable)?;
        let camera = self.registry.camera(&peripherals.camera)?;
        let remover = self.registry.background_removal(&peripherals.background_removal)?;
        info!(
            item_id,
            photos = params.num_photos,
            turntable = params.use_turntable,
            camera = %camera.kind(),
            "starting capture"
        );

        let mut initialized = Initialized::default();
        let root = self.dirs.root();

        let captured = async {
            if params.use_turntable {
                turntable
                    .initialize(
                        Arc::clone(&monitor),
                        PeripheralInitParams::new(peripherals.turntable.clone(), root),
                    )
                    .await?;
                initialized.turntable = Some(Arc::clone(&turntable));
            }

            camera
                .initialize(
                    Arc::clone(&monitor),
                    PeripheralInitParams::new(peripherals.camera.clone(), root)
                        .with_work_dir(&images_dir),
                )
                .await?;
            initialized.camera = Some(Arc::clone(&camera));

            remover
                .initialize(
                    Arc::clone(&monitor),
                    PeripheralInitParams::new(peripherals.background_removal.clone(), root)
                        .with_work_dir(&images_dir),
                )
                .await?;
            initialized.remover = Some(Arc::clone(&remover));

            let turntable = params.use_turntable.then_some(turntable.as_ref());
            self.run_capture(
                &images_dir,
                params,
                &monitor,
                camera.as_ref(),
                turntable,
                Arc::clone(&remover),
            )
            .await
        }
        .await;

        let torn_down = initialized.teardown().await;
        let captured = match (captured, torn_down) {
            (Err(err), torn_down) => {
                if let Err(teardown_err) = torn_down {
                    warn!(error = %teardown_err, "teardown after failed capture also failed");
                }
                monitor.fail(err.to_string());
                return Err(err);
            }
            (Ok(_), Err(err)) => {
                monitor.fail(err.to_string());
                return Err(err);
            }
            (Ok(captured), Ok(derivatives)) => (captured, derivatives),
        };
        let (files, derivatives) = captured;

        monitor.update_label("imageSetInProgress");
        let mut renamed = HashMap::new();
        let files = self.adopt_images(&images_dir, &files, &mut renamed)?;
        let mut sets = vec![ImageSet::from_paths(&files, !params.remove_backgrounds, false)];
        if params.remove_backgrounds
            && let Some(derivatives) = derivatives.filter(|paths| !paths.is_empty())
        {
            let derivatives = self.adopt_images(&images_dir, &derivatives, &mut renamed)?;
            sets.push(ImageSet::from_paths(&derivatives, true, true));
        }

        info!(
            item_id,
            images = sets[0].files.len(),
            sets = sets.len(),
            "capture finished"
        );
        Ok(sets)
    }

    async fn run_capture(
        &self,
        images_dir: &Path,
        params: &CaptureParams,
        monitor: &ProgressMonitor,
        camera: &dyn CameraPeripheral,
        turntable: Option<&dyn TurntablePeripheral>,
        remover: Arc<dyn BackgroundRemovalPeripheral>,
    ) -> Result<Vec<PathBuf>> {
        let handler = Arc::new(CapturedFiles {
            files: Mutex::new(Vec::new()),
            remover: params.remove_backgrounds.then_some(remover),
            readiness: self.readiness(),
        });
        let expected = usize::try_from(params.num_photos).unwrap_or(usize::MAX);
        let watcher = DirectoryWatcher::start(
            images_dir,
            expected,
            FileTypeFilter::jpeg(),
            Arc::clone(&handler) as Arc<dyn NewFileHandler>,
            &self.watch,
        )
        .await?;

        monitor.update_label("inProgress");
        match self.trigger_all(images_dir, params, monitor, camera, turntable).await {
            Ok(triggered) => {
                if triggered < params.num_photos {
                    watcher.expect(usize::try_from(triggered).unwrap_or(usize::MAX));
                }
                watcher.finish(self.tuning.watch_grace()).await?;
            }
            Err(err) => {
                if let Err(watch_err) = watcher.finish(Duration::ZERO).await {
                    debug!(error = %watch_err, "watcher stopped with error after failed capture");
                }
                return Err(err);
            }
        }

        let files = handler.files.lock().await.clone();
        Ok(files)
    }

    /// Runs the trigger loop and returns the number of triggers issued.
    async fn trigger_all(
        &self,
        images_dir: &Path,
        params: &CaptureParams,
        monitor: &ProgressMonitor,
        camera: &dyn CameraPeripheral,
        turntable: Option<&dyn TurntablePeripheral>,
    ) -> Result<u32> {
        let total = params.num_photos;
        let delay = Duration::from_millis(params.turntable_delay_ms);
        let cancel = monitor.cancellation_token();
        let mut last_number = 0;

        for index in 0..total {
            if monitor.is_cancelled() {
                info!(captured = index, total, "capture cancelled");
                return Ok(index);
            }
            monitor.update_progress(index + 1, total);

            let number = next_asset_number(images_dir)?.max(last_number + 1);
            last_number = number;
            let target = images_dir.join(asset_name(number, CAPTURE_EXTENSION));
            debug!(path = %target.display(), "capturing image");
            self.trigger(camera, &target).await?;

            if let Some(turntable) = turntable {
                turntable.rotate(total).await?;
                if !delay.is_zero() {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
        Ok(total)
    }

    /// Triggers the camera, retrying within the configured budget.
    async fn trigger(&self, camera: &dyn CameraPeripheral, target: &Path) -> Result<()> {
        let budget = self.tuning.trigger_timeout();
        let retry = self.tuning.trigger_retry_interval();
        let deadline = Instant::now() + budget;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let failure = match timeout(remaining, camera.capture_image(target)).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => "camera captured nothing".to_string(),
                Ok(Err(err @ PipelineError::Peripheral { .. })) => err.to_string(),
                Ok(Err(err)) => return Err(err),
                Err(_) => "trigger did not return in time".to_string(),
            };
            debug!(path = %target.display(), attempt, %failure, "camera trigger failed");

            if Instant::now() + retry >= deadline {
                return Err(PipelineError::Timeout {
                    operation: "camera trigger".to_string(),
                    detail: format!(
                        "{} not captured within {}ms after {attempt} attempts, \
                         last failure: {failure}",
                        target.display(),
                        budget.as_millis()
                    ),
                });
            }
            sleep(retry).await;
        }
    }

    /// Renames files inside `images_dir` to asset names and returns the
    /// paths they end up at.
    ///
    /// `renamed` maps original stems to assigned stems, so a derivative follows
    /// the image it was made from. A name that is already taken by another
    /// file gets a fresh asset number.
    fn adopt_images(
        &self,
        images_dir: &Path,
        files: &[PathBuf],
        renamed: &mut HashMap<String, String>,
    ) -> Result<Vec<PathBuf>> {
        let mut adopted = Vec::with_capacity(files.len());
        for file in files {
            if file.parent() != Some(images_dir) || !self.fs.exists(file) {
                adopted.push(file.clone());
                continue;
            }

            let stem = file
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let extension = file
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or_default();
            let wanted = match renamed.get(&stem) {
                Some(assigned) => images_dir.join(Path::new(assigned).with_extension(&extension)),
                None => images_dir.join(normalized_file_name(file)),
            };
            if wanted == *file {
                adopted.push(file.clone());
                continue;
            }

            let target = if self.fs.exists(&wanted) {
                images_dir.join(asset_name(next_asset_number(images_dir)?, &extension))
            } else {
                wanted
            };
            self.fs.rename(file, &target)?;
            debug!(from = %file.display(), to = %target.display(), "renamed captured image");
            if let Some(assigned) = target.file_stem() {
                renamed.insert(stem, assigned.to_string_lossy().into_owned());
            }
            adopted.push(target);
        }
        Ok(adopted)
    }

    /// Removes backgrounds from an already captured set.
    ///
    /// Returns the derivative images, empty when the remover produces none.
    pub async fn remove_backgrounds(
        &self,
        item_id: &str,
        image_set: &ImageSet,
        monitor: Arc<ProgressMonitor>,
    ) -> Result<Vec<PathBuf>> {
        let images_dir = self.dirs.images_dir(item_id)?;
        let peripherals = self.config.peripherals()?;
        let config = peripherals.background_removal;
        let remover = self.registry.background_removal(&config)?;

        remover
            .initialize(
                Arc::clone(&monitor),
                PeripheralInitParams::new(config, self.dirs.root()).with_work_dir(&images_dir),
            )
            .await?;

        monitor.update_label("backgroundRemovalInProgress");
        let total = u32::try_from(image_set.files.len()).unwrap_or(u32::MAX);
        monitor.update_progress(0, total);
        let images: Vec<PathBuf> = image_set
            .files
            .iter()
            .map(|file| images_dir.join(file))
            .collect();

        let scheduled = remover.remove_backgrounds(&images).await;
        let torn_down = remover.teardown().await;
        scheduled?;
        let derivatives = torn_down?.unwrap_or_default();
        monitor.update_progress(total, total);

        info!(
            item_id,
            images = images.len(),
            derivatives = derivatives.len(),
            "background removal finished"
        );
        Ok(derivatives)
    }
}
