use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageReader, Rgb, RgbaImage};
use rayon::prelude::*;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinSet, spawn_blocking};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{
    BackgroundRemovalPeripheral, Peripheral, PeripheralInitParams, PeripheralKind,
    PeripheralLifecycle, PeripheralStatus, RunSlot,
};
use crate::config::PeripheralConfig;
use crate::error::{PipelineError, Result};
use crate::os::{OsGateway, SOURCE_FILE, TARGET_FILE, expand_arguments};
use crate::progress::ProgressMonitor;

const DEFAULT_THREADS: usize = 2;
const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 500;
const REMBG_ARGUMENTS: &str = "i {sourceFile} {targetFile}";

/// Path of the background-free derivative of `image` inside `target_dir`.
pub fn derivative_path(image: &Path, target_dir: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    target_dir.join(format!("{stem}.png"))
}

/// Removal tasks scheduled during one run.
struct RemovalJobs {
    tasks: Mutex<JoinSet<Result<PathBuf>>>,
    limiter: StdMutex<Arc<Semaphore>>,
}

impl RemovalJobs {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
            limiter: StdMutex::new(Arc::new(Semaphore::new(DEFAULT_THREADS))),
        }
    }

    /// Drops work left over from a run that was never torn down.
    async fn reset(&self, threads: usize) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!(pending = tasks.len(), "aborting background removals of a previous run");
            tasks.abort_all();
        }
        *tasks = JoinSet::new();
        *self.limiter.lock().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(Semaphore::new(threads.max(1)));
    }

    async fn spawn<F>(&self, job: F)
    where
        F: Future<Output = Result<PathBuf>> + Send + 'static,
    {
        let limiter = Arc::clone(&self.limiter.lock().unwrap_or_else(PoisonError::into_inner));
        self.tasks.lock().await.spawn(async move {
            let _permit = limiter
                .acquire_owned()
                .await
                .map_err(|err| PipelineError::Internal(err.to_string()))?;
            job.await
        });
    }

    /// Waits for every scheduled removal and returns the derivatives, sorted.
    ///
    /// Fails with the first failed removal once all of them finished, so a
    /// derivative set is either complete or not reported at all.
    async fn drain(&self) -> Result<Vec<PathBuf>> {
        let mut tasks = self.tasks.lock().await;
        let mut produced = Vec::new();
        let mut failures = 0usize;
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|err| {
                Err(PipelineError::Internal(format!("background removal task failed: {err}")))
            });
            match outcome {
                Ok(path) => produced.push(path),
                Err(err) => {
                    warn!(error = %err, "background removal failed");
                    failures += 1;
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            warn!(
                failures,
                produced = produced.len(),
                "discarding incomplete background removal results"
            );
            return Err(err);
        }
        produced.sort();
        Ok(produced)
    }
}

fn target_dir(params: &PeripheralInitParams) -> PathBuf {
    params.work_dir().to_path_buf()
}

/// Background removal delegated to a command-line tool such as `rembg`.
///
/// The argument template receives `{sourceFile}` and `{targetFile}`. A run
/// that writes no image is retried up to `attempts` times (default 3),
/// `retry_interval_ms` apart.
pub struct ExternalProgramBackgroundRemoval {
    os: Arc<dyn OsGateway>,
    lifecycle: PeripheralLifecycle,
    run: RunSlot<ExternalRun>,
    jobs: RemovalJobs,
}

#[derive(Clone, Debug)]
struct ExternalRun {
    command: String,
    arguments: String,
    target_dir: PathBuf,
    attempts: u32,
    retry_interval: Duration,
}

impl ExternalProgramBackgroundRemoval {
    pub fn new(os: Arc<dyn OsGateway>) -> Self {
        Self {
            os,
            lifecycle: PeripheralLifecycle::new(PeripheralKind::ExternalProgramBackgroundRemoval),
            run: RunSlot::new(),
            jobs: RemovalJobs::new(),
        }
    }
}

impl fmt::Debug for ExternalProgramBackgroundRemoval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalProgramBackgroundRemoval")
            .field("state", &self.lifecycle.state())
            .field("run", &self.run.get())
            .finish()
    }
}

#[async_trait]
impl Peripheral for ExternalProgramBackgroundRemoval {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::ExternalProgramBackgroundRemoval
    }

    async fn initialize(
        &self,
        _monitor: Arc<ProgressMonitor>,
        params: PeripheralInitParams,
    ) -> Result<()> {
        let config = &params.config;
        if config.command().trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "background removal '{}' has no command configured",
                config.id
            )));
        }

        self.lifecycle.begin();
        self.jobs
            .reset(config.setting("threads").unwrap_or(DEFAULT_THREADS))
            .await;
        let arguments = match config.arguments() {
            "" => REMBG_ARGUMENTS.to_string(),
            template => template.to_string(),
        };
        self.run.set(ExternalRun {
            command: config.command().to_string(),
            arguments,
            target_dir: target_dir(&params),
            attempts: config.setting("attempts").unwrap_or(DEFAULT_ATTEMPTS).max(1),
            retry_interval: Duration::from_millis(
                config
                    .setting("retry_interval_ms")
                    .unwrap_or(DEFAULT_RETRY_INTERVAL_MS),
            ),
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
            .find_program("rembg")
            .map(|path| {
                vec![PeripheralConfig::external(
                    self.kind(),
                    "rembg",
                    path.to_string_lossy(),
                    REMBG_ARGUMENTS,
                )]
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl BackgroundRemovalPeripheral for ExternalProgramBackgroundRemoval {
    async fn remove_background(&self, image: &Path) -> Result<()> {
        let run = self.run.get().ok_or_else(|| {
            PipelineError::peripheral(self.kind(), "removal requested before initialization")
        })?;

        let target = derivative_path(image, &run.target_dir);
        let source_file = image.to_string_lossy().into_owned();
        let target_file = target.to_string_lossy().into_owned();
        let arguments = expand_arguments(
            &run.arguments,
            &[
                (SOURCE_FILE, source_file.as_str()),
                (TARGET_FILE, target_file.as_str()),
            ],
        );

        let os = Arc::clone(&self.os);
        let kind = self.kind();
        self.jobs
            .spawn(async move {
                for attempt in 1..=run.attempts {
                    if os.execute(&run.command, &arguments).await && target.exists() {
                        debug!(path = %target.display(), attempt, "background removed");
                        return Ok(target);
                    }
                    warn!(source = %source_file, attempt, "background removal produced no image");
                    if attempt < run.attempts {
                        sleep(run.retry_interval).await;
                    }
                }
                Err(PipelineError::peripheral(
                    kind,
                    format!(
                        "no background-free image for {source_file} after {} attempts",
                        run.attempts
                    ),
                ))
            })
            .await;
        Ok(())
    }

    async fn teardown(&self) -> Result<Option<Vec<PathBuf>>> {
        let produced = self.jobs.drain().await;
        self.run.take();
        self.lifecycle.end();
        Ok(Some(produced?))
    }
}

/// Removes a uniform backdrop colour natively.
///
/// Settings: `key_color` as `#rrggbb` (default green screen `#00b140`),
/// `tolerance` as the maximum RGB distance treated as backdrop (default 90),
/// `threads` as the number of images processed concurrently.
pub struct ChromaKeyBackgroundRemoval {
    lifecycle: PeripheralLifecycle,
    run: RunSlot<ChromaKeyRun>,
    jobs: RemovalJobs,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct ChromaKey {
    color: Rgb<u8>,
    tolerance: f32,
}

impl Default for ChromaKey {
    fn default() -> Self {
        Self {
            color: Rgb([0x00, 0xb1, 0x40]),
            tolerance: 90.0,
        }
    }
}

#[derive(Clone, Debug)]
struct ChromaKeyRun {
    key: ChromaKey,
    target_dir: PathBuf,
}

fn parse_color(value: &str) -> Option<Rgb<u8>> {
    let hex = value.trim().trim_start_matches('#');
    if hex.len() != 6 {
        return None;
    }
    let channel = |range: Range<usize>| u8::from_str_radix(hex.get(range)?, 16).ok();
    Some(Rgb([channel(0..2)?, channel(2..4)?, channel(4..6)?]))
}

/// Makes every pixel within `key.tolerance` of the key colour transparent.
fn apply_chroma_key(image: &mut RgbaImage, key: ChromaKey) {
    let [kr, kg, kb] = key.color.0;
    let limit = key.tolerance * key.tolerance;
    image.par_chunks_exact_mut(4).for_each(|pixel| {
        let dr = f32::from(pixel[0]) - f32::from(kr);
        let dg = f32::from(pixel[1]) - f32::from(kg);
        let db = f32::from(pixel[2]) - f32::from(kb);
        if dr * dr + dg * dg + db * db <= limit {
            pixel[3] = 0;
        }
    });
}

fn remove_chroma_key(source: &Path, target: &Path, key: ChromaKey) -> Result<()> {
    let reader = ImageReader::open(source)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|err| PipelineError::io(format!("could not read {}", source.display()), err))?;
    let mut image = reader.decode()?.to_rgba8();
    apply_chroma_key(&mut image, key);
    image.save(target)?;
    Ok(())
}

impl ChromaKeyBackgroundRemoval {
    pub fn new() -> Self {
        Self {
            lifecycle: PeripheralLifecycle::new(PeripheralKind::ChromaKeyBackgroundRemoval),
            run: RunSlot::new(),
            jobs: RemovalJobs::new(),
        }
    }
}

impl Default for ChromaKeyBackgroundRemoval {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChromaKeyBackgroundRemoval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChromaKeyBackgroundRemoval")
            .field("state", &self.lifecycle.state())
            .field("run", &self.run.get())
            .finish()
    }
}

#[async_trait]
impl Peripheral for ChromaKeyBackgroundRemoval {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::ChromaKeyBackgroundRemoval
    }

    async fn initialize(
        &self,
        _monitor: Arc<ProgressMonitor>,
        params: PeripheralInitParams,
    ) -> Result<()> {
        let config = &params.config;
        let mut key = ChromaKey::default();
        if let Some(value) = config.settings.get("key_color") {
            key.color = parse_color(value).ok_or_else(|| {
                PipelineError::Configuration(format!("invalid key_color '{value}'"))
            })?;
        }
        if let Some(tolerance) = config.setting::<f32>("tolerance") {
            key.tolerance = tolerance.max(0.0);
        }

        self.lifecycle.begin();
        self.jobs
            .reset(config.setting("threads").unwrap_or(DEFAULT_THREADS))
            .await;
        self.run.set(ChromaKeyRun {
            key,
            target_dir: target_dir(&params),
        });
        Ok(())
    }

    async fn status(&self, _config: &PeripheralConfig) -> PeripheralStatus {
        PeripheralStatus::Available
    }
}

#[async_trait]
impl BackgroundRemovalPeripheral for ChromaKeyBackgroundRemoval {
    async fn remove_background(&self, image: &Path) -> Result<()> {
        let run = self.run.get().ok_or_else(|| {
            PipelineError::peripheral(self.kind(), "removal requested before initialization")
        })?;

        let source = image.to_path_buf();
        let target = derivative_path(image, &run.target_dir);
        self.jobs
            .spawn(async move {
                let output = target.clone();
                let outcome =
                    spawn_blocking(move || remove_chroma_key(&source, &output, run.key)).await;
                match outcome {
                    Ok(Ok(())) => Ok(target),
                    Ok(Err(err)) => Err(err),
                    Err(err) => Err(PipelineError::Internal(format!(
                        "chroma key task failed: {err}"
                    ))),
                }
            })
            .await;
        Ok(())
    }

    async fn teardown(&self) -> Result<Option<Vec<PathBuf>>> {
        let produced = self.jobs.drain().await;
        self.run.take();
        self.lifecycle.end();
        let produced = produced?;
        info!(count = produced.len(), "chroma key removal finished");
        Ok(Some(produced))
    }
}

/// Background removal that leaves images untouched.
#[derive(Debug)]
pub struct FallbackBackgroundRemoval {
    lifecycle: PeripheralLifecycle,
}

impl FallbackBackgroundRemoval {
    pub fn new() -> Self {
        Self {
            lifecycle: PeripheralLifecycle::new(PeripheralKind::FallbackBackgroundRemoval),
        }
    }
}

impl Default for FallbackBackgroundRemoval {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Peripheral for FallbackBackgroundRemoval {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::FallbackBackgroundRemoval
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
impl BackgroundRemovalPeripheral for FallbackBackgroundRemoval {
    async fn remove_background(&self, image: &Path) -> Result<()> {
        debug!(path = %image.display(), "background removal disabled");
        Ok(())
    }

    async fn teardown(&self) -> Result<Option<Vec<PathBuf>>> {
        self.lifecycle.end();
        Ok(None)
    }
}
