//! Peripheral roles and the lifecycle contract they share.
//!
//! A peripheral is a replaceable hardware- or process-backed component that
//! fulfils exactly one [`PeripheralRole`]. Each implementation declares the
//! [`PeripheralKind`] it supports; the registry picks the implementation whose
//! kind matches the configuration for that role.
//!
//! Lifecycle: `initialize` acquires resources, role operations run any number
//! of times, and the role's `teardown` releases them. Orchestrators call
//! `teardown` on every exit path, errors and cancellation included.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PeripheralConfig;
use crate::creation::{ModelCreationResult, ModelSet};
use crate::error::Result;
use crate::progress::ProgressMonitor;

pub mod background;
pub mod camera;
pub mod model_creator;
pub mod model_editor;
pub mod turntable;

pub use background::{
    ChromaKeyBackgroundRemoval, ExternalProgramBackgroundRemoval, FallbackBackgroundRemoval,
};
pub use camera::{ExternalProgramCamera, FallbackCamera};
pub use model_creator::{ExternalProgramModelCreator, FallbackModelCreator};
pub use model_editor::{ExternalProgramModelEditor, FallbackModelEditor};
pub use turntable::{ArduinoTurntable, ManualTurntable};

/// Capability role a peripheral fulfils.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeripheralRole {
    Turntable,
    Camera,
    BackgroundRemoval,
    ModelCreator,
    ModelEditor,
}

impl PeripheralRole {
    pub const ALL: [PeripheralRole; 5] = [
        PeripheralRole::Turntable,
        PeripheralRole::Camera,
        PeripheralRole::BackgroundRemoval,
        PeripheralRole::ModelCreator,
        PeripheralRole::ModelEditor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeripheralRole::Turntable => "turntable",
            PeripheralRole::Camera => "camera",
            PeripheralRole::BackgroundRemoval => "background removal",
            PeripheralRole::ModelCreator => "model creator",
            PeripheralRole::ModelEditor => "model editor",
        }
    }
}

impl fmt::Display for PeripheralRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one concrete peripheral implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeripheralKind {
    ExternalProgramCamera,
    FallbackCamera,
    ArduinoTurntable,
    ManualTurntable,
    ExternalProgramBackgroundRemoval,
    ChromaKeyBackgroundRemoval,
    FallbackBackgroundRemoval,
    ExternalProgramModelCreator,
    FallbackModelCreator,
    ExternalProgramModelEditor,
    FallbackModelEditor,
}

impl PeripheralKind {
    pub fn role(&self) -> PeripheralRole {
        match self {
            PeripheralKind::ExternalProgramCamera | PeripheralKind::FallbackCamera => {
                PeripheralRole::Camera
            }
            PeripheralKind::ArduinoTurntable | PeripheralKind::ManualTurntable => {
                PeripheralRole::Turntable
            }
            PeripheralKind::ExternalProgramBackgroundRemoval
            | PeripheralKind::ChromaKeyBackgroundRemoval
            | PeripheralKind::FallbackBackgroundRemoval => PeripheralRole::BackgroundRemoval,
            PeripheralKind::ExternalProgramModelCreator | PeripheralKind::FallbackModelCreator => {
                PeripheralRole::ModelCreator
            }
            PeripheralKind::ExternalProgramModelEditor | PeripheralKind::FallbackModelEditor => {
                PeripheralRole::ModelEditor
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeripheralKind::ExternalProgramCamera => "external-program-camera",
            PeripheralKind::FallbackCamera => "fallback-camera",
            PeripheralKind::ArduinoTurntable => "arduino-turntable",
            PeripheralKind::ManualTurntable => "manual-turntable",
            PeripheralKind::ExternalProgramBackgroundRemoval => {
                "external-program-background-removal"
            }
            PeripheralKind::ChromaKeyBackgroundRemoval => "chroma-key-background-removal",
            PeripheralKind::FallbackBackgroundRemoval => "fallback-background-removal",
            PeripheralKind::ExternalProgramModelCreator => "external-program-model-creator",
            PeripheralKind::FallbackModelCreator => "fallback-model-creator",
            PeripheralKind::ExternalProgramModelEditor => "external-program-model-editor",
            PeripheralKind::FallbackModelEditor => "fallback-model-editor",
        }
    }

    /// Default display label for configurations created without one.
    pub fn label(&self) -> &'static str {
        match self {
            PeripheralKind::ExternalProgramCamera => "External program camera",
            PeripheralKind::FallbackCamera => "Fallback camera",
            PeripheralKind::ArduinoTurntable => "Arduino turntable",
            PeripheralKind::ManualTurntable => "Manual turntable",
            PeripheralKind::ExternalProgramBackgroundRemoval => "External background removal",
            PeripheralKind::ChromaKeyBackgroundRemoval => "Chroma key background removal",
            PeripheralKind::FallbackBackgroundRemoval => "No background removal",
            PeripheralKind::ExternalProgramModelCreator => "External model creator",
            PeripheralKind::FallbackModelCreator => "Fallback model creator",
            PeripheralKind::ExternalProgramModelEditor => "External model editor",
            PeripheralKind::FallbackModelEditor => "Fallback model editor",
        }
    }
}

impl fmt::Display for PeripheralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Availability of a configured peripheral.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeripheralStatus {
    Available,
    NotExecutable,
    Disconnected,
    FileMissing,
    NotConfigured,
}

/// Parameters handed to [`Peripheral::initialize`].
#[derive(Clone, Debug)]
pub struct PeripheralInitParams {
    pub config: PeripheralConfig,
    /// Directory the peripheral reads from or writes into, if any.
    pub work_dir: Option<PathBuf>,
    pub project_root: PathBuf,
}

impl PeripheralInitParams {
    pub fn new(config: PeripheralConfig, project_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            work_dir: None,
            project_root: project_root.into(),
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    /// Work dir, falling back to the project root.
    pub fn work_dir(&self) -> &Path {
        self.work_dir.as_deref().unwrap_or(&self.project_root)
    }
}

/// Behaviour shared by every peripheral role.
#[async_trait]
pub trait Peripheral: Send + Sync + fmt::Debug {
    fn kind(&self) -> PeripheralKind;

    fn supports(&self, kind: PeripheralKind) -> bool {
        self.kind() == kind
    }

    async fn initialize(
        &self,
        monitor: Arc<ProgressMonitor>,
        params: PeripheralInitParams,
    ) -> Result<()>;

    /// Reports whether `config` describes a usable instance of this peripheral.
    async fn status(&self, config: &PeripheralConfig) -> PeripheralStatus;

    /// Detects locally installed instances of this peripheral.
    async fn scan(&self) -> Vec<PeripheralConfig> {
        Vec::new()
    }
}

#[async_trait]
pub trait TurntablePeripheral: Peripheral {
    /// Turns by one `1/divisions` of a full revolution.
    async fn rotate(&self, divisions: u32) -> Result<()>;

    async fn teardown(&self) -> Result<()>;
}

#[async_trait]
pub trait CameraPeripheral: Peripheral {
    /// Triggers one capture written to `target`.
    ///
    /// `Ok(false)` means the camera did not capture anything and may be
    /// retried.
    async fn capture_image(&self, target: &Path) -> Result<bool>;

    async fn teardown(&self) -> Result<()>;
}

#[async_trait]
pub trait BackgroundRemovalPeripheral: Peripheral {
    /// Schedules background removal for one image.
    async fn remove_background(&self, image: &Path) -> Result<()>;

    /// Schedules background removal for every image in `images`.
    async fn remove_backgrounds(&self, images: &[PathBuf]) -> Result<()> {
        for image in images {
            self.remove_background(image).await?;
        }
        Ok(())
    }

    /// Waits for scheduled work and returns the derivative images, if this
    /// implementation produces any.
    async fn teardown(&self) -> Result<Option<Vec<PathBuf>>>;
}

#[async_trait]
pub trait ModelCreatorPeripheral: Peripheral {
    async fn create_model(&self, images: &[PathBuf]) -> Result<ModelCreationResult>;

    async fn teardown(&self) -> Result<()>;
}

#[async_trait]
pub trait ModelEditorPeripheral: Peripheral {
    async fn open(&self, model_set: &ModelSet) -> Result<()>;

    async fn teardown(&self) -> Result<()>;
}

/// Lifecycle states of one peripheral instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Initialized,
    TornDown,
}

/// Lifecycle bookkeeping shared by the concrete peripherals.
///
/// A peripheral found still `Initialized` when `initialize` runs was never
/// torn down by a previous run. [`PeripheralLifecycle::begin`] reports that
/// once so the caller can reset stale resources exactly one time before
/// acquiring them again.
#[derive(Debug)]
pub struct PeripheralLifecycle {
    kind: PeripheralKind,
    state: Mutex<LifecycleState>,
}

impl PeripheralLifecycle {
    pub fn new(kind: PeripheralKind) -> Self {
        Self {
            kind,
            state: Mutex::new(LifecycleState::Uninitialized),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == LifecycleState::Initialized
    }

    /// Marks the peripheral initialized and returns whether a stale
    /// initialization has to be reset first.
    pub fn begin(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = *state == LifecycleState::Initialized;
        if stale {
            warn!(
                peripheral = %self.kind,
                "peripheral still initialized from a previous run, resetting once"
            );
        }
        *state = LifecycleState::Initialized;
        stale
    }

    /// Rolls back a `begin` whose resource acquisition failed.
    pub fn abort(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = LifecycleState::Uninitialized;
    }

    pub fn end(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = LifecycleState::TornDown;
    }
}

/// Slot for per-run state that `initialize` installs and `teardown` clears.
#[derive(Debug)]
pub(crate) struct RunSlot<T>(Mutex<Option<T>>);

impl<T: Clone> RunSlot<T> {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(None))
    }

    pub(crate) fn set(&self, value: T) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    pub(crate) fn get(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}
