//! # Turnscan Core
//!
//! Capture and creation pipeline for photographing real objects on a
//! turntable and turning the photos into 3D models with external
//! photogrammetry tools.
//!
//! ## Overview
//!
//! - **Asset layout**: item ids shard into `items/<a>/<b>/<id>/<subdir>`,
//!   files inside are numbered `001`, `002`, ... (see [`assets`])
//! - **Peripherals**: turntable, camera, background removal, model creator
//!   and model editor behind one lifecycle contract (see [`peripheral`])
//! - **Registry**: picks the configured implementation per role on every run
//! - **Capture**: rotates, triggers and merges the files the camera writes
//!   out of band into image sets (see [`capture`])
//! - **Creation**: feeds image sets to a model creator and files the result
//!   as a model asset directory (see [`creation`])
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use turnscan_core::{
//!     CaptureOrchestrator, CaptureParams, FilesystemFileRepository, PeripheralRegistry,
//!     ProcessGateway, ProgressMonitor, ProjectDirs, StaticPeripheralConfig, TurnscanConfig,
//! };
//!
//! async fn capture(config: TurnscanConfig) -> turnscan_core::Result<()> {
//!     let fs = Arc::new(FilesystemFileRepository);
//!     let registry = Arc::new(PeripheralRegistry::with_builtin(
//!         fs.clone(),
//!         Arc::new(ProcessGateway),
//!     ));
//!     let orchestrator = CaptureOrchestrator::new(
//!         registry,
//!         Arc::new(StaticPeripheralConfig(config.peripherals.clone())),
//!         fs,
//!         ProjectDirs::new(&config.project_root),
//!         config.capture.clone(),
//!         config.watch.clone(),
//!     );
//!
//!     let monitor = Arc::new(ProgressMonitor::new("CaptureImages", "start"));
//!     let sets = orchestrator
//!         .capture_photos("0a1b2c3d4e", &CaptureParams::default(), monitor)
//!         .await?;
//!     println!("captured {} image(s)", sets[0].files.len());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Asset naming scheme and project directory layout
pub mod assets;
/// Capture orchestration and image sets
pub mod capture;
/// Configuration types and the peripheral configuration seam
pub mod config;
/// Model creation and editing orchestration
pub mod creation;
pub mod error;
/// File system capability
pub mod fs_repo;
/// External process execution and argument templates
pub mod os;
pub mod peripheral;
/// Progress reporting and cooperative cancellation
pub mod progress;
pub mod registry;
pub mod watch;

pub use assets::ProjectDirs;
pub use capture::{CaptureOrchestrator, CaptureParams, ImageSet};
pub use config::{
    CaptureTuning, PeripheralConfig, PeripheralConfigProvider, PeripheralsConfiguration,
    StaticPeripheralConfig, TurnscanConfig, WatchConfig,
};
pub use creation::{CreationOrchestrator, ModelCreationResult, ModelSet};
pub use error::{PipelineError, Result};
pub use fs_repo::{FileRepository, FilesystemFileRepository};
pub use os::{OsGateway, ProcessGateway};
pub use peripheral::{PeripheralKind, PeripheralRole, PeripheralStatus};
pub use progress::{ProgressMonitor, ProgressSnapshot};
pub use registry::{PeripheralRegistry, PeripheralStatusEntry};
pub use watch::{DirectoryWatcher, FileTypeFilter, NewFileHandler};
