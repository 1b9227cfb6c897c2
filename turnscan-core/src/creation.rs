//! Model creation and model editing.
//!
//! A model creator turns model-input images into a result directory; the
//! orchestrator copies that directory into the item's next model asset
//! directory. Any failure while populating the asset directory removes it
//! again, so a model asset directory is either complete or absent.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::assets::{ProjectDirs, asset_name, next_asset_number, relative_path};
use crate::capture::ImageSet;
use crate::config::PeripheralConfigProvider;
use crate::error::{PipelineError, Result};
use crate::fs_repo::FileRepository;
use crate::peripheral::PeripheralInitParams;
use crate::progress::ProgressMonitor;
use crate::registry::PeripheralRegistry;

/// One model asset directory of an item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSet {
    /// Project-relative directory, forward slashes.
    pub directory: String,
    /// Name of the tool that produced the model.
    pub comment: String,
}

/// Output of one model creator run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelCreationResult {
    pub result_dir: PathBuf,
    pub comment: String,
    /// Whether an empty `result_dir` counts as a successful run.
    pub empty_output_allowed: bool,
}

/// Drives model creators and model editors.
pub struct CreationOrchestrator {
    registry: Arc<PeripheralRegistry>,
    config: Arc<dyn PeripheralConfigProvider>,
    fs: Arc<dyn FileRepository>,
    dirs: ProjectDirs,
}

impl fmt::Debug for CreationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreationOrchestrator")
            .field("registry", &self.registry)
            .field("project_root", &self.dirs.root())
            .finish()
    }
}

impl CreationOrchestrator {
    pub fn new(
        registry: Arc<PeripheralRegistry>,
        config: Arc<dyn PeripheralConfigProvider>,
        fs: Arc<dyn FileRepository>,
        dirs: ProjectDirs,
    ) -> Self {
        Self {
            registry,
            config,
            fs,
            dirs,
        }
    }

    /// Creates a model from `image_sets` and stores it as the item's next
    /// model asset directory.
    ///
    /// Returns `Ok(None)` when the creator produced no result directory at
    /// all. Callers pass only sets flagged as model input.
    pub async fn create_model(
        &self,
        item_id: &str,
        image_sets: &[ImageSet],
        monitor: Arc<ProgressMonitor>,
    ) -> Result<Option<ModelSet>> {
        let peripherals = self.config.peripherals()?;
        let config = peripherals.model_creator;
        let creator = self.registry.model_creator(&config)?;

        let images_dir = self.dirs.images_dir(item_id)?;
        let images: Vec<PathBuf> = image_sets
            .iter()
            .flat_map(|set| set.files.iter())
            .map(|file| images_dir.join(file))
            .collect();
        info!(item_id, images = images.len(), creator = %config.kind, "creating model");

        let params = PeripheralInitParams::new(config, self.dirs.root())
            .with_work_dir(self.dirs.temp_dir());
        creator.initialize(Arc::clone(&monitor), params).await?;

        let created = creator.create_model(&images).await;
        let torn_down = creator.teardown().await;
        let result = created?;
        torn_down?;

        if !self.fs.exists(&result.result_dir) {
            info!(
                item_id,
                result_dir = %result.result_dir.display(),
                "model creator produced no result directory"
            );
            return Ok(None);
        }

        monitor.update_label("copyModel");
        self.store_model(item_id, &result).map(Some)
    }

    fn store_model(&self, item_id: &str, result: &ModelCreationResult) -> Result<ModelSet> {
        let models_dir = self.dirs.models_dir(item_id)?;
        let target = models_dir.join(asset_name(next_asset_number(&models_dir)?, ""));
        self.fs.create_dir_if_required(&target)?;

        let copied = match self.fs.copy_tree(&result.result_dir, &target) {
            Ok(copied) => copied,
            Err(err) => {
                self.discard(&target);
                return Err(err);
            }
        };

        if copied == 0 && !result.empty_output_allowed {
            self.discard(&target);
            return Err(PipelineError::NoModelOutput(result.result_dir.clone()));
        }

        let directory = relative_path(self.dirs.root(), &target)?;
        info!(item_id, %directory, files = copied, "model stored");
        Ok(ModelSet {
            directory,
            comment: result.comment.clone(),
        })
    }

    fn discard(&self, target: &Path) {
        if let Err(err) = self.fs.delete(target) {
            warn!(
                path = %target.display(),
                error = %err,
                "could not remove incomplete model directory"
            );
        }
    }

    /// Opens `model_set` in the configured model editor.
    pub async fn edit_model(
        &self,
        model_set: &ModelSet,
        monitor: Arc<ProgressMonitor>,
    ) -> Result<()> {
        let peripherals = self.config.peripherals()?;
        let config = peripherals.model_editor;
        let editor = self.registry.model_editor(&config)?;

        editor
            .initialize(monitor, PeripheralInitParams::new(config, self.dirs.root()))
            .await?;
        let opened = editor.open(model_set).await;
        let torn_down = editor.teardown().await;
        opened?;
        torn_down
    }
}
