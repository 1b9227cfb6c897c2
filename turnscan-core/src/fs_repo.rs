//! Path-based file capability used by orchestrators and peripherals.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{GenericImageView, ImageFormat, imageops::FilterType};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{PipelineError, Result};

/// Narrow file-system surface the pipeline depends on.
pub trait FileRepository: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn create_dir_if_required(&self, dir: &Path) -> Result<()>;

    /// Deletes a file or a directory tree. Missing paths are not an error.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Copies a file, creating the target's parent directories.
    fn copy(&self, source: &Path, target: &Path) -> Result<()>;

    /// Moves a file, creating the target's parent directories.
    fn rename(&self, source: &Path, target: &Path) -> Result<()> {
        self.copy(source, target)?;
        self.delete(source)
    }

    /// Direct children of `dir`, sorted by name.
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>>;

    /// Writes a copy of `source` no wider than `max_width` to `target`,
    /// keeping the aspect ratio. The format follows `target`'s extension.
    /// Narrower images are copied unchanged.
    fn scale_image(&self, source: &Path, target: &Path, max_width: u32) -> Result<()> {
        let max_width = max_width.max(1);
        let img = image::load_from_memory(&self.read_bytes(source)?)?;
        let (width, height) = img.dimensions();
        if width <= max_width {
            return self.copy(source, target);
        }

        let scaled_height = (u64::from(height) * u64::from(max_width) / u64::from(width)).max(1);
        let scaled = img.resize_exact(
            max_width,
            u32::try_from(scaled_height).unwrap_or(u32::MAX),
            FilterType::Lanczos3,
        );

        let mut encoded = Cursor::new(Vec::new());
        scaled.write_to(&mut encoded, ImageFormat::from_path(target)?)?;
        debug!(
            source = %source.display(),
            target = %target.display(),
            width = max_width,
            "scaled image"
        );
        self.write(target, &encoded.into_inner())
    }

    /// Deletes and recreates `dir`.
    fn empty_dir(&self, dir: &Path) -> Result<()> {
        self.delete(dir)?;
        self.create_dir_if_required(dir)
    }

    /// Copies every file below `source` into `target`, keeping relative
    /// paths. Returns the number of files copied.
    fn copy_tree(&self, source: &Path, target: &Path) -> Result<usize> {
        let mut copied = 0;
        for entry in WalkDir::new(source).min_depth(1) {
            let entry = entry.map_err(|err| {
                let context = format!("could not walk {}", source.display());
                match err.into_io_error() {
                    Some(io) => PipelineError::io(context, io),
                    None => PipelineError::Internal(context),
                }
            })?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|err| PipelineError::Internal(err.to_string()))?;
            let destination = target.join(relative);
            if entry.file_type().is_dir() {
                self.create_dir_if_required(&destination)?;
            } else {
                self.copy(entry.path(), &destination)?;
                copied += 1;
            }
        }
        Ok(copied)
    }
}

/// [`FileRepository`] backed by the local file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct FilesystemFileRepository;

impl FileRepository for FilesystemFileRepository {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_if_required(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|err| PipelineError::io(format!("could not create {}", dir.display()), err))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let Ok(metadata) = fs::symlink_metadata(path) else {
            return Ok(());
        };
        debug!(path = %path.display(), "deleting");
        let outcome = if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        outcome
            .map_err(|err| PipelineError::io(format!("could not delete {}", path.display()), err))
    }

    fn rename(&self, source: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            self.create_dir_if_required(parent)?;
        }
        fs::rename(source, target).map_err(|err| {
            PipelineError::io(
                format!("could not move {} to {}", source.display(), target.display()),
                err,
            )
        })
    }

    fn copy(&self, source: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            self.create_dir_if_required(parent)?;
        }
        fs::copy(source, target).map(|_| ()).map_err(|err| {
            PipelineError::io(
                format!("could not copy {} to {}", source.display(), target.display()),
                err,
            )
        })
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let context = || format!("could not list {}", dir.display());
        let mut paths = fs::read_dir(dir)
            .map_err(|err| PipelineError::io(context(), err))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|err| PipelineError::io(context(), err))?;
        paths.sort();
        Ok(paths)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_if_required(parent)?;
        }
        fs::write(path, bytes)
            .map_err(|err| PipelineError::io(format!("could not write {}", path.display()), err))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
            .map_err(|err| PipelineError::io(format!("could not read {}", path.display()), err))
    }
}
