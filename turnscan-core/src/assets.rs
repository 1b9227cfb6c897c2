//! Asset naming and project directory layout.
//!
//! Every per-item file lives under
//! `items/<id[0..3]>/<id[3..6]>/<id>/<subdir>/<NNN>.<ext>`, where `NNN` is a
//! zero-padded asset number unique within `<subdir>`. The layout is the one
//! on-disk convention shared by every peripheral, so it must stay stable.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Highest asset number accepted when scanning an asset directory.
pub const MAX_ASSET_NUMBER: u32 = 1000;

/// Directory holding all item asset trees, relative to the project root.
pub const ITEMS_DIR: &str = "items";
/// Per-item subdirectory for captured and derived images.
pub const IMAGES_DIR: &str = "images";
/// Per-item subdirectory for model asset directories.
pub const MODELS_DIR: &str = "models";
/// Scratch space shared by model creation tools.
pub const TEMP_DIR: &str = "temp";
/// Helper scripts and fallback assets shipped with a project.
pub const UTILS_DIR: &str = "utils";

/// Returns the shard component of `id` for the given level.
///
/// Level 0 is `id[0..3]`, level 1 is `id[3..6]`. Any other level, or an id
/// too short to shard, is rejected.
pub fn sub_dir(id: &str, index: usize) -> Result<&str> {
    let range = match index {
        0 => 0..3,
        1 => 3..6,
        other => {
            return Err(PipelineError::InvalidArgument(format!(
                "sub directory index must be 0 or 1, got {other}"
            )));
        }
    };

    id.get(range).ok_or_else(|| {
        PipelineError::InvalidArgument(format!("item id '{id}' is too short to shard"))
    })
}

/// Composes `[root/]items/<a>/<b>/<id>/<subdir>`.
///
/// Without a root the path is relative, which is the form stored in records
/// that must not embed an absolute filesystem location.
pub fn asset_dir(id: &str, root: Option<&Path>, subdir: &str) -> Result<PathBuf> {
    let mut path = root.map(Path::to_path_buf).unwrap_or_default();
    path.push(ITEMS_DIR);
    path.push(sub_dir(id, 0)?);
    path.push(sub_dir(id, 1)?);
    path.push(id);
    if !subdir.is_empty() {
        path.push(subdir);
    }
    Ok(path)
}

/// Scans `dir` and returns the next free asset number.
///
/// The directory is created when missing. Only the part of each file name
/// before the first `.` is considered, and only if it is purely numeric.
pub fn next_asset_number(dir: &Path) -> Result<u32> {
    fs::create_dir_all(dir).map_err(|err| {
        PipelineError::io(
            format!("could not create asset directory {}", dir.display()),
            err,
        )
    })?;

    let entries = fs::read_dir(dir).map_err(|err| {
        PipelineError::io(format!("could not list asset directory {}", dir.display()), err)
    })?;

    let mut highest = 0u32;
    for entry in entries {
        let entry = entry.map_err(|err| {
            PipelineError::io(format!("could not list asset directory {}", dir.display()), err)
        })?;
        let name = entry.file_name();
        let Some(number) = parse_asset_number(&name.to_string_lossy())? else {
            continue;
        };
        highest = highest.max(number);
    }

    Ok(highest + 1)
}

/// Parses the numeric prefix of an asset file name.
///
/// Returns `Ok(None)` for names that are not asset files and an error for
/// numbers above [`MAX_ASSET_NUMBER`].
pub fn parse_asset_number(file_name: &str) -> Result<Option<u32>> {
    let prefix = file_name.split('.').next().unwrap_or_default();
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }

    let number = prefix.parse::<u64>().unwrap_or(u64::MAX);
    if number > u64::from(MAX_ASSET_NUMBER) {
        return Err(PipelineError::InvalidAssetState(format!(
            "asset number {prefix} exceeds the maximum of {MAX_ASSET_NUMBER}"
        )));
    }

    Ok(u32::try_from(number).ok())
}

/// `003`, or `003.glb` when an extension is given.
pub fn asset_name(number: u32, extension: &str) -> String {
    if extension.trim().is_empty() {
        format!("{number:03}")
    } else {
        format!("{number:03}.{extension}")
    }
}

/// Renders a path for persistence: forward slashes regardless of host OS.
pub fn format_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Returns `path` relative to `root`, formatted for persistence.
pub fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        PipelineError::InvalidArgument(format!(
            "{} is not inside {}",
            path.display(),
            root.display()
        ))
    })?;

    let joined = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    Ok(joined)
}

/// Normalises an image file name to its asset name, keeping the extension.
///
/// `7.JPG` becomes `007.JPG`; names without a numeric stem are kept as is.
pub fn normalized_file_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    match stem.parse::<u32>() {
        Ok(number) if stem.bytes().all(|b| b.is_ascii_digit()) => asset_name(number, extension),
        _ => file_name,
    }
}

/// Directory layout of one project on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectDirs {
    root: PathBuf,
}

impl ProjectDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn item_dir(&self, item_id: &str) -> Result<PathBuf> {
        asset_dir(item_id, Some(&self.root), "")
    }

    pub fn images_dir(&self, item_id: &str) -> Result<PathBuf> {
        asset_dir(item_id, Some(&self.root), IMAGES_DIR)
    }

    pub fn models_dir(&self, item_id: &str) -> Result<PathBuf> {
        asset_dir(item_id, Some(&self.root), MODELS_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn utils_dir(&self) -> PathBuf {
        self.root.join(UTILS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn shards_item_ids() {
        let id = "0a1b2c3d4e";
        assert_eq!(sub_dir(id, 0).unwrap(), "0a1");
        assert_eq!(sub_dir(id, 1).unwrap(), "b2c");
        assert!(matches!(
            sub_dir(id, 2),
            Err(PipelineError::InvalidArgument(_))
        ));
        assert!(sub_dir("abcd", 1).is_err());
    }

    #[test]
    fn asset_dir_is_relative_without_root() {
        let dir = asset_dir("abcdef123", None, MODELS_DIR).unwrap();
        assert_eq!(format_path(&dir), "items/abc/def/abcdef123/models");

        let rooted = asset_dir("abcdef123", Some(Path::new("/srv/project")), IMAGES_DIR).unwrap();
        assert_eq!(
            rooted,
            PathBuf::from("/srv/project/items/abc/def/abcdef123/images")
        );
    }

    #[test]
    fn next_number_starts_at_one_and_creates_dir() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("missing");
        assert_eq!(next_asset_number(&dir).unwrap(), 1);
        assert!(dir.is_dir());
    }

    #[test]
    fn next_number_skips_non_numeric_names() {
        let tmp = tempdir().unwrap();
        for name in ["001.jpg", "002.jpg", "abc.txt", ".hidden"] {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        assert_eq!(next_asset_number(tmp.path()).unwrap(), 3);
    }

    #[test]
    fn next_number_rejects_runaway_names() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("1001.jpg"), b"x").unwrap();
        assert!(matches!(
            next_asset_number(tmp.path()),
            Err(PipelineError::InvalidAssetState(_))
        ));
    }

    #[test]
    fn written_asset_is_seen_by_next_scan() {
        let tmp = tempdir().unwrap();
        let number = next_asset_number(tmp.path()).unwrap();
        fs::create_dir(tmp.path().join(asset_name(number, ""))).unwrap();
        assert_eq!(next_asset_number(tmp.path()).unwrap(), number + 1);

        fs::write(tmp.path().join(asset_name(41, "glb")), b"x").unwrap();
        assert_eq!(next_asset_number(tmp.path()).unwrap(), 42);
    }

    #[test]
    fn names_are_zero_padded() {
        assert_eq!(asset_name(3, "glb"), "003.glb");
        assert_eq!(asset_name(3, ""), "003");
        assert_eq!(asset_name(1000, "jpg"), "1000.jpg");
    }

    #[test]
    fn persisted_paths_use_forward_slashes() {
        assert_eq!(format_path(Path::new("items\\abc\\def")), "items/abc/def");

        let root = Path::new("/srv/project");
        let dir = root.join("items/abc/def/abcdef/models/001");
        assert_eq!(
            relative_path(root, &dir).unwrap(),
            "items/abc/def/abcdef/models/001"
        );
    }

    #[test]
    fn normalizes_image_names() {
        assert_eq!(normalized_file_name(Path::new("/x/7.JPG")), "007.JPG");
        assert_eq!(normalized_file_name(Path::new("/x/012.png")), "012.png");
        assert_eq!(normalized_file_name(Path::new("/x/IMG_1.jpg")), "IMG_1.jpg");
    }
}
