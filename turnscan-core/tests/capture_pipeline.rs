mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{
    ITEM_ID, RecordingBackgroundRemoval, RecordingCamera, RecordingTurntable, Shot,
    capture_registry, fast_tuning, fast_watch,
};
use tempfile::TempDir;
use turnscan_core::{
    CaptureOrchestrator, CaptureParams, FilesystemFileRepository, ImageSet, PipelineError,
    ProgressMonitor, ProjectDirs, StaticPeripheralConfig,
};

struct Rig {
    _root: TempDir,
    dirs: ProjectDirs,
    turntable: Arc<RecordingTurntable>,
    camera: Arc<RecordingCamera>,
    remover: Arc<RecordingBackgroundRemoval>,
    orchestrator: CaptureOrchestrator,
}

fn rig(camera: RecordingCamera) -> Rig {
    rig_with_remover(camera, RecordingBackgroundRemoval::default())
}

fn rig_with_remover(camera: RecordingCamera, remover: RecordingBackgroundRemoval) -> Rig {
    let root = TempDir::new().unwrap();
    let dirs = ProjectDirs::new(root.path());
    let turntable = Arc::new(RecordingTurntable::default());
    let camera = Arc::new(camera);
    let remover = Arc::new(remover);
    let orchestrator = CaptureOrchestrator::new(
        capture_registry(turntable.clone(), camera.clone(), remover.clone()),
        Arc::new(StaticPeripheralConfig::default()),
        Arc::new(FilesystemFileRepository),
        dirs.clone(),
        fast_tuning(),
        fast_watch(),
    );
    Rig {
        _root: root,
        dirs,
        turntable,
        camera,
        remover,
        orchestrator,
    }
}

fn params(num_photos: u32, use_turntable: bool, remove_backgrounds: bool) -> CaptureParams {
    CaptureParams {
        num_photos,
        use_turntable,
        turntable_delay_ms: 0,
        remove_backgrounds,
    }
}

fn monitor() -> Arc<ProgressMonitor> {
    Arc::new(ProgressMonitor::new("CaptureImages", "start"))
}

fn files_on_disk(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn capture_without_turntable_never_rotates() {
    let rig = rig(RecordingCamera::default());

    let sets = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(3, false, false), monitor())
        .await
        .unwrap();

    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].files, vec!["001.jpg", "002.jpg", "003.jpg"]);
    assert!(sets[0].model_input);
    assert!(!sets[0].background_removed);

    assert_eq!(rig.turntable.calls.initialized(), 0);
    assert_eq!(rig.turntable.calls.operations(), 0);
    assert_eq!(rig.turntable.calls.torn_down(), 0);
    assert_eq!(rig.camera.calls.torn_down(), 1);
    assert_eq!(rig.remover.calls.torn_down(), 1);
}

#[tokio::test]
async fn turntable_rotates_once_per_photo() {
    let rig = rig(RecordingCamera::default());

    let sets = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(4, true, false), monitor())
        .await
        .unwrap();

    assert_eq!(sets[0].files.len(), 4);
    assert_eq!(*rig.turntable.divisions.lock().unwrap(), vec![4, 4, 4, 4]);
    assert_eq!(rig.turntable.calls.initialized(), 1);
    assert_eq!(rig.turntable.calls.torn_down(), 1);
}

#[tokio::test]
async fn trigger_timeout_still_tears_everything_down() {
    let rig = rig(RecordingCamera::broken());
    let monitor = monitor();

    let err = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(2, true, true), monitor.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Timeout { .. }), "{err}");
    assert_eq!(rig.camera.calls.torn_down(), 1);
    assert_eq!(rig.remover.calls.torn_down(), 1);
    assert_eq!(rig.turntable.calls.torn_down(), 1);
    assert_eq!(rig.turntable.calls.operations(), 0);
    assert!(monitor.snapshot().error.is_some());
}

#[tokio::test]
async fn background_removal_yields_second_image_set() {
    let rig = rig(RecordingCamera::default());

    let sets = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(2, false, true), monitor())
        .await
        .unwrap();

    assert_eq!(sets.len(), 2);
    assert!(!sets[0].model_input);
    assert_eq!(sets[0].files, vec!["001.jpg", "002.jpg"]);
    assert_eq!(
        sets[1],
        ImageSet {
            files: vec!["001.png".to_string(), "002.png".to_string()],
            model_input: true,
            background_removed: true,
        }
    );
    assert_eq!(rig.remover.calls.operations(), 2);
    assert_eq!(ImageSet::model_inputs(&sets), vec![sets[1].clone()]);
}

#[tokio::test]
async fn derivatives_are_ignored_unless_requested() {
    let rig = rig(RecordingCamera::default());

    let sets = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(2, false, false), monitor())
        .await
        .unwrap();

    assert_eq!(sets.len(), 1);
    assert_eq!(rig.remover.calls.operations(), 0);
}

#[tokio::test]
async fn cancellation_returns_partial_result() {
    let rig = rig(RecordingCamera::cancelling_after(2));
    let monitor = monitor();

    let sets = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(6, true, false), monitor.clone())
        .await
        .unwrap();

    assert!(monitor.is_cancelled());
    assert_eq!(sets.len(), 1);
    assert!(sets[0].files.len() <= 2);
    assert_eq!(rig.camera.calls.operations(), 2);
    assert_eq!(rig.turntable.calls.torn_down(), 1);
    assert_eq!(rig.camera.calls.torn_down(), 1);
    assert_eq!(rig.remover.calls.torn_down(), 1);
}

#[tokio::test]
async fn numbering_continues_after_existing_images() {
    let rig = rig(RecordingCamera::default());
    let images = rig.dirs.images_dir(ITEM_ID).unwrap();
    fs::create_dir_all(&images).unwrap();
    fs::write(images.join("001.jpg"), b"old").unwrap();
    fs::write(images.join("002.jpg"), b"old").unwrap();

    let sets = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(2, false, false), monitor())
        .await
        .unwrap();

    assert_eq!(sets[0].files, vec!["003.jpg", "004.jpg"]);
}

#[tokio::test]
async fn standalone_background_removal_processes_every_file() {
    let rig = rig(RecordingCamera::default());
    let images = rig.dirs.images_dir(ITEM_ID).unwrap();
    fs::create_dir_all(&images).unwrap();
    fs::write(images.join("001.jpg"), b"a").unwrap();
    fs::write(images.join("002.jpg"), b"b").unwrap();
    let set = ImageSet {
        files: vec!["001.jpg".to_string(), "002.jpg".to_string()],
        model_input: true,
        background_removed: false,
    };

    let monitor = monitor();
    let derivatives = rig
        .orchestrator
        .remove_backgrounds(ITEM_ID, &set, monitor.clone())
        .await
        .unwrap();

    assert_eq!(
        derivatives,
        vec![images.join("001.png"), images.join("002.png")]
    );
    assert_eq!(rig.remover.calls.initialized(), 1);
    assert_eq!(rig.remover.calls.torn_down(), 1);
    assert_eq!(rig.camera.calls.initialized(), 0);
    assert_eq!(
        monitor.label(),
        "Progress.CaptureImages.backgroundRemovalInProgress"
    );
}

#[tokio::test]
async fn unpadded_camera_files_and_derivatives_are_renamed_together() {
    let rig = rig(RecordingCamera::shooting(Shot::Unpadded(7)));

    let sets = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(2, false, true), monitor())
        .await
        .unwrap();

    assert_eq!(sets.len(), 2);
    assert_eq!(sets[0].files, vec!["007.jpg", "008.jpg"]);
    assert_eq!(sets[1].files, vec!["007.png", "008.png"]);
    let images = rig.dirs.images_dir(ITEM_ID).unwrap();
    assert_eq!(
        files_on_disk(&images),
        vec!["007.jpg", "007.png", "008.jpg", "008.png"]
    );
}

#[tokio::test]
async fn taken_asset_name_gets_a_fresh_number() {
    let rig = rig(RecordingCamera::shooting(Shot::Unpadded(1)));
    let images = rig.dirs.images_dir(ITEM_ID).unwrap();
    fs::create_dir_all(&images).unwrap();
    fs::write(images.join("001.jpg"), b"old").unwrap();

    let sets = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(2, false, true), monitor())
        .await
        .unwrap();

    assert_eq!(sets[0].files, vec!["002.jpg", "003.jpg"]);
    assert_eq!(sets[1].files, vec!["002.png", "003.png"]);
    assert_eq!(fs::read(images.join("001.jpg")).unwrap(), b"old");
    for set in &sets {
        for file in &set.files {
            assert!(images.join(file).is_file(), "{file} missing on disk");
        }
    }
    assert_eq!(
        files_on_disk(&images),
        vec!["001.jpg", "002.jpg", "002.png", "003.jpg", "003.png"]
    );
}

#[tokio::test]
async fn file_that_never_becomes_ready_fails_the_run() {
    let rig = rig(RecordingCamera::shooting(Shot::Empty));
    let monitor = monitor();

    let err = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(2, true, false), monitor.clone())
        .await
        .unwrap_err();

    let images = rig.dirs.images_dir(ITEM_ID).unwrap();
    match err {
        PipelineError::FileNotReady(path) => assert_eq!(path.parent(), Some(images.as_path())),
        other => panic!("expected FileNotReady, got {other}"),
    }
    assert_eq!(rig.turntable.calls.torn_down(), 1);
    assert_eq!(rig.camera.calls.torn_down(), 1);
    assert_eq!(rig.remover.calls.torn_down(), 1);
    assert!(monitor.snapshot().error.is_some());
}

#[tokio::test]
async fn failed_background_removal_fails_the_run() {
    let rig = rig_with_remover(
        RecordingCamera::default(),
        RecordingBackgroundRemoval::failing(),
    );
    let monitor = monitor();

    let err = rig
        .orchestrator
        .capture_photos(ITEM_ID, &params(2, false, true), monitor.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Peripheral { .. }), "{err}");
    assert_eq!(rig.camera.calls.torn_down(), 1);
    assert_eq!(rig.remover.calls.torn_down(), 1);
    assert!(monitor.snapshot().error.is_some());
}
