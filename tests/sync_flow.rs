mod util;

use drt_device::bridge::{CommandOutput, MockBridge};
use drt_device::sync::{
    DeviceFileSync, EXTRACT_OK_MARKER, PrefixFilter, SyncError, SyncStage, check_freshness,
    Freshness,
};
use sha2::{Digest, Sha256};
use util::{LayoutTree, TestTracing, listing_line};

const REMOTE: &str = "/data/webkit/layout-tests";

/// 2011-09-06 06:49 UTC, minute precision.
const DEVICE_MTIME: i64 = 1_315_291_740;

fn device_listing() -> String {
    [
        format!("{REMOTE}:"),
        "total 2".to_string(),
        listing_line("a.html", 1, DEVICE_MTIME),
        "drwxrwxr-x root     sdcard_rw          2011-09-06 06:49 fast".to_string(),
        String::new(),
        format!("{REMOTE}/fast:"),
        listing_line("old.html", 3, DEVICE_MTIME),
        String::new(),
    ]
    .join("\n")
}

#[test]
fn sync_pushes_only_stale_files() {
    let tracing = TestTracing::new();
    let _guard = tracing.install();

    let tree = LayoutTree::new();
    tree.file("a.html", "a", DEVICE_MTIME as u64 + 30);
    tree.file("b.html", "b", 1_400_000_000);
    tree.file("fast/old.html", "old", 1_400_000_000);
    tree.file("fast/old-expected.txt", "expected", 1_400_000_000);
    tree.file("http/tests/xhr.html", "xhr", 1_400_000_000);
    tree.file("media/video.html", "video", 1_400_000_000);
    let helper = tree.scratch().join("drtunzip");
    std::fs::write(&helper, "helper").unwrap();

    let bridge = MockBridge::new()
        .with(&["shell", "ls", "-Rl"], &device_listing())
        .with(&["shell", "cd"], &format!("{EXTRACT_OK_MARKER}\n"));
    let engine = DeviceFileSync::new(&bridge, &helper);
    let report = engine
        .sync_test_files(&tree.root(), REMOTE, &PrefixFilter::new(["media"]))
        .unwrap();

    assert_eq!(report.files_considered, 3);
    assert_eq!(report.files_transferred, 2);
    assert!(report.helper_updated);
    assert!(report.archive_bytes > 0);

    let calls = bridge.calls();
    let joined = bridge.joined_calls();
    assert_eq!(joined[0], format!("shell ls -Rl {REMOTE}"));
    assert!(joined.contains(&"remount".to_string()));
    assert!(joined.contains(&format!("shell mkdir -p {REMOTE}")));
    assert!(joined.contains(&format!("shell touch {REMOTE}/.nomedia")));

    let pushes: Vec<_> = calls.iter().filter(|c| c[0] == "push").collect();
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[0][2], "/system/bin/drtunzip");
    assert!(pushes[1][1].ends_with("rlt-files.zip"));
    assert_eq!(pushes[1][2], format!("{REMOTE}/"));
    assert!(
        !std::path::Path::new(&pushes[1][1]).exists(),
        "host archive is removed after extraction"
    );

    assert_eq!(
        joined.last().unwrap(),
        &format!(
            "shell cd {REMOTE} && /system/bin/drtunzip rlt-files.zip && rm rlt-files.zip && echo {EXTRACT_OK_MARKER}"
        )
    );

    tracing.assert_contains("pushing layout test files to device");
}

#[test]
fn current_device_tree_pushes_nothing() {
    let tree = LayoutTree::new();
    tree.file("a.html", "a", DEVICE_MTIME as u64);
    tree.file("fast/old.html", "old", DEVICE_MTIME as u64 + 59);

    let bridge = MockBridge::new().with(&["shell", "ls", "-Rl"], &device_listing());
    let engine = DeviceFileSync::new(&bridge, tree.scratch().join("drtunzip"));
    let report = engine
        .sync_test_files(&tree.root(), REMOTE, &|_: &str| false)
        .unwrap();

    assert_eq!(report.files_considered, 2);
    assert_eq!(report.files_transferred, 0);
    assert_eq!(bridge.calls().len(), 1);
}

#[test]
fn current_helper_is_not_pushed_again() {
    let tree = LayoutTree::new();
    tree.file("new.html", "new", 1_400_000_000);
    let helper = tree.scratch().join("drtunzip");
    std::fs::write(&helper, "helper").unwrap();
    let digest = hex::encode(Sha256::digest(b"helper"));

    let bridge = MockBridge::new()
        .with(
            &["shell", "ls", "-l", "/system/bin/drtunzip"],
            "-rwxr-xr-x root shell 6 2013-01-01 00:00 drtunzip\n",
        )
        .with(
            &["shell", "sha256sum"],
            &format!("{digest}  /system/bin/drtunzip\n"),
        )
        .with(&["shell", "cd"], EXTRACT_OK_MARKER);

    assert_eq!(
        check_freshness(&bridge, &helper, "/system/bin/drtunzip").unwrap(),
        Freshness::Current
    );

    let engine = DeviceFileSync::new(&bridge, &helper);
    let report = engine
        .sync_test_files(&tree.root(), REMOTE, &|_: &str| false)
        .unwrap();

    assert!(!report.helper_updated);
    assert_eq!(bridge.count(&["remount"]), 0);
    assert_eq!(bridge.count(&["push"]), 1);
}

#[test]
fn missing_helper_fails_the_sync() {
    let tree = LayoutTree::new();
    tree.file("new.html", "new", 1_400_000_000);

    let bridge = MockBridge::new();
    let engine = DeviceFileSync::new(&bridge, tree.scratch().join("missing-drtunzip"));
    let err = engine
        .sync_test_files(&tree.root(), REMOTE, &|_: &str| false)
        .unwrap_err();

    match err {
        SyncError::FailedSync { stage, reason } => {
            assert_eq!(stage, SyncStage::HelperPush);
            assert!(reason.contains("missing-drtunzip"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(bridge.count(&["push"]), 0);
}

#[test]
fn helper_push_failure_is_reported() {
    let tree = LayoutTree::new();
    tree.file("new.html", "new", 1_400_000_000);
    let helper = tree.scratch().join("drtunzip");
    std::fs::write(&helper, "helper").unwrap();

    let bridge = MockBridge::new().with_outputs(&["push"], vec![CommandOutput::failed(1)]);
    let engine = DeviceFileSync::new(&bridge, &helper);
    let err = engine
        .sync_test_files(&tree.root(), REMOTE, &|_: &str| false)
        .unwrap_err();

    assert!(err.to_string().contains("pushing unpack helper"));
}
