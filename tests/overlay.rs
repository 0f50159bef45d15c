//! Overlay behaviour through the public contract.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{RemoteSim, init_tracing, names};
use layerfs::*;

fn p(s: &str) -> &Path {
    Path::new(s)
}

async fn layers() -> (Arc<MemoryFs>, Arc<MemoryFs>) {
    init_tracing();
    let upper = Arc::new(MemoryFs::new());
    let lower = Arc::new(MemoryFs::new());
    lower.mkdir(p("/dir"), 0o755).await.unwrap();
    lower.write_file(p("/dir/A"), b"from lower", 0o644).await.unwrap();
    lower.write_file(p("/greeting"), b"hello", 0o644).await.unwrap();
    (upper, lower)
}

// =============================================================================
// Copy-up
// =============================================================================

#[tokio::test]
async fn writing_a_lower_file_leaves_lower_unchanged() {
    let (upper, lower) = layers().await;
    let overlay = OverlayFs::new(upper.clone(), lower.clone()).await.unwrap();

    overlay.write_file(p("/greeting"), b"world", 0o644).await.unwrap();

    assert_eq!(overlay.read_file(p("/greeting")).await.unwrap(), b"world");
    assert_eq!(upper.read_file(p("/greeting")).await.unwrap(), b"world");
    assert_eq!(lower.read_file(p("/greeting")).await.unwrap(), b"hello");
}

#[tokio::test]
async fn appending_copies_up_existing_content_first() {
    let (upper, lower) = layers().await;
    let overlay = OverlayFs::new(upper.clone(), lower.clone()).await.unwrap();

    overlay.append_file(p("/dir/A"), b" + upper", 0o644).await.unwrap();

    assert_eq!(
        overlay.read_file(p("/dir/A")).await.unwrap(),
        b"from lower + upper"
    );
    assert_eq!(lower.read_file(p("/dir/A")).await.unwrap(), b"from lower");
    assert!(upper.is_dir(p("/dir")).await.unwrap());
}

#[tokio::test]
async fn failed_copy_up_leaves_upper_clean() {
    init_tracing();
    let upper = Arc::new(RemoteSim::new());
    let lower = Arc::new(MemoryFs::new());
    lower.mkdir(p("/d"), 0o750).await.unwrap();
    lower.write_file(p("/d/f"), b"data", 0o644).await.unwrap();
    let overlay = OverlayFs::new(upper.clone(), lower.clone()).await.unwrap();

    upper.fail_once("write_file", "/d/f", FsError::io("disk full"));
    let err = overlay.chmod(p("/d/f"), 0o600).await.unwrap_err();
    assert_eq!(err, FsError::io("disk full"));

    assert!(!upper.store().exists_sync(p("/d")).unwrap());
    assert!(!upper.store().exists_sync(p("/d/f")).unwrap());
    assert_eq!(overlay.read_file(p("/d/f")).await.unwrap(), b"data");
    assert_eq!(
        overlay.stat(p("/d/f")).await.unwrap().permissions.mode(),
        0o644
    );

    // The next attempt goes through.
    overlay.chmod(p("/d/f"), 0o600).await.unwrap();
    assert_eq!(
        upper.store().stat_sync(p("/d/f")).unwrap().permissions.mode(),
        0o600
    );
    assert_eq!(
        upper.store().stat_sync(p("/d")).unwrap().permissions.mode(),
        0o750
    );
}

#[tokio::test]
async fn concurrent_writers_copy_up_once() {
    init_tracing();
    let sim = Arc::new(RemoteSim::new());
    sim.store().write_file_sync(p("/shared"), b"base", 0o644).unwrap();
    let overlay = Arc::new(
        OverlayFs::new(Arc::new(MemoryFs::new()), sim.clone())
            .await
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let overlay = Arc::clone(&overlay);
        tasks.push(tokio::spawn(async move {
            overlay.append_file(p("/shared"), &[b'0' + i], 0o644).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(sim.ops_named("read_file"), ["read_file /shared"]);
    let content = overlay.read_file(p("/shared")).await.unwrap();
    assert_eq!(content.len(), 4 + 8);
    assert!(content.starts_with(b"base"));
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test]
async fn deleting_a_lower_path_hides_it_only_through_the_overlay() {
    let (upper, lower) = layers().await;
    let overlay = OverlayFs::new(upper, lower.clone()).await.unwrap();

    overlay.unlink(p("/greeting")).await.unwrap();

    assert!(!overlay.exists(p("/greeting")).await.unwrap());
    assert!(overlay.stat(p("/greeting")).await.unwrap_err().is_not_found());
    assert!(overlay.read_file(p("/greeting")).await.unwrap_err().is_not_found());
    assert!(lower.exists(p("/greeting")).await.unwrap());
    assert_eq!(lower.read_file(p("/greeting")).await.unwrap(), b"hello");
    assert_eq!(overlay.deleted_paths().await, [p("/greeting").to_path_buf()]);
}

#[tokio::test]
async fn listing_merges_layers_and_drops_deleted_entries() {
    let (upper, lower) = layers().await;
    let overlay = OverlayFs::new(upper, lower).await.unwrap();

    overlay.write_file(p("/dir/B"), b"from upper", 0o644).await.unwrap();
    assert_eq!(names(&overlay, "/dir").await, ["A", "B"]);

    overlay.unlink(p("/dir/A")).await.unwrap();
    assert_eq!(names(&overlay, "/dir").await, ["B"]);
}

#[tokio::test]
async fn recreating_a_deleted_path_clears_its_tombstone() {
    let (upper, lower) = layers().await;
    let overlay = OverlayFs::new(upper, lower).await.unwrap();

    overlay.unlink(p("/greeting")).await.unwrap();
    overlay.write_file(p("/greeting"), b"again", 0o644).await.unwrap();

    assert_eq!(overlay.read_file(p("/greeting")).await.unwrap(), b"again");
    assert!(overlay.deleted_paths().await.is_empty());
}

#[tokio::test]
async fn tombstones_survive_reconstruction() {
    let (upper, lower) = layers().await;
    {
        let overlay = OverlayFs::new(upper.clone(), lower.clone()).await.unwrap();
        overlay.unlink(p("/dir/A")).await.unwrap();
        overlay.rmdir(p("/dir")).await.unwrap();
    }

    let log = upper.read_file(p(DELETION_LOG)).await.unwrap();
    let lines: Vec<&str> = std::str::from_utf8(&log).unwrap().lines().collect();
    assert_eq!(lines, ["/dir", "/dir/A"]);

    let reopened = OverlayFs::new(upper, lower).await.unwrap();
    assert!(!reopened.exists(p("/dir")).await.unwrap());
    assert!(!reopened.exists(p("/dir/A")).await.unwrap());
    assert_eq!(names(&reopened, "/").await, ["greeting"]);
}

#[tokio::test]
async fn stale_upper_copies_of_deleted_paths_are_purged_on_load() {
    let (upper, lower) = layers().await;
    // Simulate a crash after the content write but before the tombstone
    // was cleared.
    upper
        .write_file(p(DELETION_LOG), b"/greeting\n", 0o644)
        .await
        .unwrap();
    upper.write_file(p("/greeting"), b"half-done", 0o644).await.unwrap();

    let overlay = OverlayFs::new(upper.clone(), lower).await.unwrap();
    assert!(!overlay.exists(p("/greeting")).await.unwrap());
    assert!(!upper.exists(p("/greeting")).await.unwrap());
}

#[tokio::test]
async fn deletion_log_is_never_listed_or_reachable() {
    let (upper, lower) = layers().await;
    let overlay = OverlayFs::new(upper, lower).await.unwrap();
    overlay.unlink(p("/greeting")).await.unwrap();

    assert_eq!(names(&overlay, "/").await, ["dir"]);
    assert!(!overlay.exists(p(DELETION_LOG)).await.unwrap());
    assert!(overlay.read_file(p(DELETION_LOG)).await.unwrap_err().is_not_found());
    assert_eq!(
        overlay
            .write_file(p(DELETION_LOG), b"", 0o644)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::PermissionDenied
    );
    assert_eq!(
        overlay.unlink(p(DELETION_LOG)).await.unwrap_err().kind(),
        ErrorKind::PermissionDenied
    );
}

// =============================================================================
// Composition
// =============================================================================

#[tokio::test]
async fn overlay_over_read_only_lower_via_layer() {
    let (upper, lower) = layers().await;
    let guarded: Arc<dyn FileSystem> = Arc::new(lower.clone().layer(ReadOnlyLayer));
    let overlay = OverlayFs::new(upper, guarded).await.unwrap();

    overlay.rename(p("/greeting"), p("/dir/moved")).await.unwrap();
    assert_eq!(overlay.read_file(p("/dir/moved")).await.unwrap(), b"hello");
    assert!(!overlay.exists(p("/greeting")).await.unwrap());
    assert!(lower.exists(p("/greeting")).await.unwrap());

    let h = overlay.open(p("/dir/A"), OpenFlags::READ, 0).await.unwrap();
    assert_eq!(
        overlay.write(h, b"x", None).await.unwrap_err().kind(),
        ErrorKind::ReadOnlyFilesystem
    );
    overlay.close(h).await.unwrap();
}

#[tokio::test]
async fn overlays_stack() {
    let (upper, lower) = layers().await;
    let inner: Arc<dyn FileSystem> = Arc::new(OverlayFs::new(upper, lower).await.unwrap());
    let top_upper = Arc::new(MemoryFs::new());
    let outer = OverlayFs::new(top_upper.clone(), inner.clone()).await.unwrap();

    outer.unlink(p("/greeting")).await.unwrap();
    assert!(!outer.exists(p("/greeting")).await.unwrap());
    assert!(inner.exists(p("/greeting")).await.unwrap());
    assert!(top_upper.exists(p(DELETION_LOG)).await.unwrap());
}

#[test]
fn blocking_forms_match_async_results() {
    init_tracing();
    let upper = Arc::new(MemoryFs::new());
    let lower = Arc::new(MemoryFs::new());
    lower.write_file_sync(p("/f"), b"lower", 0o644).unwrap();
    let overlay = OverlayFs::new_sync(upper, lower.clone()).unwrap();

    overlay.write_file_sync(p("/f"), b"upper", 0o644).unwrap();
    assert_eq!(overlay.read_file_sync(p("/f")).unwrap(), b"upper");
    overlay.unlink_sync(p("/f")).unwrap();
    assert!(!overlay.exists_sync(p("/f")).unwrap());
    assert_eq!(lower.read_file_sync(p("/f")).unwrap(), b"lower");
}
