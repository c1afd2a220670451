//! Event reconciliation against an in-memory store and database.

use std::sync::Arc;

use kura_core::{
    CommitEvent, GenericFileHandler, HandlerRegistry, LibraryHandle, MemoryStore, ScanContext,
    StorageRegistry, db,
};
use kura_model::{FileRecord, Library, ScanEvent};

struct Setup {
    pool: sqlx::SqlitePool,
    library: Arc<LibraryHandle>,
    ctx: ScanContext,
    store: MemoryStore,
}

async fn setup(store_name: &str) -> Setup {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = MemoryStore::named(store_name);
    store.clear();

    let pool = db::connect_in_memory().await.unwrap();
    let registry = StorageRegistry::with_defaults();
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(GenericFileHandler::new("test")));

    let record = Library::new(format!("memory://{store_name}"), "test");
    let library = LibraryHandle::create(&pool, &registry, record)
        .await
        .unwrap();
    let ctx = ScanContext::new(pool.clone(), Arc::new(handlers));

    Setup {
        pool,
        library: Arc::new(library),
        ctx,
        store,
    }
}

impl Setup {
    async fn commit(&self, event: ScanEvent) {
        event.commit(&self.library, &self.ctx).await.unwrap();
    }

    async fn file(&self, path: &str) -> Option<FileRecord> {
        let mut conn = self.pool.acquire().await.unwrap();
        db::file_by_path(&mut conn, self.library.record().id, path)
            .await
            .unwrap()
    }

    async fn file_count(&self) -> i64 {
        let mut conn = self.pool.acquire().await.unwrap();
        db::file_count(&mut conn, self.library.record().id)
            .await
            .unwrap()
    }

    async fn asset_count(&self) -> i64 {
        let mut conn = self.pool.acquire().await.unwrap();
        db::asset_count(&mut conn, self.library.record().id)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn new_file_enters_the_catalog() {
    let setup = setup("events-new-file").await;
    setup.store.set("photo.raw", b"pixels".to_vec());

    setup
        .commit(ScanEvent::File {
            path: "photo.raw".to_string(),
        })
        .await;

    let row = setup.file("photo.raw").await.expect("row should exist");
    assert!(row.available());
    assert_eq!(setup.asset_count().await, 1);
}

#[tokio::test]
async fn identical_files_share_one_asset() {
    let setup = setup("events-copies").await;
    setup.store.set("a.bin", b"same".to_vec());
    setup.store.set("b.bin", b"same".to_vec());

    setup
        .commit(ScanEvent::File {
            path: "a.bin".to_string(),
        })
        .await;
    setup
        .commit(ScanEvent::File {
            path: "b.bin".to_string(),
        })
        .await;

    let a = setup.file("a.bin").await.unwrap();
    let b = setup.file("b.bin").await.unwrap();
    assert_eq!(a.asset_id, b.asset_id);
    assert_eq!(setup.asset_count().await, 1);
    assert_eq!(setup.file_count().await, 2);
}

#[tokio::test]
async fn diverging_content_splits_and_merges_back() {
    let setup = setup("events-split").await;
    setup.store.set("a.bin", b"original".to_vec());
    setup.store.set("b.bin", b"original".to_vec());
    setup
        .commit(ScanEvent::File {
            path: "a.bin".to_string(),
        })
        .await;
    setup
        .commit(ScanEvent::File {
            path: "b.bin".to_string(),
        })
        .await;

    // Edit b: its row must leave the shared asset.
    setup.store.set("b.bin", b"edited".to_vec());
    setup
        .commit(ScanEvent::FileModified {
            path: "b.bin".to_string(),
        })
        .await;
    let a = setup.file("a.bin").await.unwrap();
    let b = setup.file("b.bin").await.unwrap();
    assert_ne!(a.asset_id, b.asset_id);
    assert!(b.available());
    assert_eq!(setup.asset_count().await, 2);

    // Revert b: identical content pulls it back onto a's asset.
    setup.store.set("b.bin", b"original".to_vec());
    setup
        .commit(ScanEvent::FileModified {
            path: "b.bin".to_string(),
        })
        .await;
    let a = setup.file("a.bin").await.unwrap();
    let b = setup.file("b.bin").await.unwrap();
    assert_eq!(a.asset_id, b.asset_id);
}

#[tokio::test]
async fn unchanged_files_are_not_reprocessed() {
    let setup = setup("events-idempotent").await;
    setup.store.set("doc.txt", b"text".to_vec());
    setup
        .commit(ScanEvent::File {
            path: "doc.txt".to_string(),
        })
        .await;
    let before = setup.file("doc.txt").await.unwrap();

    // The row was confirmed after the file's modification time, so a
    // redundant modified-event leaves it untouched.
    setup
        .commit(ScanEvent::FileModified {
            path: "doc.txt".to_string(),
        })
        .await;
    let after = setup.file("doc.txt").await.unwrap();
    assert_eq!(before.availability, after.availability);
    assert_eq!(before.id, after.id);
}

#[tokio::test]
async fn removal_keeps_the_row_for_refinding() {
    let setup = setup("events-refind").await;
    setup.store.set("old/name.bin", b"content".to_vec());
    setup
        .commit(ScanEvent::File {
            path: "old/name.bin".to_string(),
        })
        .await;
    let original = setup.file("old/name.bin").await.unwrap();

    setup.store.unset("old/name.bin");
    setup
        .commit(ScanEvent::FileRemoved {
            path: "old/name.bin".to_string(),
        })
        .await;
    let missing = setup.file("old/name.bin").await.unwrap();
    assert!(!missing.available());

    // Same content at a new path is recognized as the old row.
    setup.store.set("new/name.bin", b"content".to_vec());
    setup
        .commit(ScanEvent::File {
            path: "new/name.bin".to_string(),
        })
        .await;
    let refound = setup.file("new/name.bin").await.unwrap();
    assert_eq!(refound.id, original.id);
    assert!(refound.available());
    assert_eq!(setup.file_count().await, 1);
}

#[tokio::test]
async fn moved_file_keeps_its_row() {
    let setup = setup("events-move").await;
    setup.store.set("before.txt", b"stuff".to_vec());
    setup
        .commit(ScanEvent::File {
            path: "before.txt".to_string(),
        })
        .await;
    let original = setup.file("before.txt").await.unwrap();

    setup.store.unset("before.txt");
    setup.store.set("after.txt", b"stuff".to_vec());
    setup
        .commit(ScanEvent::FileMoved {
            old_path: "before.txt".to_string(),
            new_path: "after.txt".to_string(),
        })
        .await;

    assert!(setup.file("before.txt").await.is_none());
    let moved = setup.file("after.txt").await.unwrap();
    assert_eq!(moved.id, original.id);
    assert!(moved.available());
}

#[tokio::test]
async fn directory_move_carries_missing_rows_along() {
    let setup = setup("events-dir-move").await;
    setup.store.set("dir/a.txt", b"a".to_vec());
    setup.store.set("dir/b.txt", b"b".to_vec());
    setup
        .commit(ScanEvent::File {
            path: "dir/a.txt".to_string(),
        })
        .await;
    setup
        .commit(ScanEvent::File {
            path: "dir/b.txt".to_string(),
        })
        .await;

    setup.store.unset("dir/b.txt");
    setup
        .commit(ScanEvent::FileRemoved {
            path: "dir/b.txt".to_string(),
        })
        .await;

    setup.store.unset("dir/a.txt");
    setup.store.set("moved/a.txt", b"a".to_vec());
    setup
        .commit(ScanEvent::DirectoryMoved {
            old_path: "dir".to_string(),
            new_path: "moved".to_string(),
        })
        .await;

    let a = setup.file("moved/a.txt").await.unwrap();
    assert!(a.available());
    // The missing row moved too, so the content can be re-found there.
    let b = setup.file("moved/b.txt").await.unwrap();
    assert!(!b.available());
    assert!(setup.file("dir/a.txt").await.is_none());
}

#[tokio::test]
async fn directory_removal_marks_everything_missing() {
    let setup = setup("events-dir-remove").await;
    setup.store.set("gone/x.txt", b"x".to_vec());
    setup.store.set("gone/sub/y.txt", b"y".to_vec());
    setup.store.set("kept.txt", b"k".to_vec());
    for path in ["gone/x.txt", "gone/sub/y.txt", "kept.txt"] {
        setup
            .commit(ScanEvent::File {
                path: path.to_string(),
            })
            .await;
    }

    setup.store.unset("gone/x.txt");
    setup.store.unset("gone/sub/y.txt");
    setup
        .commit(ScanEvent::DirectoryRemoved {
            path: "gone".to_string(),
        })
        .await;

    assert!(!setup.file("gone/x.txt").await.unwrap().available());
    assert!(!setup.file("gone/sub/y.txt").await.unwrap().available());
    assert!(setup.file("kept.txt").await.unwrap().available());
}

#[tokio::test]
async fn removal_of_untracked_paths_is_a_noop() {
    let setup = setup("events-untracked").await;
    setup
        .commit(ScanEvent::FileRemoved {
            path: "never/seen.txt".to_string(),
        })
        .await;
    setup
        .commit(ScanEvent::DirectoryRemoved {
            path: "never".to_string(),
        })
        .await;
    assert_eq!(setup.file_count().await, 0);
}

#[tokio::test]
async fn marker_directories_are_excluded_and_reversible() {
    let setup = setup("events-ignored").await;
    setup.store.set("hidden/.nomedia", b"".to_vec());
    setup.store.set("hidden/secret.txt", b"s".to_vec());

    setup
        .commit(ScanEvent::File {
            path: "hidden/secret.txt".to_string(),
        })
        .await;
    assert!(setup.file("hidden/secret.txt").await.is_none());

    // Deleting the marker makes the directory scannable again.
    setup.store.unset("hidden/.nomedia");
    setup
        .commit(ScanEvent::FileRemoved {
            path: "hidden/.nomedia".to_string(),
        })
        .await;
    setup
        .commit(ScanEvent::File {
            path: "hidden/secret.txt".to_string(),
        })
        .await;
    assert!(setup.file("hidden/secret.txt").await.unwrap().available());
}

#[tokio::test]
async fn marker_appearing_hides_tracked_files() {
    let setup = setup("events-ignored-late").await;
    setup.store.set("dir/file.txt", b"f".to_vec());
    setup
        .commit(ScanEvent::File {
            path: "dir/file.txt".to_string(),
        })
        .await;
    assert!(setup.file("dir/file.txt").await.unwrap().available());

    setup.store.set("dir/.nomedia", b"".to_vec());
    setup
        .commit(ScanEvent::File {
            path: "dir/.nomedia".to_string(),
        })
        .await;
    setup
        .commit(ScanEvent::FileModified {
            path: "dir/file.txt".to_string(),
        })
        .await;
    assert!(!setup.file("dir/file.txt").await.unwrap().available());
}

#[tokio::test]
async fn unclaimed_files_stay_out_of_the_catalog() {
    let store = MemoryStore::named("events-unclaimed");
    store.clear();
    store.set("file.dat", b"data".to_vec());

    let pool = db::connect_in_memory().await.unwrap();
    let registry = StorageRegistry::with_defaults();
    let mut handlers = HandlerRegistry::new();
    // Handler for a different library context: it declines everything here.
    handlers.register(Arc::new(GenericFileHandler::new("other-context")));

    let record = Library::new("memory://events-unclaimed", "test");
    let library = Arc::new(
        LibraryHandle::create(&pool, &registry, record)
            .await
            .unwrap(),
    );
    let ctx = ScanContext::new(pool.clone(), Arc::new(handlers));

    ScanEvent::File {
        path: "file.dat".to_string(),
    }
    .commit(&library, &ctx)
    .await
    .unwrap();

    let mut conn = pool.acquire().await.unwrap();
    assert_eq!(
        db::file_count(&mut conn, library.record().id).await.unwrap(),
        0
    );
}
