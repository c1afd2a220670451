//! Live watching of a local directory, end to end: filesystem notification,
//! event translation and reconciliation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kura_core::{
    GenericFileHandler, HandlerRegistry, LibraryHandle, RunOptions, ScanContext, ScanStats,
    StorageRegistry, db,
};
use kura_model::{FileRecord, Library};

struct Setup {
    pool: sqlx::SqlitePool,
    library: Arc<LibraryHandle>,
    ctx: ScanContext,
    root: std::path::PathBuf,
    _tmp: tempfile::TempDir,
}

async fn setup() -> Setup {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("media");
    std::fs::create_dir(&root).unwrap();

    // A file database: the watch task holds a connection for its whole
    // lifetime, so the test needs more than one.
    let url = format!(
        "sqlite://{}?mode=rwc",
        tmp.path().join("catalog.db").display()
    );
    let pool = db::connect(&url).await.unwrap();

    let registry = StorageRegistry::with_defaults();
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(GenericFileHandler::new("test")));

    let record = Library::new(format!("file://{}", root.display()), "test");
    let library = Arc::new(
        LibraryHandle::create(&pool, &registry, record)
            .await
            .unwrap(),
    );
    let ctx = ScanContext::new(pool.clone(), Arc::new(handlers));

    Setup {
        pool,
        library,
        ctx,
        root,
        _tmp: tmp,
    }
}

impl Setup {
    async fn file(&self, path: &str) -> Option<FileRecord> {
        let mut conn = self.pool.acquire().await.unwrap();
        db::file_by_path(&mut conn, self.library.record().id, path)
            .await
            .unwrap()
    }

    /// Poll until the predicate holds for the row (or its absence).
    async fn wait_for(
        &self,
        path: &str,
        check: impl Fn(Option<&FileRecord>) -> bool,
    ) -> Option<FileRecord> {
        for _ in 0..100 {
            let row = self.file(path).await;
            if check(row.as_ref()) {
                return row;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("tracked state for {path:?} did not reach the expected shape in time");
    }
}

fn spawn_watch(
    setup: &Setup,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<kura_core::Result<ScanStats>> {
    let library = Arc::clone(&setup.library);
    let ctx = setup.ctx.clone();
    tokio::spawn(async move { library.watch(&ctx, &RunOptions::default(), stop).await })
}

#[tokio::test]
async fn watching_picks_up_created_files() {
    let setup = setup().await;
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_watch(&setup, Arc::clone(&stop));

    // Give the watcher a moment to register before producing changes.
    tokio::time::sleep(Duration::from_millis(500)).await;
    std::fs::write(setup.root.join("fresh.bin"), b"fresh content").unwrap();

    let row = setup
        .wait_for("fresh.bin", |row| row.is_some_and(FileRecord::available))
        .await
        .unwrap();
    assert!(row.available());

    stop.store(true, Ordering::Relaxed);
    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("watch did not honor the stop flag")
        .unwrap()
        .unwrap();
    assert!(stats.processed >= 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn watching_tracks_removals() {
    let setup = setup().await;
    std::fs::write(setup.root.join("doomed.bin"), b"short-lived").unwrap();
    setup
        .library
        .scan(&setup.ctx, &RunOptions::default())
        .await
        .unwrap();
    assert!(setup.file("doomed.bin").await.unwrap().available());

    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_watch(&setup, Arc::clone(&stop));
    tokio::time::sleep(Duration::from_millis(500)).await;

    std::fs::remove_file(setup.root.join("doomed.bin")).unwrap();
    let row = setup
        .wait_for("doomed.bin", |row| {
            row.is_some_and(|row| !row.available())
        })
        .await
        .unwrap();
    assert!(!row.available());

    stop.store(true, Ordering::Relaxed);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("watch did not honor the stop flag")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn idle_watch_stops_promptly() {
    let setup = setup().await;
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_watch(&setup, Arc::clone(&stop));

    tokio::time::sleep(Duration::from_millis(300)).await;
    stop.store(true, Ordering::Relaxed);

    // With nothing to report the loop notices the flag on its next poll
    // timeout.
    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("watch did not honor the stop flag")
        .unwrap()
        .unwrap();
    assert_eq!(stats, ScanStats::default());
}
