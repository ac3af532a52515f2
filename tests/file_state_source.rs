// tests/file_state_source.rs

mod common;
use crate::common::{eventually, init_tracing, with_timeout};

use std::error::Error;
use std::sync::Arc;

use tempfile::tempdir;

use depengine::fs::{FileSystem, RealFileSystem};
use depengine::reconcile::{
    ContainerSpec, FileBroker, FileStateSource, ReconcileParams, ReconcileWorker, StateSource,
};
use depengine::worker::Worker;

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn fetch_reads_unit_spec_files() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let source = FileStateSource::new(dir.path().join("state"), Arc::new(RealFileSystem))?;
    assert!(source.dir().is_dir());

    let err = source.fetch("mysql/0").await.err().ok_or("spec found")?;
    assert!(err.is_not_found());

    std::fs::write(source.spec_path("mysql/0"), "image = \"mysql:8.0\"\n")?;
    assert_eq!(source.fetch("mysql/0").await?, "image = \"mysql:8.0\"\n");
    Ok(())
}

#[tokio::test]
async fn watch_notifies_initially_and_on_change() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let source = FileStateSource::new(dir.path(), Arc::new(RealFileSystem))?;

    let mut watch = source.watch("mysql/0")?;
    with_timeout(watch.changes.recv())
        .await
        .ok_or("watch closed")?;

    RealFileSystem.write(&source.spec_path("mysql/0"), b"image = \"mysql:8.0\"\n")?;
    with_timeout(watch.changes.recv())
        .await
        .ok_or("watch closed")?;

    watch.worker.kill();
    with_timeout(watch.worker.wait()).await?;
    Ok(())
}

#[tokio::test]
async fn spec_files_are_deployed_end_to_end() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let source = Arc::new(FileStateSource::new(dir.path().join("state"), fs.clone())?);
    let broker = Arc::new(FileBroker::new(dir.path().join("deployed"), fs));

    let worker = ReconcileWorker::<ContainerSpec>::start(ReconcileParams {
        group: "mysql".into(),
        entity: "mysql/0".into(),
        source: source.clone(),
        broker: broker.clone(),
    })?;

    std::fs::write(
        source.spec_path("mysql/0"),
        "image = \"mysql:8.0\"\nports = [{ container_port = 3306 }]\n",
    )?;

    let deployed = broker.unit_path("mysql", "mysql/0");
    eventually(|| deployed.exists()).await;
    let text = std::fs::read_to_string(&deployed)?;
    assert!(text.contains("mysql:8.0"));
    assert!(text.contains("3306"));

    worker.kill();
    with_timeout(worker.wait()).await?;
    Ok(())
}
