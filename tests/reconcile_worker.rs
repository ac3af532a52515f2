// tests/reconcile_worker.rs

mod common;
use crate::common::{FakeBroker, FakeStateSource, eventually, init_tracing, with_timeout};

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use depengine::errors::EngineError;
use depengine::fs::mock::MockFileSystem;
use depengine::reconcile::worker::wait_for_phase;
use depengine::reconcile::{
    Broker, ContainerSpec, FileBroker, Phase, ReconcileParams, ReconcileWorker, StateSource,
};
use depengine::worker::Worker;

type TestResult = Result<(), Box<dyn Error>>;

const UNIT: &str = "mysql/0";

fn start(
    source: &FakeStateSource,
    broker: Arc<dyn Broker<ContainerSpec>>,
) -> Result<Arc<ReconcileWorker<ContainerSpec>>, EngineError> {
    let source: Arc<dyn StateSource> = Arc::new(source.clone());
    ReconcileWorker::start(ReconcileParams {
        group: "mysql".into(),
        entity: UNIT.into(),
        source,
        broker,
    })
}

#[tokio::test]
async fn undefined_spec_is_not_an_error() -> TestResult {
    init_tracing();
    let source = FakeStateSource::new();
    let broker = FakeBroker::<ContainerSpec>::new();
    let worker = start(&source, Arc::new(broker.clone()))?;

    with_timeout(source.wait_for_fetches(1)).await;
    with_timeout(wait_for_phase(worker.phase_watch(), Phase::Watching)).await?;
    assert!(broker.calls().is_empty());
    assert!(
        tokio::time::timeout(Duration::from_millis(50), worker.wait())
            .await
            .is_err(),
        "worker should keep running"
    );

    worker.kill();
    with_timeout(worker.wait()).await?;
    assert_eq!(worker.phase(), Phase::Stopped);
    Ok(())
}

#[tokio::test]
async fn every_change_is_applied() -> TestResult {
    init_tracing();
    let source = FakeStateSource::new();
    let broker = FakeBroker::<ContainerSpec>::new();
    let worker = start(&source, Arc::new(broker.clone()))?;
    with_timeout(source.wait_for_fetches(1)).await;

    source.set(UNIT, "image = \"mysql:8.0\"\nports = [{ container_port = 3306 }]\n");
    with_timeout(broker.wait_for_calls(1)).await;

    source.set(UNIT, "image = \"mysql:8.4\"\n");
    with_timeout(broker.wait_for_calls(2)).await;

    let calls = broker.calls();
    assert_eq!(calls[0].group, "mysql");
    assert_eq!(calls[0].entity, UNIT);
    assert_eq!(calls[0].payload.image, "mysql:8.0");
    assert_eq!(calls[0].payload.ports[0].container_port, 3306);
    assert_eq!(calls[1].payload.image, "mysql:8.4");
    assert!(calls[1].payload.ports.is_empty());

    worker.kill();
    with_timeout(worker.wait()).await?;
    Ok(())
}

#[tokio::test]
async fn broker_failure_ends_the_worker() -> TestResult {
    init_tracing();
    let source = FakeStateSource::new();
    source.set(UNIT, "image = \"mysql:8.0\"\n");
    let broker = FakeBroker::<ContainerSpec>::new();
    broker.fail_with(Some(EngineError::Config("registry down".into())));

    let worker = start(&source, Arc::new(broker.clone()))?;
    let result = with_timeout(worker.wait()).await;

    assert!(matches!(result, Err(EngineError::Config(msg)) if msg == "registry down"));
    assert_eq!(worker.phase(), Phase::Stopped);
    assert_eq!(broker.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn invalid_spec_ends_the_worker_with_context() -> TestResult {
    init_tracing();
    let source = FakeStateSource::new();
    source.set(UNIT, "image = \"\"\n");
    let broker = FakeBroker::<ContainerSpec>::new();

    let worker = start(&source, Arc::new(broker.clone()))?;
    let err = with_timeout(worker.wait())
        .await
        .err()
        .ok_or("invalid spec accepted")?;

    assert!(err.to_string().contains("cannot parse container spec"));
    assert!(broker.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn fetch_failure_ends_the_worker() -> TestResult {
    init_tracing();
    let source = FakeStateSource::new();
    source.fail_fetches(Some(EngineError::Config("api unreachable".into())));
    let broker = FakeBroker::<ContainerSpec>::new();

    let worker = start(&source, Arc::new(broker.clone()))?;
    let result = with_timeout(worker.wait()).await;
    assert!(matches!(result, Err(EngineError::Config(_))));
    Ok(())
}

#[tokio::test]
async fn closed_watch_ends_the_worker() -> TestResult {
    init_tracing();
    let source = FakeStateSource::new();
    let broker = FakeBroker::<ContainerSpec>::new();
    let worker = start(&source, Arc::new(broker))?;
    with_timeout(source.wait_for_fetches(1)).await;

    source.close_watches(UNIT);
    let result = with_timeout(worker.wait()).await;
    assert!(matches!(result, Err(EngineError::WatcherClosed)));
    Ok(())
}

#[tokio::test]
async fn identical_specs_are_deployed_once() -> TestResult {
    init_tracing();
    let fs = MockFileSystem::new();
    let file_broker = Arc::new(FileBroker::new("deployed", Arc::new(fs.clone())));
    let source = FakeStateSource::new();
    source.set(UNIT, "image = \"mysql:8.0\"\n");

    let worker = start(&source, file_broker.clone())?;
    with_timeout(source.wait_for_fetches(1)).await;
    eventually(|| file_broker.writes() == 1).await;

    source.notify(UNIT);
    with_timeout(source.wait_for_fetches(2)).await;
    eventually(|| worker.phase() == Phase::Watching).await;
    assert_eq!(file_broker.writes(), 1);
    assert_eq!(fs.writes(), 1);

    let deployed = fs
        .contents("deployed/mysql/mysql-0.toml")
        .ok_or("spec not deployed")?;
    assert!(deployed.contains("mysql:8.0"));

    worker.kill();
    with_timeout(worker.wait()).await?;
    Ok(())
}
