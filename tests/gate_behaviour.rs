// tests/gate_behaviour.rs

mod common;
use crate::common::{TestWorker, eventually, init_tracing, test_engine};

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::sleep;

use depengine::errors::EngineError;
use depengine::gate::{self, Waiter};
use depengine::manifold::Manifold;
use depengine::worker::Worker;

type TestResult = Result<(), Box<dyn Error>>;

/// A manifold that only starts once `gate` is open, counting its starts.
fn gated(starts: Arc<AtomicUsize>) -> Manifold {
    Manifold::new(["gate"], move |ctx| {
        let waiter: Waiter = ctx.get("gate")?;
        if !waiter.is_unlocked() {
            return Err(EngineError::Missing);
        }
        starts.fetch_add(1, Ordering::SeqCst);
        let worker: Arc<dyn Worker> = TestWorker::start(ctx.name())?;
        Ok(worker)
    })
}

#[tokio::test(start_paused = true)]
async fn dependents_wait_for_unlock_and_start_once() -> TestResult {
    init_tracing();
    let engine = test_engine();
    let (gate, unlocker) = gate::new_gate();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    engine.install("gate", gate).await?;
    engine.install("first", gated(first.clone())).await?;
    engine.install("second", gated(second.clone())).await?;

    sleep(Duration::from_secs(5)).await;
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 0);

    unlocker.unlock();
    eventually(|| first.load(Ordering::SeqCst) == 1 && second.load(Ordering::SeqCst) == 1).await;

    // Unlocking again is a no-op.
    unlocker.unlock();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.report().await.slot("gate").ok_or("no gate")?.generation,
        2
    );

    engine.kill();
    engine.wait().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn already_unlocked_gate_never_blocks() -> TestResult {
    init_tracing();
    let engine = test_engine();
    let starts = Arc::new(AtomicUsize::new(0));

    engine.install("gate", gate::already_unlocked()).await?;
    engine.install("user", gated(starts.clone())).await?;

    eventually(|| starts.load(Ordering::SeqCst) == 1).await;
    sleep(Duration::from_secs(5)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.report().await.slot("gate").ok_or("no gate")?.generation,
        1
    );

    engine.kill();
    engine.wait().await?;
    Ok(())
}

#[tokio::test]
async fn waiters_from_every_generation_see_the_unlock() -> TestResult {
    init_tracing();
    let lock = gate::Lock::new();
    let early = lock.waiter();
    let unlocker = lock.unlocker();

    let task = tokio::spawn(async move { early.unlocked().await });
    unlocker.unlock();
    tokio::time::timeout(Duration::from_secs(5), task).await??;

    let late = lock.waiter();
    assert!(late.is_unlocked());
    tokio::time::timeout(Duration::from_secs(5), late.unlocked()).await?;
    Ok(())
}
