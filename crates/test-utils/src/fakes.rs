use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use depengine::errors::{EngineError, Result};
use depengine::reconcile::{Broker, NotifyWatch, StateSource};
use depengine::types::BoxFuture;
use depengine::worker::ValueWorker;
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct SourceState {
    specs: BTreeMap<String, String>,
    subscribers: BTreeMap<String, Vec<mpsc::Sender<()>>>,
    watchers: Vec<Arc<ValueWorker<String>>>,
    fetch_error: Option<EngineError>,
}

/// In-memory [`StateSource`]. Changes are only announced through
/// [`FakeStateSource::set`], [`FakeStateSource::remove`] and
/// [`FakeStateSource::notify`].
#[derive(Clone)]
pub struct FakeStateSource {
    state: Arc<Mutex<SourceState>>,
    fetches: Arc<watch::Sender<usize>>,
}

impl Default for FakeStateSource {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            fetches: Arc::new(watch::channel(0).0),
        }
    }
}

impl FakeStateSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `text` for `key` and notify its watchers.
    pub fn set(&self, key: &str, text: &str) {
        self.lock().specs.insert(key.to_string(), text.to_string());
        self.notify(key);
    }

    pub fn remove(&self, key: &str) {
        self.lock().specs.remove(key);
        self.notify(key);
    }

    /// Make every fetch fail with `err` until cleared.
    pub fn fail_fetches(&self, err: Option<EngineError>) {
        self.lock().fetch_error = err;
    }

    pub fn notify(&self, key: &str) {
        let mut state = self.lock();
        if let Some(subscribers) = state.subscribers.get_mut(key) {
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                let _ = tx.try_send(());
            }
        }
    }

    /// Drop every subscription of `key`, closing the change channels.
    pub fn close_watches(&self, key: &str) {
        self.lock().subscribers.remove(key);
    }

    /// Every watcher worker handed out so far.
    pub fn watchers(&self) -> Vec<Arc<ValueWorker<String>>> {
        self.lock().watchers.clone()
    }

    pub fn fetches(&self) -> usize {
        *self.fetches.borrow()
    }

    pub async fn wait_for_fetches(&self, n: usize) {
        let mut rx = self.fetches.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateSource for FakeStateSource {
    fn watch(&self, key: &str) -> Result<NotifyWatch> {
        let (tx, changes) = mpsc::channel(1);
        let _ = tx.try_send(());
        let worker = ValueWorker::start(key.to_string())?;
        let mut state = self.lock();
        state.subscribers.entry(key.to_string()).or_default().push(tx);
        state.watchers.push(worker.clone());
        Ok(NotifyWatch { worker, changes })
    }

    fn fetch(&self, key: &str) -> BoxFuture<'_, Result<String>> {
        let result = {
            let state = self.lock();
            match (&state.fetch_error, state.specs.get(key)) {
                (Some(err), _) => Err(err.clone()),
                (None, Some(text)) => Ok(text.clone()),
                (None, None) => Err(EngineError::NotFound(key.to_string())),
            }
        };
        self.fetches.send_modify(|count| *count += 1);
        Box::pin(async move { result })
    }
}

/// One recorded `ensure` call.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsureCall<P> {
    pub group: String,
    pub entity: String,
    pub payload: P,
}

struct BrokerState<P> {
    calls: Vec<EnsureCall<P>>,
    error: Option<EngineError>,
}

/// [`Broker`] that records every call and optionally fails.
pub struct FakeBroker<P> {
    state: Arc<Mutex<BrokerState<P>>>,
    count: Arc<watch::Sender<usize>>,
}

impl<P> Clone for FakeBroker<P> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            count: self.count.clone(),
        }
    }
}

impl<P> Default for FakeBroker<P> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                calls: Vec::new(),
                error: None,
            })),
            count: Arc::new(watch::channel(0).0),
        }
    }
}

impl<P: Clone> FakeBroker<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `ensure` fail with `err` until cleared.
    pub fn fail_with(&self, err: Option<EngineError>) {
        self.lock().error = err;
    }

    pub fn calls(&self) -> Vec<EnsureCall<P>> {
        self.lock().calls.clone()
    }

    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState<P>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<P> Broker<P> for FakeBroker<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn ensure<'a>(
        &'a self,
        group: &'a str,
        entity: &'a str,
        payload: &'a P,
    ) -> BoxFuture<'a, Result<()>> {
        let result = {
            let mut state = self.lock();
            state.calls.push(EnsureCall {
                group: group.to_string(),
                entity: entity.to_string(),
                payload: payload.clone(),
            });
            match &state.error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        };
        self.count.send_modify(|count| *count += 1);
        Box::pin(async move { result })
    }
}
