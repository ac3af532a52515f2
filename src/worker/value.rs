// src/worker/value.rs

use std::sync::Arc;

use crate::errors::Result;
use crate::types::BoxFuture;
use crate::worker::{Catacomb, Worker};

/// A worker that does nothing but hold a value until it is killed.
#[derive(Debug)]
pub struct ValueWorker<T> {
    value: T,
    catacomb: Catacomb,
}

impl<T> ValueWorker<T>
where
    T: Send + Sync + 'static,
{
    pub fn start(value: T) -> Result<Arc<Self>> {
        let catacomb = Catacomb::new();
        let dying = catacomb.dying();
        let err_dying = catacomb.err_dying();
        catacomb.invoke(async move {
            dying.await;
            Err(err_dying)
        })?;
        Ok(Arc::new(Self { value, catacomb }))
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn is_dying(&self) -> bool {
        self.catacomb.is_dying()
    }
}

impl<T> Worker for ValueWorker<T>
where
    T: Send + Sync + 'static,
{
    fn kill(&self) {
        self.catacomb.kill(None);
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.catacomb.wait())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::stop;

    #[tokio::test]
    async fn holds_value_until_stopped() {
        let worker = ValueWorker::start("agent.conf".to_string()).unwrap();
        assert_eq!(worker.value(), "agent.conf");
        stop(&*worker).await.unwrap();
    }
}
