// src/reconcile/mod.rs

//! Watch-reconcile workers.
//!
//! A [`ReconcileWorker`] subscribes to change notifications for one entity,
//! fetches the authoritative state on every change, parses it into a
//! [`Payload`] and asks a [`Broker`] to make the external world match.
//! "Not defined yet" (`NotFound` on fetch) is a normal state; any other
//! failure ends the worker and is left to its supervisor.
//!
//! File-backed collaborators ([`FileStateSource`], [`FileBroker`]) and the
//! [`ContainerSpec`] payload are what the machine agent wires in.

pub mod broker;
pub mod source;
pub mod spec;
pub mod worker;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::errors::Result;
use crate::types::BoxFuture;
use crate::worker::Worker;

pub use broker::FileBroker;
pub use source::FileStateSource;
pub use spec::{ContainerSpec, PortSpec, Protocol, unit_tag, validate_unit_name};
pub use worker::{Phase, ReconcileParams, ReconcileWorker};

/// Change subscription for one key.
///
/// `changes` yields one `()` when the subscription starts and one per
/// change after that; it closes when the watcher fails for good. The
/// watcher must be stopped by whoever holds the subscription.
pub struct NotifyWatch {
    pub worker: Arc<dyn Worker>,
    pub changes: mpsc::Receiver<()>,
}

impl std::fmt::Debug for NotifyWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyWatch").finish_non_exhaustive()
    }
}

/// Authoritative desired state, keyed by entity.
pub trait StateSource: Send + Sync + 'static {
    fn watch(&self, key: &str) -> Result<NotifyWatch>;

    /// Current serialized state of `key`; `NotFound` when it is not
    /// defined yet.
    fn fetch(&self, key: &str) -> BoxFuture<'_, Result<String>>;
}

/// Applies desired state to an external system.
///
/// `ensure` must be idempotent: calling it twice with the same payload has
/// no additional observable effect.
pub trait Broker<P>: Send + Sync + 'static {
    fn ensure<'a>(
        &'a self,
        group: &'a str,
        entity: &'a str,
        payload: &'a P,
    ) -> BoxFuture<'a, Result<()>>;
}

/// A structured payload parsed from fetched state.
pub trait Payload: Sized + Send + Sync + 'static {
    /// Human readable name, used in error context.
    const KIND: &'static str;

    fn parse(text: &str) -> anyhow::Result<Self>;
}
