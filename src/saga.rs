//! Cross-store operations without a shared transaction.
//!
//! A `Saga` runs steps in order. Each successful step registers a
//! compensating action; when a later step fails, every registered
//! compensation runs in reverse order before the error is returned.
//! Compensation failures are logged and do not stop the remaining undos.

use std::fmt::Display;
use std::future::Future;

use futures::future::BoxFuture;

pub type Compensation<'a, E> = BoxFuture<'a, Result<(), E>>;

pub struct Saga<'a, E> {
    name: &'static str,
    applied: Vec<(&'static str, Compensation<'a, E>)>,
}

impl<'a, E: Display> Saga<'a, E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            applied: Vec::new(),
        }
    }

    /// Run `action`. On success register the compensation built by `undo`
    /// from its output; on failure compensate everything applied so far.
    pub async fn step<T, Fut, U>(&mut self, label: &'static str, action: Fut, undo: U) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        U: FnOnce(&T) -> Compensation<'a, E>,
    {
        match action.await {
            Ok(value) => {
                let compensation = undo(&value);
                self.applied.push((label, compensation));
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(saga = self.name, step = label, error = %err, "saga step failed, compensating");
                self.compensate().await;
                Err(err)
            }
        }
    }

    /// Run the final step: commit on success, compensate on failure.
    pub async fn finish<T, Fut>(mut self, label: &'static str, action: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        match action.await {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(saga = self.name, step = label, error = %err, "saga step failed, compensating");
                self.compensate().await;
                Err(err)
            }
        }
    }

    /// Keep every applied step; compensations are dropped unrun.
    pub fn commit(self) {
        tracing::debug!(saga = self.name, steps = self.applied.len(), "saga committed");
    }

    async fn compensate(&mut self) {
        while let Some((label, undo)) = self.applied.pop() {
            match undo.await {
                Ok(()) => tracing::debug!(saga = self.name, step = label, "compensated"),
                Err(e) => tracing::error!(
                    saga = self.name,
                    step = label,
                    error = %e,
                    "compensation failed; stores may need manual reconciliation"
                ),
            }
        }
    }
}
