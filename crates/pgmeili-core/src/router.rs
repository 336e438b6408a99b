use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lsn::format_lsn;
use crate::target::qualify_table;
use crate::types::WalChange;

/// Applies changes for one table.
pub trait ChangeHandler: Send + Sync {
    type Error: fmt::Display + Send;

    fn apply(
        &self,
        change: &WalChange,
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send;
}

/// Receives decoded changes from the replication loop.
///
/// Implementations must not fail the stream: per-change failures are
/// logged and dropped.
pub trait ChangeSink: Send + Sync {
    fn deliver(&self, change: WalChange) -> impl Future<Output = ()> + Send;
}

impl<S: ChangeSink> ChangeSink for Arc<S> {
    fn deliver(&self, change: WalChange) -> impl Future<Output = ()> + Send {
        (**self).deliver(change)
    }
}

/// What happened to a routed change.
#[derive(Debug)]
pub enum RouteOutcome<E> {
    Applied,
    /// No handler is registered for the change's table.
    Unrouted,
    Failed(E),
}

/// Static table to handler dispatch.
///
/// Keys are schema-qualified table names matched exactly. Built once at
/// startup and read-only afterwards.
pub struct WalRouter<H> {
    routes: HashMap<String, H>,
}

impl<H> Default for WalRouter<H> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<H> WalRouter<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a table. Bare names are qualified with `public`.
    pub fn register(&mut self, table: &str, handler: H) -> Result<()> {
        let table = qualify_table(table);
        if self.routes.contains_key(&table) {
            return Err(Error::DuplicateRoute(table));
        }
        self.routes.insert(table, handler);
        Ok(())
    }

    pub fn handler_for(&self, qualified_table: &str) -> Option<&H> {
        self.routes.get(qualified_table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<H: ChangeHandler> WalRouter<H> {
    /// Hand a change to its table's handler and wait for it to finish.
    pub async fn dispatch(&self, change: &WalChange) -> RouteOutcome<H::Error> {
        let table = change.qualified_table();
        let Some(handler) = self.routes.get(&table) else {
            debug!(
                table = %table,
                kind = %change.kind,
                lsn = %format_lsn(change.lsn),
                "No handler for table, dropping change"
            );
            return RouteOutcome::Unrouted;
        };

        match handler.apply(change).await {
            Ok(()) => RouteOutcome::Applied,
            Err(e) => RouteOutcome::Failed(e),
        }
    }
}

impl<H: ChangeHandler> ChangeSink for WalRouter<H> {
    async fn deliver(&self, change: WalChange) {
        if let RouteOutcome::Failed(e) = self.dispatch(&change).await {
            warn!(
                table = %change.qualified_table(),
                kind = %change.kind,
                lsn = %format_lsn(change.lsn),
                error = %e,
                "Failed to sync change"
            );
        }
    }
}
