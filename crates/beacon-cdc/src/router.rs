//! Change router: filter, resolve, dispatch.
//!
//! Consumes decoded changes in arrival order and hands each to the handler
//! registered for its table. Handler failures are logged per record and
//! never propagate — one poisoned record must not take the subscription
//! down with it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{Result, RowChange, TrackedTables};

/// Per-table change processor. Implementations re-read authoritative row
/// state and emit application events; they own what "apply" means.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn apply(&self, change: RowChange) -> Result<()>;
}

/// Routes changes from the stream client to per-table handlers.
pub struct ChangeRouter {
    tracked: TrackedTables,
    handlers: HashMap<String, Arc<dyn ChangeHandler>>,
}

impl ChangeRouter {
    pub fn new(tracked: TrackedTables) -> Self {
        Self {
            tracked,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a table.
    pub fn with_handler(mut self, table: impl Into<String>, handler: Arc<dyn ChangeHandler>) -> Self {
        self.handlers.insert(table.into(), handler);
        self
    }

    /// Drain the channel until the sender side closes.
    pub async fn run(self, mut rx: mpsc::Receiver<RowChange>) {
        while let Some(change) = rx.recv().await {
            self.route(change).await;
        }
        debug!("change channel closed, router stopping");
    }

    /// Route a single change. Infallible by design: every failure mode is
    /// local to the record.
    pub async fn route(&self, change: RowChange) {
        if !self.tracked.contains(change.table()) {
            return;
        }

        if change.id().is_none() {
            warn!(
                table = change.table(),
                op = %change.op(),
                "change record has no resolvable id, skipping"
            );
            return;
        }

        let Some(handler) = self.handlers.get(change.table()) else {
            debug!(table = change.table(), "tracked table has no handler");
            return;
        };

        let (table, op) = (change.table().to_owned(), change.op());
        if let Err(e) = handler.apply(change).await {
            error!(table = %table, op = %op, "failed to apply change record: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CdcError;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<RowChange>>,
        fail: bool,
    }

    #[async_trait]
    impl ChangeHandler for Recording {
        async fn apply(&self, change: RowChange) -> Result<()> {
            self.seen.lock().push(change);
            if self.fail {
                return Err(CdcError::handler("boom"));
            }
            Ok(())
        }
    }

    fn insert(table: &str, id: &str) -> RowChange {
        let mut row = crate::Row::new();
        row.insert("id".into(), json!(id));
        RowChange::Insert {
            table: table.into(),
            row,
        }
    }

    fn router_with(handler: Arc<Recording>) -> ChangeRouter {
        ChangeRouter::new(TrackedTables::new(["users"])).with_handler("users", handler)
    }

    #[tokio::test]
    async fn test_untracked_table_discarded() {
        let handler = Arc::new(Recording::default());
        let router = router_with(handler.clone());

        router.route(insert("orders", "1")).await;

        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_id_discarded() {
        let handler = Arc::new(Recording::default());
        let router = router_with(handler.clone());

        let change = RowChange::Insert {
            table: "users".into(),
            row: crate::Row::new(),
        };
        router.route(change).await;

        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_routing() {
        let handler = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let router = router_with(handler.clone());

        router.route(insert("users", "1")).await;
        router.route(insert("users", "2")).await;

        assert_eq!(handler.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_run_preserves_arrival_order() {
        let handler = Arc::new(Recording::default());
        let router = router_with(handler.clone());

        let (tx, rx) = mpsc::channel(16);
        for id in ["1", "2", "3"] {
            tx.send(insert("users", id)).await.unwrap();
        }
        drop(tx);

        router.run(rx).await;

        let ids: Vec<Option<i64>> = handler.seen.lock().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_tracked_table_without_handler_is_noop() {
        let router = ChangeRouter::new(TrackedTables::new(["users"]));
        // Must not panic or error.
        router.route(insert("users", "1")).await;
    }
}
