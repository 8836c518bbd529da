//! Per-table change handlers wiring the CDC router to the hub.

use std::sync::Arc;

use async_trait::async_trait;
use beacon_cdc::{CdcError, ChangeHandler, ChangeOp, RowChange};
use beacon_core::DomainEvent;
use beacon_realtime::Hub;
use tracing::debug;

use crate::store::UserStore;

/// Handler for the `users` table.
///
/// Inserts and updates trigger a fresh authoritative read before emitting:
/// the replication payload can be partial (key-only old images, unchanged
/// TOAST columns) or stale relative to a fast-following write, so the
/// emitted event always carries the row as the store sees it at read time.
/// Deletes have nothing left to read and emit the identifier alone.
pub struct UsersChangeHandler {
    store: Arc<dyn UserStore>,
    hub: Hub,
}

impl UsersChangeHandler {
    pub fn new(store: Arc<dyn UserStore>, hub: Hub) -> Self {
        Self { store, hub }
    }

    async fn reread(&self, id: i64) -> beacon_cdc::Result<Option<beacon_core::User>> {
        self.store
            .get(id)
            .await
            .map_err(|e| CdcError::handler(e.to_string()))
    }
}

#[async_trait]
impl ChangeHandler for UsersChangeHandler {
    async fn apply(&self, change: RowChange) -> beacon_cdc::Result<()> {
        // The router only dispatches records with a resolvable id.
        let Some(id) = change.id() else {
            return Ok(());
        };

        match change.op() {
            ChangeOp::Insert => match self.reread(id).await? {
                Some(user) => self.hub.emit(&DomainEvent::UserCreated { user }),
                // Row already deleted by the time we read: expected under
                // rapid insert-then-delete, not an error.
                None => debug!(user_id = id, "row gone before re-read, no event"),
            },
            ChangeOp::Update => match self.reread(id).await? {
                Some(user) => self.hub.emit(&DomainEvent::UserUpdated { user }),
                None => debug!(user_id = id, "row gone before re-read, no event"),
            },
            ChangeOp::Delete => self.hub.emit(&DomainEvent::UserDeleted { user_id: id }),
        }

        Ok(())
    }
}
