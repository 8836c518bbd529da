//! Change stream client: lifecycle state machine and supervisor loop.
//!
//! The supervisor owns the replication connection. On failure it releases
//! the connection, consults the retry policy, sleeps the backoff and
//! reconnects; once the attempt ceiling is hit the subsystem stays `Failed`
//! until process restart. Decoded changes flow to the router over an mpsc
//! channel, preserving arrival order with a single consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::protocol::{
    decode_message, PgOutputMessage, Relation, ReplicationClient, ReplicationFrame,
    ReplicationWriter, TupleData, TupleValue,
};
use crate::{CdcError, Result, RetryPolicy, Row, RowChange};

/// Connection settings for the change stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub slot: String,
    pub publication: String,
    /// Backoff policy for reconnects.
    pub retry: RetryPolicy,
    /// Interval between automatic standby status updates.
    pub ack_interval: Duration,
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(CdcError::config("host must not be empty"));
        }
        if self.user.is_empty() {
            return Err(CdcError::config("user must not be empty"));
        }
        if self.database.is_empty() {
            return Err(CdcError::config("database must not be empty"));
        }
        validate_identifier("slot", &self.slot)?;
        validate_identifier("publication", &self.publication)?;
        Ok(())
    }
}

/// Slot and publication names are interpolated into replication commands,
/// so they are restricted to plain identifiers.
fn validate_identifier(what: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if !valid_start || !value.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(CdcError::config(format!(
            "{what} must be a lowercase identifier, got {value:?}"
        )));
    }
    Ok(())
}

/// Lifecycle of the stream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Subscribed,
    Failed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Subscribed,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Idle,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

const STATE_IDLE: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_SUBSCRIBED: u8 = 2;
const STATE_FAILED: u8 = 3;

/// Shared, explicitly owned view of the stream client's state. Cloneable;
/// mutation happens only inside the supervisor and the start guard.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    state: AtomicU8,
    attempts: AtomicU32,
    stop: AtomicBool,
    stop_notify: Notify,
}

impl Default for StreamHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                state: AtomicU8::new(STATE_IDLE),
                attempts: AtomicU32::new(0),
                stop: AtomicBool::new(false),
                stop_notify: Notify::new(),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Consecutive failed attempts since the last successful subscription.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    /// Try to move Idle/Failed -> Connecting. Returns false while a
    /// connect attempt is in flight or a subscription is live, which makes
    /// concurrent `start()` calls no-ops.
    pub(crate) fn begin_connecting(&self) -> bool {
        for from in [STATE_IDLE, STATE_FAILED] {
            if self
                .inner
                .state
                .compare_exchange(from, STATE_CONNECTING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    pub(crate) fn mark_subscribed(&self) {
        self.inner.state.store(STATE_SUBSCRIBED, Ordering::Release);
        self.inner.attempts.store(0, Ordering::Release);
    }

    pub(crate) fn mark_failed(&self) {
        self.inner.state.store(STATE_FAILED, Ordering::Release);
    }

    pub(crate) fn mark_idle(&self) {
        self.inner.state.store(STATE_IDLE, Ordering::Release);
    }

    pub(crate) fn bump_attempts(&self) -> u32 {
        self.inner.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.stop_notify.notify_waiters();
    }

    /// Re-arm after a stop so the client can be started again.
    pub(crate) fn clear_stop(&self) {
        self.inner.stop.store(false, Ordering::Release);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }

    /// Resolves when `request_stop` has been called, even if it happened
    /// before this future was polled.
    async fn stopped(&self) {
        while !self.stop_requested() {
            self.inner.stop_notify.notified().await;
        }
    }
}

/// The change stream client. `start` spawns the supervisor; the outcome is
/// observable through the handle, not a return value.
pub struct ChangeStreamClient {
    config: StreamConfig,
    handle: StreamHandle,
    tx: mpsc::Sender<RowChange>,
}

impl ChangeStreamClient {
    pub fn new(config: StreamConfig, tx: mpsc::Sender<RowChange>) -> Self {
        Self {
            config,
            handle: StreamHandle::new(),
            tx,
        }
    }

    /// Shared view of the lifecycle state.
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Begin streaming. No-op while a connect attempt is in flight or a
    /// subscription is live; returns immediately either way.
    pub fn start(&self) {
        if !self.handle.begin_connecting() {
            debug!(state = %self.handle.state(), "start ignored, stream client not idle");
            return;
        }
        self.handle.clear_stop();
        let config = self.config.clone();
        let handle = self.handle.clone();
        let tx = self.tx.clone();
        tokio::spawn(run_supervisor(config, handle, tx));
    }

    /// Gracefully stop streaming. Idempotent; in-flight records already
    /// handed to the router are unaffected.
    pub fn stop(&self) {
        self.handle.request_stop();
    }
}

enum StreamEnd {
    /// `stop()` was requested or the router went away.
    Shutdown,
    /// The server ended the copy stream.
    Closed,
}

async fn run_supervisor(config: StreamConfig, handle: StreamHandle, tx: mpsc::Sender<RowChange>) {
    info!(
        slot = %config.slot,
        publication = %config.publication,
        "change stream supervisor starting"
    );

    loop {
        if handle.stop_requested() {
            handle.mark_idle();
            info!("change stream stopped");
            return;
        }

        let outcome = run_stream(&config, &handle, &tx).await;

        match outcome {
            Ok(StreamEnd::Shutdown) => {
                handle.mark_idle();
                info!("change stream stopped");
                return;
            }
            Ok(StreamEnd::Closed) => {
                warn!("replication stream closed by server");
            }
            Err(e) => match &e {
                CdcError::SlotInUse(msg) => {
                    warn!("replication slot held by another process, will retry: {msg}");
                }
                other if other.is_retriable() => {
                    error!("change stream error: {other}");
                }
                other => {
                    error!("change stream failed with non-retriable error: {other}");
                    handle.mark_failed();
                    return;
                }
            },
        }

        handle.mark_failed();

        let attempt = handle.attempts();
        if !config.retry.should_retry(attempt) {
            error!(
                attempts = attempt,
                "retry budget exhausted, change stream going dormant until restart"
            );
            return;
        }

        let delay = config.retry.delay_for(attempt);
        let attempt_no = handle.bump_attempts();
        info!(
            attempt = attempt_no,
            max = config.retry.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = handle.stopped() => {
                handle.mark_idle();
                info!("change stream stopped during backoff");
                return;
            }
        }

        if !handle.begin_connecting() {
            // Someone else moved the state; do not double-subscribe.
            debug!("reconnect abandoned, state changed during backoff");
            return;
        }
    }
}

async fn run_stream(
    config: &StreamConfig,
    handle: &StreamHandle,
    tx: &mpsc::Sender<RowChange>,
) -> Result<StreamEnd> {
    let client = ReplicationClient::connect(
        &config.host,
        config.port,
        &config.user,
        &config.database,
        config.password.as_deref(),
    )
    .await?;

    let stream = client
        .start_replication(&config.slot, &config.publication)
        .await?;

    handle.mark_subscribed();
    info!(slot = %config.slot, "change stream subscribed");

    let (mut reader, writer) = stream.into_split();

    // Frame reads are not cancellation-safe (a dropped read mid-frame
    // desyncs the protocol), so a dedicated task owns the read half and
    // the main loop selects on a channel instead.
    let (frame_tx, frame_rx) = mpsc::channel(64);
    let reader_task = tokio::spawn(async move {
        loop {
            let item = reader.next_frame().await;
            let terminal = !matches!(&item, Ok(Some(_)));
            if frame_tx.send(item).await.is_err() || terminal {
                return;
            }
        }
    });

    let outcome = drive_stream(config, handle, tx, frame_rx, writer).await;
    reader_task.abort();
    outcome
}

async fn drive_stream(
    config: &StreamConfig,
    handle: &StreamHandle,
    tx: &mpsc::Sender<RowChange>,
    mut frames: mpsc::Receiver<Result<Option<ReplicationFrame>>>,
    mut writer: ReplicationWriter,
) -> Result<StreamEnd> {
    let mut relations: HashMap<u32, Relation> = HashMap::new();
    // Changes accumulate per transaction and flush on Commit, so aborted
    // transactions never reach the router.
    let mut pending: Vec<RowChange> = Vec::new();
    let mut last_lsn: u64 = 0;

    let mut ack = tokio::time::interval(config.ack_interval);
    ack.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ack.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = handle.stopped() => return Ok(StreamEnd::Shutdown),
            _ = ack.tick() => {
                if last_lsn > 0 {
                    writer.send_status_update(last_lsn).await?;
                }
            }
            item = frames.recv() => {
                match item {
                    None | Some(Ok(None)) => return Ok(StreamEnd::Closed),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(Some(ReplicationFrame::Keepalive { wal_end, reply_requested }))) => {
                        last_lsn = last_lsn.max(wal_end);
                        if reply_requested {
                            writer.send_status_update(last_lsn).await?;
                        }
                    }
                    Some(Ok(Some(ReplicationFrame::XLogData { wal_end, payload }))) => {
                        last_lsn = last_lsn.max(wal_end);
                        let mut data = payload;
                        match decode_message(&mut data) {
                            Ok(message) => {
                                if apply_message(message, &mut relations, &mut pending, tx).await? {
                                    return Ok(StreamEnd::Shutdown);
                                }
                            }
                            // One undecodable record must not abort the stream.
                            Err(e) => warn!("skipping undecodable change record: {e}"),
                        }
                    }
                }
            }
        }
    }
}

/// Fold one pgoutput message into the pending transaction. Returns true
/// when the router has gone away and the stream should shut down.
async fn apply_message(
    message: PgOutputMessage,
    relations: &mut HashMap<u32, Relation>,
    pending: &mut Vec<RowChange>,
    tx: &mpsc::Sender<RowChange>,
) -> Result<bool> {
    match message {
        PgOutputMessage::Relation(rel) => {
            debug!(table = %rel.name, relation_id = rel.id, "relation announced");
            relations.insert(rel.id, rel);
        }
        PgOutputMessage::Begin { .. } => pending.clear(),
        PgOutputMessage::Commit { .. } => {
            for change in pending.drain(..) {
                if tx.send(change).await.is_err() {
                    info!("change receiver dropped, stopping stream");
                    return Ok(true);
                }
            }
        }
        PgOutputMessage::Insert { relation_id, new } => {
            if let Some(rel) = relations.get(&relation_id) {
                pending.push(RowChange::Insert {
                    table: rel.name.clone(),
                    row: tuple_to_row(&new, rel),
                });
            } else {
                warn!(relation_id, "insert for unannounced relation, skipping");
            }
        }
        PgOutputMessage::Update {
            relation_id,
            old,
            new,
        } => {
            if let Some(rel) = relations.get(&relation_id) {
                pending.push(RowChange::Update {
                    table: rel.name.clone(),
                    old: old.map(|t| tuple_to_row(&t, rel)),
                    row: tuple_to_row(&new, rel),
                });
            } else {
                warn!(relation_id, "update for unannounced relation, skipping");
            }
        }
        PgOutputMessage::Delete { relation_id, key } => {
            if let Some(rel) = relations.get(&relation_id) {
                pending.push(RowChange::Delete {
                    table: rel.name.clone(),
                    key: tuple_to_row(&key, rel),
                });
            } else {
                warn!(relation_id, "delete for unannounced relation, skipping");
            }
        }
        PgOutputMessage::Truncate { relation_ids } => {
            debug!(?relation_ids, "truncate observed, not fanned out");
        }
        PgOutputMessage::Origin | PgOutputMessage::Type => {}
    }
    Ok(false)
}

/// Project a tuple onto its relation's column names. Unchanged TOAST
/// values are omitted rather than guessed at; the router re-reads the
/// authoritative row anyway.
fn tuple_to_row(tuple: &TupleData, relation: &Relation) -> Row {
    let mut row = Row::new();
    for (value, column) in tuple.0.iter().zip(relation.columns.iter()) {
        match value {
            TupleValue::Null => {
                row.insert(column.name.clone(), Value::Null);
            }
            TupleValue::Unchanged => {}
            TupleValue::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes).into_owned();
                row.insert(column.name.clone(), Value::String(text));
            }
        }
    }
    row
}
