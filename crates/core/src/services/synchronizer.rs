//! Event synchronizer - keeps the ledger mirror consistent with
//! chain-observed transfer events, including those missed while the
//! process was not running.
//!
//! # Design
//!
//! Two producers, one consumer contract:
//!
//! - **Live path**: a subscription task forwards transfer events into a
//!   bounded channel; the run loop applies each through the ledger's
//!   idempotent upsert. Per-event isolation comes from the channel: one
//!   malformed event is logged and dropped, the pipeline continues.
//! - **Backfill path**: on a fixed interval, compare chain height to
//!   the persisted cursor and replay the gap through the *same* upsert.
//!
//! The two paths deliberately overlap (the polling path is the
//! correctness backstop for missed live events) and may deliver the
//! same event twice, concurrently. Duplicate delivery is harmless by
//! construction: the upsert is keyed on transaction hash and applies
//! balance deltas only on the transition into `Completed`.
//!
//! A transfer initiated outside this system is recorded too; parties
//! without a local user keep their raw address as the audit handle and
//! simply receive no notification.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::error::{StorageResult, SyncError, SyncResult};
use crate::metrics::{
    record_backfill_sweep, record_duplicate_event, record_event_error, record_event_processed,
};
use crate::models::{Handle, SyncCursor, TransactionKind, UserRef};
use crate::ports::{
    ChainGateway, CompletedTransfer, IdentityDirectory, Ledger, Notification, NotificationKind,
    NotificationTrigger, TransferApplied, TransferEvent,
};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the event synchronizer.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Network identifier keying the persisted cursor, so multiple
    /// networks never share one.
    pub network_id: String,
    /// Interval between backfill sweeps.
    pub backfill_interval: Duration,
    /// Maximum block span per range query. The gap since the cursor is
    /// walked in chunks of this size, advancing the cursor after each
    /// fully-processed chunk, so one oversized query can neither
    /// overload the RPC node nor lose a whole sweep to a late failure.
    pub max_backfill_span: u64,
    /// Capacity of the live event channel between the subscription
    /// task and the processing worker.
    pub event_buffer: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            network_id: String::new(),
            backfill_interval: Duration::from_secs(60),
            max_backfill_span: 1_000,
            event_buffer: 256,
        }
    }
}

// =============================================================================
// EventSynchronizer
// =============================================================================

/// Drives ledger mirror updates from on-chain transfer events.
pub struct EventSynchronizer<G, L, I, N> {
    config: SynchronizerConfig,
    gateway: Arc<G>,
    ledger: Arc<L>,
    identity: Arc<I>,
    notifier: Arc<N>,
}

impl<G, L, I, N> EventSynchronizer<G, L, I, N>
where
    G: ChainGateway + 'static,
    L: Ledger,
    I: IdentityDirectory,
    N: NotificationTrigger,
{
    pub fn new(
        config: SynchronizerConfig,
        gateway: Arc<G>,
        ledger: Arc<L>,
        identity: Arc<I>,
        notifier: Arc<N>,
    ) -> Self {
        Self {
            config,
            gateway,
            ledger,
            identity,
            notifier,
        }
    }

    /// Run the synchronizer until shutdown is requested.
    ///
    /// Spawns the subscription task, then drives the single processing
    /// worker: live events as they arrive, a backfill sweep on every
    /// interval tick.
    #[instrument(skip_all, fields(network = %self.config.network_id))]
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> SyncResult<()> {
        info!("🔁 Starting event synchronizer");

        self.initialize_cursor().await?;

        let (event_tx, mut event_rx) = mpsc::channel::<TransferEvent>(self.config.event_buffer);
        let pump = tokio::spawn(subscription_pump(
            self.gateway.clone(),
            event_tx,
            shutdown_rx.clone(),
        ));

        let mut ticker = tokio::time::interval(self.config.backfill_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown requested");
                        break Err(SyncError::ShutdownRequested);
                    }
                }
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        // Pump gave up (only happens on shutdown).
                        break Err(SyncError::ShutdownRequested);
                    };
                    if let Err(err) = self.apply_event(&event, "live").await {
                        warn!(tx_hash = %event.tx_hash, error = ?err, "⚠️  Live event failed");
                        record_event_error("live");
                    }
                }
                _ = ticker.tick() => {
                    match self.backfill_sweep().await {
                        Ok(0) => {}
                        Ok(count) => info!(events = count, "🧹 Backfill recovered events"),
                        // Cursor untouched; retry on the next tick.
                        Err(err) => warn!(error = ?err, "⚠️  Backfill sweep failed"),
                    }
                }
            }
        };

        pump.abort();
        info!("🔁 Event synchronizer stopped");
        result
    }

    /// One backfill sweep: walk the block gap since the cursor in
    /// capped chunks, applying every event through the idempotent
    /// upsert, advancing the cursor after each fully-processed chunk.
    ///
    /// An RPC failure aborts the sweep *without* advancing the cursor,
    /// so the next interval retries the same range. A per-event
    /// processing failure is logged, counted and skipped: one bad event
    /// must not stall the batch.
    #[instrument(skip_all, fields(network = %self.config.network_id))]
    pub async fn backfill_sweep(&self) -> SyncResult<u64> {
        let height = self.gateway.current_block_height().await?;

        let Some(cursor) = self
            .ledger
            .cursor()
            .get_cursor(&self.config.network_id)
            .await?
        else {
            // No cursor yet (first sweep before run() seeded one):
            // adopt the current height and let backfill start next tick.
            self.set_cursor(height).await?;
            return Ok(0);
        };

        let mut last = cursor.last_processed_block;
        if height <= last {
            return Ok(0);
        }

        debug!(from = last + 1, to = height, "Backfill sweep");
        let mut processed = 0u64;

        while last < height {
            let chunk_end = height.min(last + self.config.max_backfill_span);
            let events = self
                .gateway
                .query_transfer_range(last + 1, chunk_end)
                .await?;

            for event in &events {
                match self.apply_event(event, "backfill").await {
                    Ok(()) => processed += 1,
                    Err(err) => {
                        warn!(
                            tx_hash = %event.tx_hash,
                            block = event.block_number,
                            error = ?err,
                            "⚠️  Backfill event failed, continuing batch"
                        );
                        record_event_error("backfill");
                    }
                }
            }

            self.set_cursor(chunk_end).await?;
            last = chunk_end;
        }

        record_backfill_sweep(processed);
        Ok(processed)
    }

    /// Apply one observed transfer event to the mirror.
    ///
    /// Idempotent: matched by transaction hash, so duplicate delivery
    /// (live + backfill, or synchronizer + coordinator) collapses into
    /// a no-op. Notifications fire only when this call actually
    /// transitioned the row, and only for parties with a local user.
    pub async fn apply_event(&self, event: &TransferEvent, source: &'static str) -> StorageResult<()> {
        let sender = self.identity.find_by_address(&event.from).await?;
        let recipient = self.identity.find_by_address(&event.to).await?;

        let record = CompletedTransfer {
            tx_hash: event.tx_hash,
            kind: TransactionKind::Send,
            from_handle: party_handle(&sender, event, true),
            to_handle: party_handle(&recipient, event, false),
            from_address: event.from,
            to_address: event.to,
            amount: event.amount,
            memo: None,
            block_number: event.block_number,
            gas_used: None,
            gas_price: None,
        };

        match self.ledger.apply_completed_transfer(&record).await? {
            TransferApplied::Applied(transaction) => {
                record_event_processed(source);
                debug!(
                    tx_hash = %event.tx_hash,
                    block = event.block_number,
                    source,
                    "⛓️  Transfer recorded"
                );

                if let Some(user) = sender {
                    self.notify(NotificationKind::PaymentSent, &transaction, user)
                        .await;
                }
                if let Some(user) = recipient {
                    self.notify(NotificationKind::PaymentReceived, &transaction, user)
                        .await;
                }
            }
            TransferApplied::Duplicate => {
                record_duplicate_event(source);
                debug!(tx_hash = %event.tx_hash, source, "Duplicate event absorbed");
            }
        }

        Ok(())
    }

    /// Seed the cursor with current chain height when none is
    /// persisted. The resulting under-sync gap is tolerated by the
    /// idempotent upserts, not closed retroactively.
    async fn initialize_cursor(&self) -> SyncResult<()> {
        if self
            .ledger
            .cursor()
            .get_cursor(&self.config.network_id)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let height = self.gateway.current_block_height().await?;
        self.set_cursor(height).await?;
        info!(
            height,
            "No cursor found; starting from current chain height"
        );
        Ok(())
    }

    async fn set_cursor(&self, block: u64) -> StorageResult<()> {
        self.ledger
            .cursor()
            .set_cursor(&SyncCursor {
                network_id: self.config.network_id.clone(),
                last_processed_block: block,
                updated_at: Utc::now(),
            })
            .await
    }

    async fn notify(
        &self,
        kind: NotificationKind,
        transaction: &crate::models::Transaction,
        user: UserRef,
    ) {
        self.notifier
            .notify(Notification {
                kind,
                transaction: transaction.clone(),
                user,
            })
            .await;
    }
}

/// Audit handle for one party of an observed transfer: the registered
/// handle when the address has a local user, the raw address otherwise.
fn party_handle(user: &Option<UserRef>, event: &TransferEvent, is_sender: bool) -> Handle {
    match user {
        Some(user) => user.handle.clone(),
        None => Handle::from_address(if is_sender { &event.from } else { &event.to }),
    }
}

// =============================================================================
// Subscription pump
// =============================================================================

/// Forward live transfer events into the processing channel,
/// resubscribing with exponential backoff when the stream drops.
async fn subscription_pump<G: ChainGateway>(
    gateway: Arc<G>,
    event_tx: mpsc::Sender<TransferEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
    const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
    let mut retry_delay = INITIAL_RETRY_DELAY;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        match gateway.subscribe_transfers().await {
            Ok(mut stream) => {
                debug!("📡 Transfer subscription established");
                retry_delay = INITIAL_RETRY_DELAY;

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                // Worker gone; nothing left to feed.
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(error = ?err, "⚠️  Subscription error, reconnecting...");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(
                    error = ?err,
                    retry_in_ms = retry_delay.as_millis(),
                    "⚠️  Failed to subscribe, retrying..."
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(retry_delay) => {
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}
