//! Reconciliation scenarios for the coordinator and synchronizer,
//! driven against an in-memory ledger and a scripted gateway.
//!
//! These tests pin the invariants the two-writer design depends on:
//! duplicate delivery is absorbed, balance deltas apply exactly once,
//! request transitions are won by exactly one contender, and backfill
//! converges with the live path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use virement_core::amount::TokenAmount;
use virement_core::error::{ChainError, ChainResult, PaymentError, StorageError, StorageResult};
use virement_core::models::{
    Address, BalanceEntry, BlockHash, Handle, SyncCursor, Transaction, TransactionKind,
    TransactionStatus, TxHash, TxRef, UserRef,
};
use virement_core::ports::{
    BlockInfo, ChainGateway, CompletedTransfer, Connection, CursorRepository, Edge,
    IdentityDirectory, Ledger, Notification, NotificationKind, NotificationTrigger, OrderDirection,
    PageInfo, Pagination, PendingTransfer, RequestCompletion, SigningSecret, TransactionFilter,
    TransactionRepository, TransferApplied, TransferEvent, TransferEventStream, TransferReceipt,
    BalanceRepository,
};
use virement_core::services::{
    CoordinatorConfig, EventSynchronizer, SubmissionCoordinator, SynchronizerConfig,
};

// =============================================================================
// In-memory ledger
// =============================================================================

#[derive(Default)]
struct LedgerState {
    transactions: HashMap<String, Transaction>,
    balances: HashMap<Address, TokenAmount>,
    cursors: HashMap<String, SyncCursor>,
}

#[derive(Default)]
struct MemoryLedger {
    state: Mutex<LedgerState>,
    /// Reference whose upsert fails with an injected storage error.
    poison: Mutex<Option<TxHash>>,
}

impl MemoryLedger {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn poison(&self, hash: TxHash) {
        *self.poison.lock().unwrap() = Some(hash);
    }

    fn row(&self, reference: &TxRef) -> Option<Transaction> {
        self.state
            .lock()
            .unwrap()
            .transactions
            .get(&reference.to_string())
            .cloned()
    }

    fn row_count(&self) -> usize {
        self.state.lock().unwrap().transactions.len()
    }

    fn balance(&self, address: &Address) -> TokenAmount {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(address)
            .copied()
            .unwrap_or(TokenAmount::ZERO)
    }

    fn cursor_block(&self, network_id: &str) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .cursors
            .get(network_id)
            .map(|c| c.last_processed_block)
    }

    fn seed_cursor(&self, network_id: &str, block: u64) {
        self.state.lock().unwrap().cursors.insert(
            network_id.to_string(),
            SyncCursor {
                network_id: network_id.to_string(),
                last_processed_block: block,
                updated_at: Utc::now(),
            },
        );
    }

    fn find_submitted(&self) -> Option<Transaction> {
        self.state
            .lock()
            .unwrap()
            .transactions
            .values()
            .find(|tx| tx.status == TransactionStatus::Submitted)
            .cloned()
    }

    fn apply_deltas(state: &mut LedgerState, record: &CompletedTransfer) {
        let sender = state
            .balances
            .entry(record.from_address)
            .or_insert(TokenAmount::ZERO);
        *sender = sender.saturating_sub(record.amount);
        let recipient = state
            .balances
            .entry(record.to_address)
            .or_insert(TokenAmount::ZERO);
        *recipient = recipient.checked_add(record.amount).unwrap();
    }

    fn completed_row(record: &CompletedTransfer, created_at: DateTime<Utc>) -> Transaction {
        Transaction {
            reference: TxRef::Chain(record.tx_hash),
            tx_hash: Some(record.tx_hash),
            kind: record.kind,
            status: TransactionStatus::Completed,
            from_handle: record.from_handle.clone(),
            to_handle: record.to_handle.clone(),
            from_address: record.from_address,
            to_address: record.to_address,
            amount: record.amount,
            memo: record.memo.clone(),
            block_number: Some(record.block_number),
            gas_used: record.gas_used,
            gas_price: record.gas_price,
            expires_at: None,
            created_at,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
impl TransactionRepository for MemoryLedger {
    async fn get(&self, reference: &TxRef) -> StorageResult<Option<Transaction>> {
        Ok(self.row(reference))
    }

    async fn get_by_tx_hash(&self, tx_hash: &TxHash) -> StorageResult<Option<Transaction>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transactions
            .values()
            .find(|tx| tx.tx_hash == Some(*tx_hash))
            .cloned())
    }

    async fn list(
        &self,
        filter: TransactionFilter,
        pagination: Pagination,
        _order: OrderDirection,
    ) -> StorageResult<Connection<Transaction>> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| {
                filter
                    .handle
                    .as_ref()
                    .is_none_or(|h| tx.from_handle == *h || tx.to_handle == *h)
            })
            .filter(|tx| filter.kind.is_none_or(|k| tx.kind == k))
            .filter(|tx| filter.status.is_none_or(|s| tx.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(pagination.first.unwrap_or(20) as usize);

        let edges = rows
            .into_iter()
            .map(|tx| {
                let cursor = virement_core::ports::Cursor {
                    value: tx.reference.to_string(),
                };
                Edge { node: tx, cursor }
            })
            .collect::<Vec<_>>();
        Ok(Connection {
            page_info: PageInfo {
                has_next_page: false,
                has_previous_page: false,
                start_cursor: edges.first().map(|e| e.cursor.clone()),
                end_cursor: edges.last().map(|e| e.cursor.clone()),
            },
            edges,
            total_count: None,
        })
    }
}

#[async_trait]
impl BalanceRepository for MemoryLedger {
    async fn get(&self, address: &Address) -> StorageResult<Option<BalanceEntry>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(address)
            .map(|balance| BalanceEntry {
                address: *address,
                balance: *balance,
                updated_at: Utc::now(),
            }))
    }
}

#[async_trait]
impl CursorRepository for MemoryLedger {
    async fn get_cursor(&self, network_id: &str) -> StorageResult<Option<SyncCursor>> {
        Ok(self.state.lock().unwrap().cursors.get(network_id).cloned())
    }

    async fn set_cursor(&self, cursor: &SyncCursor) -> StorageResult<()> {
        self.state
            .lock()
            .unwrap()
            .cursors
            .insert(cursor.network_id.clone(), cursor.clone());
        Ok(())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn transactions(&self) -> &dyn TransactionRepository {
        self
    }

    fn balances(&self) -> &dyn BalanceRepository {
        self
    }

    fn cursor(&self) -> &dyn CursorRepository {
        self
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = transaction.reference.to_string();
        if state.transactions.contains_key(&key) {
            return Err(StorageError::ConstraintViolation(format!(
                "duplicate reference {key}"
            )));
        }
        state.transactions.insert(key, transaction.clone());
        Ok(())
    }

    async fn apply_completed_transfer(
        &self,
        record: &CompletedTransfer,
    ) -> StorageResult<TransferApplied> {
        if *self.poison.lock().unwrap() == Some(record.tx_hash) {
            return Err(StorageError::QueryError("injected failure".into()));
        }

        let mut state = self.state.lock().unwrap();
        let existing_key = state
            .transactions
            .iter()
            .find(|(_, tx)| tx.tx_hash == Some(record.tx_hash))
            .map(|(key, _)| key.clone());

        let key = match existing_key {
            Some(key) => {
                let existing = state.transactions.get_mut(&key).unwrap();
                if existing.status == TransactionStatus::Completed {
                    return Ok(TransferApplied::Duplicate);
                }
                existing.status = TransactionStatus::Completed;
                existing.block_number = Some(record.block_number);
                existing.gas_used = record.gas_used;
                existing.gas_price = record.gas_price;
                existing.updated_at = Utc::now();
                key
            }
            None => {
                let key = TxRef::Chain(record.tx_hash).to_string();
                let row = Self::completed_row(record, Utc::now());
                state.transactions.insert(key.clone(), row);
                key
            }
        };

        Self::apply_deltas(&mut state, record);
        Ok(TransferApplied::Applied(
            state.transactions.get(&key).unwrap().clone(),
        ))
    }

    async fn complete_request(
        &self,
        reference: &TxRef,
        outcome: &CompletedTransfer,
    ) -> StorageResult<RequestCompletion> {
        let mut state = self.state.lock().unwrap();

        // A synchronizer-created row for the same hash means the deltas
        // are already applied; absorb it into the request row.
        let placeholder_key = state
            .transactions
            .iter()
            .find(|(_, tx)| tx.tx_hash == Some(outcome.tx_hash))
            .map(|(key, _)| key.clone());
        let placeholder = placeholder_key.and_then(|key| state.transactions.remove(&key));
        let deltas_applied = placeholder
            .as_ref()
            .is_some_and(|p| p.status == TransactionStatus::Completed);

        let restore = |state: &mut LedgerState, placeholder: Option<Transaction>| {
            if let Some(p) = placeholder {
                state.transactions.insert(p.reference.to_string(), p);
            }
        };

        let status = state
            .transactions
            .get(&reference.to_string())
            .map(|tx| tx.status);
        match status {
            None => {
                restore(&mut state, placeholder);
                return Err(StorageError::NotFound(reference.to_string()));
            }
            Some(status) if status != TransactionStatus::Pending => {
                restore(&mut state, placeholder);
                return Ok(RequestCompletion::Conflict(status));
            }
            Some(_) => {}
        }

        let request = state.transactions.get_mut(&reference.to_string()).unwrap();
        request.tx_hash = Some(outcome.tx_hash);
        request.status = TransactionStatus::Completed;
        request.block_number = Some(outcome.block_number);
        request.gas_used = outcome.gas_used;
        request.gas_price = outcome.gas_price;
        request.updated_at = Utc::now();
        let completed = request.clone();

        if !deltas_applied {
            Self::apply_deltas(&mut state, outcome);
        }
        Ok(RequestCompletion::Completed(completed))
    }

    async fn transition_request(
        &self,
        reference: &TxRef,
        to: TransactionStatus,
    ) -> StorageResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(tx) = state.transactions.get_mut(&reference.to_string()) else {
            return Err(StorageError::NotFound(reference.to_string()));
        };
        if tx.kind != TransactionKind::Request || tx.status != TransactionStatus::Pending {
            return Ok(false);
        }
        tx.status = to;
        tx.updated_at = Utc::now();
        Ok(true)
    }

    async fn expire_due_requests(&self, now: DateTime<Utc>) -> StorageResult<Vec<TxRef>> {
        let mut state = self.state.lock().unwrap();
        let mut expired = Vec::new();
        for tx in state.transactions.values_mut() {
            if tx.kind == TransactionKind::Request
                && tx.status == TransactionStatus::Pending
                && tx.is_expired_at(now)
            {
                tx.status = TransactionStatus::Expired;
                tx.updated_at = now;
                expired.push(tx.reference.clone());
            }
        }
        Ok(expired)
    }
}

// =============================================================================
// Scripted gateway
// =============================================================================

#[derive(Default)]
struct FakeGateway {
    height: AtomicU64,
    balances: Mutex<HashMap<Address, TokenAmount>>,
    receipts: Mutex<HashMap<TxHash, TransferReceipt>>,
    range_events: Mutex<Vec<TransferEvent>>,
    submitted: Mutex<Vec<(Address, TokenAmount)>>,
    next_hash: AtomicU64,
    fail_range_queries: AtomicBool,
    timeout_receipts: AtomicBool,
    submit_error: Mutex<Option<ChainError>>,
}

impl FakeGateway {
    fn new(height: u64) -> Arc<Self> {
        let gateway = Self::default();
        gateway.height.store(height, Ordering::SeqCst);
        gateway.next_hash.store(1, Ordering::SeqCst);
        Arc::new(gateway)
    }

    fn fund(&self, address: Address, amount: TokenAmount) {
        self.balances.lock().unwrap().insert(address, amount);
    }

    fn add_range_event(&self, event: TransferEvent) {
        self.range_events.lock().unwrap().push(event);
    }

    fn submission_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    fn fail_submissions_with(&self, err: ChainError) {
        *self.submit_error.lock().unwrap() = Some(err);
    }
}

#[async_trait]
impl ChainGateway for FakeGateway {
    async fn submit_transfer(
        &self,
        _secret: &SigningSecret,
        to: &Address,
        amount: TokenAmount,
    ) -> ChainResult<PendingTransfer> {
        if let Some(err) = self.submit_error.lock().unwrap().take() {
            return Err(err);
        }

        let n = self.next_hash.fetch_add(1, Ordering::SeqCst);
        let tx_hash = hash(n as u8);
        self.submitted.lock().unwrap().push((*to, amount));
        self.receipts.lock().unwrap().insert(
            tx_hash,
            TransferReceipt {
                tx_hash,
                block_number: self.height.load(Ordering::SeqCst) + 1,
                gas_used: 21_000,
                gas_price: 1_000_000_000,
                succeeded: true,
            },
        );
        Ok(PendingTransfer { tx_hash })
    }

    async fn await_receipt(
        &self,
        tx_hash: &TxHash,
        _timeout: Duration,
    ) -> ChainResult<TransferReceipt> {
        if self.timeout_receipts.load(Ordering::SeqCst) {
            return Err(ChainError::Timeout {
                tx_hash: tx_hash.to_hex(),
            });
        }
        self.receipts
            .lock()
            .unwrap()
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| ChainError::Timeout {
                tx_hash: tx_hash.to_hex(),
            })
    }

    async fn current_block_height(&self) -> ChainResult<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn block_by_number(&self, number: u64) -> ChainResult<Option<BlockInfo>> {
        Ok(Some(BlockInfo {
            number,
            hash: BlockHash([0xbb; 32]),
            timestamp: Some(Utc::now()),
        }))
    }

    async fn subscribe_transfers(&self) -> ChainResult<TransferEventStream> {
        // Live delivery is simulated by calling apply_event directly.
        Ok(Box::pin(
            futures::stream::pending::<ChainResult<TransferEvent>>(),
        ))
    }

    async fn query_transfer_range(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<TransferEvent>> {
        if self.fail_range_queries.load(Ordering::SeqCst) {
            return Err(ChainError::Rpc("backfill query failed".into()));
        }
        Ok(self
            .range_events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn token_balance(&self, address: &Address) -> ChainResult<TokenAmount> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(TokenAmount::ZERO))
    }
}

// =============================================================================
// Identity and notifier fakes
// =============================================================================

#[derive(Default)]
struct FakeIdentity {
    users: Vec<UserRef>,
}

impl FakeIdentity {
    fn with_users(users: Vec<UserRef>) -> Arc<Self> {
        Arc::new(Self { users })
    }
}

#[async_trait]
impl IdentityDirectory for FakeIdentity {
    async fn resolve_handle(&self, handle: &Handle) -> StorageResult<Option<UserRef>> {
        Ok(self.users.iter().find(|u| u.handle == *handle).cloned())
    }

    async fn find_by_address(&self, address: &Address) -> StorageResult<Option<UserRef>> {
        Ok(self.users.iter().find(|u| u.address == *address).cloned())
    }

    async fn signing_secret(&self, handle: &Handle) -> StorageResult<Option<SigningSecret>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.handle == *handle)
            .map(|u| SigningSecret::new(u.handle.as_str())))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    delivered: Mutex<Vec<(NotificationKind, String)>>,
}

impl RecordingNotifier {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn delivered(&self) -> Vec<(NotificationKind, String)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationTrigger for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.delivered.lock().unwrap().push((
            notification.kind,
            notification.user.handle.to_string(),
        ));
    }
}

// =============================================================================
// Fixture helpers
// =============================================================================

const NETWORK: &str = "evm-test";

fn hash(n: u8) -> TxHash {
    TxHash([n; 32])
}

fn address(n: u8) -> Address {
    Address([n; 20])
}

fn user(handle: &str, addr: u8) -> UserRef {
    UserRef {
        handle: Handle::new(handle),
        address: address(addr),
    }
}

fn tokens(n: u64) -> TokenAmount {
    TokenAmount::from_tokens(n)
}

fn event(h: TxHash, block: u64, from: Address, to: Address, amount: TokenAmount) -> TransferEvent {
    TransferEvent {
        tx_hash: h,
        block_number: block,
        log_index: 0,
        from,
        to,
        amount,
    }
}

struct Fixture {
    gateway: Arc<FakeGateway>,
    ledger: Arc<MemoryLedger>,
    identity: Arc<FakeIdentity>,
    notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    fn new(height: u64) -> Self {
        let alice = user("alice@anz", 0xaa);
        let bob = user("bob@bnz", 0xbc);
        let gateway = FakeGateway::new(height);
        gateway.fund(alice.address, tokens(1_000));
        gateway.fund(bob.address, tokens(1_000));
        Self {
            gateway,
            ledger: MemoryLedger::new(),
            identity: FakeIdentity::with_users(vec![alice, bob]),
            notifier: RecordingNotifier::new(),
        }
    }

    fn coordinator(
        &self,
    ) -> SubmissionCoordinator<FakeGateway, MemoryLedger, FakeIdentity, RecordingNotifier> {
        SubmissionCoordinator::new(
            CoordinatorConfig::default(),
            self.gateway.clone(),
            self.ledger.clone(),
            self.identity.clone(),
            self.notifier.clone(),
        )
    }

    fn synchronizer(
        &self,
    ) -> EventSynchronizer<FakeGateway, MemoryLedger, FakeIdentity, RecordingNotifier> {
        EventSynchronizer::new(
            SynchronizerConfig {
                network_id: NETWORK.to_string(),
                ..Default::default()
            },
            self.gateway.clone(),
            self.ledger.clone(),
            self.identity.clone(),
            self.notifier.clone(),
        )
    }

    fn alice(&self) -> Handle {
        Handle::new("alice@anz")
    }

    fn bob(&self) -> Handle {
        Handle::new("bob@bnz")
    }
}

// =============================================================================
// Idempotent upsert
// =============================================================================

#[tokio::test]
async fn applying_same_event_twice_is_idempotent() {
    let fx = Fixture::new(100);
    let sync = fx.synchronizer();
    let e = event(hash(1), 90, address(0xaa), address(0xbc), tokens(25));

    sync.apply_event(&e, "live").await.unwrap();
    let after_first = (
        fx.ledger.balance(&address(0xaa)),
        fx.ledger.balance(&address(0xbc)),
    );

    // Same event again, as backfill overlap would deliver it
    sync.apply_event(&e, "backfill").await.unwrap();

    assert_eq!(fx.ledger.balance(&address(0xaa)), after_first.0);
    assert_eq!(fx.ledger.balance(&address(0xbc)), after_first.1);
    assert_eq!(fx.ledger.balance(&address(0xbc)), tokens(25));
    assert_eq!(fx.ledger.row_count(), 1);

    let row = fx.ledger.row(&TxRef::Chain(hash(1))).unwrap();
    assert_eq!(row.status, TransactionStatus::Completed);
    assert_eq!(row.block_number, Some(90));
}

#[tokio::test]
async fn coordinator_and_synchronizer_converge_without_double_apply() {
    let fx = Fixture::new(100);
    let coordinator = fx.coordinator();
    let sync = fx.synchronizer();

    let tx = coordinator
        .send_payment(&fx.alice(), &fx.bob(), tokens(40), Some("lunch".into()))
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    let tx_hash = *tx.reference.as_chain_hash().unwrap();

    let cached_bob = fx.ledger.balance(&address(0xbc));
    assert_eq!(cached_bob, tokens(40));

    // The synchronizer independently observes the same transfer
    let e = event(tx_hash, tx.block_number.unwrap(), address(0xaa), address(0xbc), tokens(40));
    sync.apply_event(&e, "live").await.unwrap();

    assert_eq!(fx.ledger.balance(&address(0xbc)), cached_bob);
    assert_eq!(fx.ledger.row_count(), 1);
}

#[tokio::test]
async fn external_transfer_with_unknown_parties_is_recorded_without_notification() {
    let fx = Fixture::new(100);
    let sync = fx.synchronizer();

    // Neither address has a local user
    let e = event(hash(7), 95, address(0x01), address(0x02), tokens(5));
    sync.apply_event(&e, "live").await.unwrap();

    let row = fx.ledger.row(&TxRef::Chain(hash(7))).unwrap();
    assert_eq!(row.status, TransactionStatus::Completed);
    assert_eq!(row.from_handle, Handle::from_address(&address(0x01)));
    assert!(fx.notifier.delivered().is_empty());
}

// =============================================================================
// Sends
// =============================================================================

#[tokio::test]
async fn send_payment_fails_fast_on_insufficient_balance() {
    let fx = Fixture::new(100);
    fx.gateway.fund(address(0xaa), tokens(5));
    let coordinator = fx.coordinator();

    let err = coordinator
        .send_payment(&fx.alice(), &fx.bob(), tokens(10), None)
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::InsufficientBalance));
    assert_eq!(fx.gateway.submission_count(), 0);
    assert_eq!(fx.ledger.row_count(), 0);
}

#[tokio::test]
async fn gas_funds_error_is_surfaced_distinctly() {
    let fx = Fixture::new(100);
    fx.gateway.fail_submissions_with(ChainError::Rpc(
        "insufficient funds for gas * price + value".into(),
    ));
    let coordinator = fx.coordinator();

    let err = coordinator
        .send_payment(&fx.alice(), &fx.bob(), tokens(10), None)
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::InsufficientGasFunds));
}

#[tokio::test]
async fn unknown_recipient_is_rejected() {
    let fx = Fixture::new(100);
    let coordinator = fx.coordinator();

    let err = coordinator
        .send_payment(&fx.alice(), &Handle::new("ghost@anz"), tokens(1), None)
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::RecipientNotFound(_)));
    assert_eq!(fx.gateway.submission_count(), 0);
}

#[tokio::test]
async fn receipt_timeout_leaves_submitted_row_for_synchronizer() {
    let fx = Fixture::new(100);
    fx.gateway.timeout_receipts.store(true, Ordering::SeqCst);
    let coordinator = fx.coordinator();
    let sync = fx.synchronizer();

    let err = coordinator
        .send_payment(&fx.alice(), &fx.bob(), tokens(15), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::ReceiptTimeout { .. }));

    // Not failed: the row waits in Submitted for the event to land
    let submitted = fx.ledger.find_submitted().expect("submitted row persisted");
    assert_eq!(submitted.status, TransactionStatus::Submitted);
    assert_eq!(fx.ledger.balance(&address(0xbc)), TokenAmount::ZERO);

    // The transfer eventually confirms; the synchronizer observes it
    let tx_hash = *submitted.reference.as_chain_hash().unwrap();
    let e = event(tx_hash, 101, address(0xaa), address(0xbc), tokens(15));
    sync.apply_event(&e, "live").await.unwrap();

    let row = fx.ledger.row(&submitted.reference).unwrap();
    assert_eq!(row.status, TransactionStatus::Completed);
    assert_eq!(row.block_number, Some(101));
    assert_eq!(fx.ledger.balance(&address(0xbc)), tokens(15));
}

// =============================================================================
// Requests: CAS, expiry, fulfillment
// =============================================================================

#[tokio::test]
async fn fulfillment_updates_the_same_row_not_a_new_one() {
    let fx = Fixture::new(100);
    let coordinator = fx.coordinator();

    // Bob asks Alice for 30
    let request = coordinator
        .request_payment(&fx.bob(), &fx.alice(), tokens(30), None, None)
        .await
        .unwrap();
    assert_eq!(request.status, TransactionStatus::Pending);
    assert!(!request.reference.is_chain_hash());
    assert!(request.tx_hash.is_none());
    assert!(request.block_number.is_none());

    let fulfilled = coordinator
        .fulfill_request(&request.reference, &fx.alice())
        .await
        .unwrap();

    assert_eq!(fulfilled.status, TransactionStatus::Completed);
    assert_eq!(fulfilled.kind, TransactionKind::Request);
    assert!(fulfilled.tx_hash.is_some());
    assert!(fulfilled.block_number.is_some());

    // Same row: still addressable by its original reference, now
    // carrying the chain hash; no second row appeared
    assert_eq!(fulfilled.reference, request.reference);
    let row = fx.ledger.row(&request.reference).unwrap();
    assert_eq!(row.status, TransactionStatus::Completed);
    assert_eq!(fx.ledger.row_count(), 1);
    assert_eq!(fx.ledger.balance(&address(0xbc)), tokens(30));
}

#[tokio::test]
async fn concurrent_fulfill_and_decline_exactly_one_wins() {
    let fx = Fixture::new(100);
    let coordinator = fx.coordinator();

    let request = coordinator
        .request_payment(&fx.bob(), &fx.alice(), tokens(10), None, None)
        .await
        .unwrap();

    let alice = fx.alice();
    let (fulfilled, declined) = tokio::join!(
        coordinator.fulfill_request(&request.reference, &alice),
        coordinator.decline_request(&request.reference, &alice),
    );

    let winners = [fulfilled.is_ok(), declined.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(winners, 1, "exactly one contender must win the CAS");

    // The loser observed a defined conflict error, and the final status
    // matches the winner
    if let Ok(tx) = &fulfilled {
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert!(matches!(
            declined.unwrap_err(),
            PaymentError::RequestNotPending { .. }
        ));
    } else {
        let declined = declined.unwrap();
        assert_eq!(declined.status, TransactionStatus::Declined);
        assert!(matches!(
            fulfilled.unwrap_err(),
            PaymentError::RequestNotPending { .. }
        ));
    }
}

#[tokio::test]
async fn decline_is_a_pure_offchain_transition() {
    let fx = Fixture::new(100);
    let coordinator = fx.coordinator();

    let request = coordinator
        .request_payment(&fx.bob(), &fx.alice(), tokens(10), None, None)
        .await
        .unwrap();
    let declined = coordinator
        .decline_request(&request.reference, &fx.alice())
        .await
        .unwrap();

    assert_eq!(declined.status, TransactionStatus::Declined);
    assert_eq!(fx.gateway.submission_count(), 0);

    // Terminal: a later fulfillment attempt observes the decline
    let err = coordinator
        .fulfill_request(&request.reference, &fx.alice())
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::RequestNotPending { .. }));
}

#[tokio::test]
async fn only_the_requested_payer_may_act() {
    let fx = Fixture::new(100);
    let coordinator = fx.coordinator();

    let request = coordinator
        .request_payment(&fx.bob(), &fx.alice(), tokens(10), None, None)
        .await
        .unwrap();

    // Bob is the requester, not the payer
    let err = coordinator
        .decline_request(&request.reference, &fx.bob())
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::NotRequestTarget));
}

#[tokio::test]
async fn expired_request_always_fails_fulfillment() {
    let fx = Fixture::new(100);
    let coordinator = fx.coordinator();

    let request = coordinator
        .request_payment(
            &fx.bob(),
            &fx.alice(),
            tokens(10),
            None,
            Some(chrono::Duration::hours(-1)),
        )
        .await
        .unwrap();

    let err = coordinator
        .fulfill_request(&request.reference, &fx.alice())
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::RequestExpired));

    // The row transitioned and no chain work happened
    let row = fx.ledger.row(&request.reference).unwrap();
    assert_eq!(row.status, TransactionStatus::Expired);
    assert_eq!(fx.gateway.submission_count(), 0);
}

#[tokio::test]
async fn expiry_precedence_holds_against_a_racing_sweep() {
    let fx = Fixture::new(100);
    let coordinator = fx.coordinator();

    let request = coordinator
        .request_payment(
            &fx.bob(),
            &fx.alice(),
            tokens(10),
            None,
            Some(chrono::Duration::milliseconds(-1)),
        )
        .await
        .unwrap();

    let alice = fx.alice();
    let (sweep, fulfill) = tokio::join!(
        coordinator.expire_due_requests(),
        coordinator.fulfill_request(&request.reference, &alice),
    );

    // Whichever side transitioned the row, fulfillment fails with the
    // expiry error and the request ends Expired
    sweep.unwrap();
    assert!(matches!(fulfill.unwrap_err(), PaymentError::RequestExpired));
    assert_eq!(
        fx.ledger.row(&request.reference).unwrap().status,
        TransactionStatus::Expired
    );
}

#[tokio::test]
async fn expiry_sweep_notifies_the_requester() {
    let fx = Fixture::new(100);
    let coordinator = fx.coordinator();

    coordinator
        .request_payment(
            &fx.bob(),
            &fx.alice(),
            tokens(10),
            None,
            Some(chrono::Duration::hours(-1)),
        )
        .await
        .unwrap();

    let expired = coordinator.expire_due_requests().await.unwrap();
    assert_eq!(expired.len(), 1);
    assert!(fx
        .notifier
        .delivered()
        .contains(&(NotificationKind::RequestExpired, "bob@bnz".to_string())));
}

#[tokio::test]
async fn synchronizer_winning_the_fulfillment_race_is_absorbed() {
    let fx = Fixture::new(100);
    let coordinator = fx.coordinator();
    let sync = fx.synchronizer();

    let request = coordinator
        .request_payment(&fx.bob(), &fx.alice(), tokens(30), None, None)
        .await
        .unwrap();

    // The fulfillment transfer confirms on-chain and the synchronizer
    // sees the event before the coordinator's own ledger write
    let tx_hash = hash(0x77);
    let e = event(tx_hash, 101, address(0xaa), address(0xbc), tokens(30));
    sync.apply_event(&e, "live").await.unwrap();
    assert_eq!(fx.ledger.balance(&address(0xbc)), tokens(30));

    // The coordinator now completes the request with the same hash: the
    // standalone row is absorbed and the deltas are NOT applied twice
    let outcome = CompletedTransfer {
        tx_hash,
        kind: TransactionKind::Request,
        from_handle: fx.alice(),
        to_handle: fx.bob(),
        from_address: address(0xaa),
        to_address: address(0xbc),
        amount: tokens(30),
        memo: None,
        block_number: 101,
        gas_used: Some(21_000),
        gas_price: Some(1_000_000_000),
    };
    let completion = fx
        .ledger
        .complete_request(&request.reference, &outcome)
        .await
        .unwrap();

    assert!(matches!(completion, RequestCompletion::Completed(_)));
    assert_eq!(fx.ledger.balance(&address(0xbc)), tokens(30));
    assert_eq!(fx.ledger.row_count(), 1);

    // The surviving row is the request itself, now carrying the hash
    let row = fx.ledger.row(&request.reference).unwrap();
    assert_eq!(row.kind, TransactionKind::Request);
    assert_eq!(row.status, TransactionStatus::Completed);
    assert_eq!(row.tx_hash, Some(tx_hash));
}

// =============================================================================
// Backfill
// =============================================================================

#[tokio::test]
async fn backfill_catches_up_missed_events_and_live_replay_is_noop() {
    let fx = Fixture::new(110);
    fx.ledger.seed_cursor(NETWORK, 100);
    let sync = fx.synchronizer();

    // Three transfers happened while the process was down
    let events = [
        event(hash(1), 101, address(0xaa), address(0xbc), tokens(10)),
        event(hash(2), 102, address(0xbc), address(0xaa), tokens(4)),
        event(hash(3), 105, address(0xaa), address(0xbc), tokens(1)),
    ];
    for e in &events {
        fx.gateway.add_range_event(e.clone());
    }

    let processed = sync.backfill_sweep().await.unwrap();
    assert_eq!(processed, 3);
    assert_eq!(fx.ledger.cursor_block(NETWORK), Some(110));

    for e in &events {
        let row = fx.ledger.row(&TxRef::Chain(e.tx_hash)).unwrap();
        assert_eq!(row.status, TransactionStatus::Completed);
        assert_eq!(row.block_number, Some(e.block_number));
    }

    let balances = (
        fx.ledger.balance(&address(0xaa)),
        fx.ledger.balance(&address(0xbc)),
    );

    // A concurrent live replay of the same three events changes nothing
    for e in &events {
        sync.apply_event(e, "live").await.unwrap();
    }
    assert_eq!(fx.ledger.balance(&address(0xaa)), balances.0);
    assert_eq!(fx.ledger.balance(&address(0xbc)), balances.1);
    assert_eq!(fx.ledger.row_count(), 3);
}

#[tokio::test]
async fn rpc_error_during_backfill_does_not_advance_cursor() {
    let fx = Fixture::new(110);
    fx.ledger.seed_cursor(NETWORK, 100);
    fx.gateway.fail_range_queries.store(true, Ordering::SeqCst);
    let sync = fx.synchronizer();

    assert!(sync.backfill_sweep().await.is_err());
    assert_eq!(fx.ledger.cursor_block(NETWORK), Some(100));

    // Next interval, the RPC recovered: the same range is retried
    fx.gateway.fail_range_queries.store(false, Ordering::SeqCst);
    fx.gateway
        .add_range_event(event(hash(9), 105, address(0xaa), address(0xbc), tokens(2)));
    let processed = sync.backfill_sweep().await.unwrap();
    assert_eq!(processed, 1);
    assert_eq!(fx.ledger.cursor_block(NETWORK), Some(110));
}

#[tokio::test]
async fn one_poisoned_event_does_not_stall_the_batch() {
    let fx = Fixture::new(110);
    fx.ledger.seed_cursor(NETWORK, 100);
    let sync = fx.synchronizer();

    fx.gateway
        .add_range_event(event(hash(1), 101, address(0xaa), address(0xbc), tokens(1)));
    fx.gateway
        .add_range_event(event(hash(2), 102, address(0xaa), address(0xbc), tokens(2)));
    fx.gateway
        .add_range_event(event(hash(3), 103, address(0xaa), address(0xbc), tokens(3)));
    fx.ledger.poison(hash(2));

    let processed = sync.backfill_sweep().await.unwrap();
    assert_eq!(processed, 2);
    assert_eq!(fx.ledger.cursor_block(NETWORK), Some(110));

    assert!(fx.ledger.row(&TxRef::Chain(hash(1))).is_some());
    assert!(fx.ledger.row(&TxRef::Chain(hash(2))).is_none());
    assert!(fx.ledger.row(&TxRef::Chain(hash(3))).is_some());
}

#[tokio::test]
async fn backfill_walks_large_gaps_in_capped_chunks() {
    let fx = Fixture::new(2_500);
    fx.ledger.seed_cursor(NETWORK, 0);
    let sync = EventSynchronizer::new(
        SynchronizerConfig {
            network_id: NETWORK.to_string(),
            max_backfill_span: 1_000,
            ..Default::default()
        },
        fx.gateway.clone(),
        fx.ledger.clone(),
        fx.identity.clone(),
        fx.notifier.clone(),
    );

    fx.gateway
        .add_range_event(event(hash(1), 50, address(0xaa), address(0xbc), tokens(1)));
    fx.gateway
        .add_range_event(event(hash(2), 1_500, address(0xaa), address(0xbc), tokens(1)));
    fx.gateway
        .add_range_event(event(hash(3), 2_400, address(0xaa), address(0xbc), tokens(1)));

    let processed = sync.backfill_sweep().await.unwrap();
    assert_eq!(processed, 3);
    assert_eq!(fx.ledger.cursor_block(NETWORK), Some(2_500));
}
