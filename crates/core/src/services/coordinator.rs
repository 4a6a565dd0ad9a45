//! Submission coordinator - executes transfers and owns the
//! request/fulfillment state machine.
//!
//! # Design
//!
//! The coordinator blocks each call until the receipt is observed
//! (bounded by a configured timeout). That trades request latency for a
//! simpler consistency story: sends initiated here never need a
//! background reconciliation pass of their own. The event synchronizer
//! independently observes the same transfer on-chain, and both paths
//! converge on the ledger's idempotent completed-transfer upsert, so
//! racing it is harmless.
//!
//! # Flow (send)
//!
//! 1. Validate amount and memo; advisory balance check
//! 2. Resolve the recipient handle through the identity directory
//! 3. Submit through the gateway (gas errors surfaced distinctly)
//! 4. Persist a `Submitted` row, then wait for the receipt
//! 5. Atomically complete the row and move both cached balances
//! 6. Fire one notification per party

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::amount::TokenAmount;
use crate::error::{ChainError, PaymentError, PaymentResult};
use crate::metrics::{record_requests_expired, record_transfer_submitted, ReceiptTimer};
use crate::models::{
    Address, Handle, Transaction, TransactionKind, TransactionStatus, TxHash, TxRef, UserRef,
};
use crate::ports::{
    BlockInfo, ChainGateway, CompletedTransfer, IdentityDirectory, Ledger, Notification,
    NotificationKind, NotificationTrigger, PendingTransfer, RequestCompletion, TransferApplied,
    TransferReceipt,
};
use crate::services::confirmations::{confirmations, Confirmation, DEFAULT_FINALITY_THRESHOLD};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the submission coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on the receipt wait. On expiry the transaction
    /// remains `Submitted`, not failed.
    pub receipt_timeout: Duration,
    /// Maximum memo length in bytes.
    pub max_memo_length: usize,
    /// Confirmation depth treated as final by verification.
    pub finality_threshold: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            receipt_timeout: Duration::from_secs(120),
            max_memo_length: 256,
            finality_threshold: DEFAULT_FINALITY_THRESHOLD,
        }
    }
}

// =============================================================================
// Read models
// =============================================================================

/// Balance answer combining both sources of truth.
#[derive(Debug, Clone)]
pub struct BalanceSnapshot {
    pub user: UserRef,
    /// Authoritative on-chain balance.
    pub on_chain: TokenAmount,
    /// Mirror's cached balance, `None` if the address was never touched
    /// off-chain.
    pub cached: Option<TokenAmount>,
}

/// Result of verifying a transaction against the chain and the mirror.
#[derive(Debug, Clone)]
pub struct TransactionVerification {
    pub receipt: TransferReceipt,
    pub confirmation: Confirmation,
    pub block: Option<BlockInfo>,
    /// The mirror row for the hash, if one exists.
    pub mirror: Option<Transaction>,
}

// =============================================================================
// SubmissionCoordinator
// =============================================================================

/// Executes transfers against the chain and keeps the ledger mirror
/// consistent with what it submitted.
///
/// All collaborators are injected; tests run the full state machine
/// against fakes.
pub struct SubmissionCoordinator<G, L, I, N> {
    config: CoordinatorConfig,
    gateway: Arc<G>,
    ledger: Arc<L>,
    identity: Arc<I>,
    notifier: Arc<N>,
}

impl<G, L, I, N> SubmissionCoordinator<G, L, I, N>
where
    G: ChainGateway,
    L: Ledger,
    I: IdentityDirectory,
    N: NotificationTrigger,
{
    pub fn new(
        config: CoordinatorConfig,
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

    // -------------------------------------------------------------------------
    // Sends
    // -------------------------------------------------------------------------

    /// Send tokens from one handle to another and wait for confirmation.
    #[instrument(skip_all, fields(from = %sender, to = %recipient, amount = %amount))]
    pub async fn send_payment(
        &self,
        sender: &Handle,
        recipient: &Handle,
        amount: TokenAmount,
        memo: Option<String>,
    ) -> PaymentResult<Transaction> {
        if amount.is_zero() {
            return Err(PaymentError::InvalidAmount);
        }
        self.check_memo(&memo)?;

        let from = self.resolve_sender(sender).await?;
        let to = self
            .identity
            .resolve_handle(recipient)
            .await?
            .ok_or_else(|| PaymentError::RecipientNotFound(recipient.to_string()))?;

        let pending = self.submit_checked(&from, &to.address, amount).await?;
        let tx_hash = pending.tx_hash;

        // Persist before waiting: a timed-out wait must leave a
        // Submitted row behind, never nothing.
        let now = Utc::now();
        let submitted = Transaction {
            reference: TxRef::Chain(tx_hash),
            tx_hash: Some(tx_hash),
            kind: TransactionKind::Send,
            status: TransactionStatus::Submitted,
            from_handle: from.handle.clone(),
            to_handle: to.handle.clone(),
            from_address: from.address,
            to_address: to.address,
            amount,
            memo: memo.clone(),
            block_number: None,
            gas_used: None,
            gas_price: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        self.ledger.insert_transaction(&submitted).await?;

        let receipt = self.await_completion(&tx_hash).await?;
        info!(
            tx_hash = %tx_hash,
            block = receipt.block_number,
            "💸 Transfer confirmed"
        );

        let record = CompletedTransfer {
            tx_hash,
            kind: TransactionKind::Send,
            from_handle: from.handle.clone(),
            to_handle: to.handle.clone(),
            from_address: from.address,
            to_address: to.address,
            amount,
            memo,
            block_number: receipt.block_number,
            gas_used: Some(receipt.gas_used),
            gas_price: Some(receipt.gas_price),
        };

        let transaction = match self.ledger.apply_completed_transfer(&record).await? {
            TransferApplied::Applied(tx) => tx,
            // The synchronizer observed the event first and completed
            // the row; read back its result.
            TransferApplied::Duplicate => self
                .ledger
                .transactions()
                .get_by_tx_hash(&tx_hash)
                .await?
                .ok_or_else(|| {
                    PaymentError::Internal(format!("completed row vanished for {tx_hash}"))
                })?,
        };

        self.notify(NotificationKind::PaymentSent, &transaction, &from)
            .await;
        self.notify(NotificationKind::PaymentReceived, &transaction, &to)
            .await;

        Ok(transaction)
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Create a payment request: a `Pending` row with no on-chain
    /// activity. `expires_in = None` means the request never expires.
    #[instrument(skip_all, fields(requester = %requester, payer = %payer, amount = %amount))]
    pub async fn request_payment(
        &self,
        requester: &Handle,
        payer: &Handle,
        amount: TokenAmount,
        memo: Option<String>,
        expires_in: Option<chrono::Duration>,
    ) -> PaymentResult<Transaction> {
        if amount.is_zero() {
            return Err(PaymentError::InvalidAmount);
        }
        self.check_memo(&memo)?;

        let payer_user = self
            .identity
            .resolve_handle(payer)
            .await?
            .ok_or_else(|| PaymentError::RecipientNotFound(payer.to_string()))?;
        let requester_user = self.resolve_sender(requester).await?;

        let now = Utc::now();
        let request = Transaction {
            reference: TxRef::new_request(),
            tx_hash: None,
            kind: TransactionKind::Request,
            status: TransactionStatus::Pending,
            // The payer is the "from" party: fulfilling moves tokens
            // payer -> requester.
            from_handle: payer_user.handle.clone(),
            to_handle: requester_user.handle.clone(),
            from_address: payer_user.address,
            to_address: requester_user.address,
            amount,
            memo,
            block_number: None,
            gas_used: None,
            gas_price: None,
            expires_at: expires_in.map(|ttl| now + ttl),
            created_at: now,
            updated_at: now,
        };
        self.ledger.insert_transaction(&request).await?;

        debug!(reference = %request.reference, "Payment request created");
        self.notify(NotificationKind::PaymentRequested, &request, &payer_user)
            .await;

        Ok(request)
    }

    /// Fulfill a pending request: execute the transfer on-chain, then
    /// complete the *same* row with the chain metadata.
    ///
    /// Expiry is re-validated here before any on-chain work; an expired
    /// request is transitioned and rejected even when this call races a
    /// background expiry sweep.
    #[instrument(skip_all, fields(reference = %reference, caller = %caller))]
    pub async fn fulfill_request(
        &self,
        reference: &TxRef,
        caller: &Handle,
    ) -> PaymentResult<Transaction> {
        let request = self.load_request(reference).await?;
        if request.from_handle != *caller {
            return Err(PaymentError::NotRequestTarget);
        }
        if request.status != TransactionStatus::Pending {
            return Err(conflict_error(request.status));
        }

        // Lazy expiry, compare-and-swap so a concurrent fulfillment or
        // sweep cannot double-transition.
        let now = Utc::now();
        if request.is_expired_at(now) {
            let swapped = self
                .ledger
                .transition_request(reference, TransactionStatus::Expired)
                .await?;
            if swapped {
                record_requests_expired(1);
                if let Some(requester) =
                    self.identity.resolve_handle(&request.to_handle).await?
                {
                    let expired = Transaction {
                        status: TransactionStatus::Expired,
                        ..request.clone()
                    };
                    self.notify(NotificationKind::RequestExpired, &expired, &requester)
                        .await;
                }
                return Err(PaymentError::RequestExpired);
            }
            // Someone else transitioned first; report what they did.
            return Err(self.request_conflict(reference).await?);
        }

        let payer = self.resolve_sender(caller).await?;
        let requester = self
            .identity
            .resolve_handle(&request.to_handle)
            .await?
            .ok_or_else(|| PaymentError::RecipientNotFound(request.to_handle.to_string()))?;

        let pending = self
            .submit_checked(&payer, &requester.address, request.amount)
            .await?;
        let receipt = self.await_completion(&pending.tx_hash).await?;
        info!(
            reference = %reference,
            tx_hash = %pending.tx_hash,
            block = receipt.block_number,
            "💸 Request fulfilled on-chain"
        );

        let outcome = CompletedTransfer {
            tx_hash: pending.tx_hash,
            kind: TransactionKind::Request,
            from_handle: payer.handle.clone(),
            to_handle: requester.handle.clone(),
            from_address: payer.address,
            to_address: requester.address,
            amount: request.amount,
            memo: request.memo.clone(),
            block_number: receipt.block_number,
            gas_used: Some(receipt.gas_used),
            gas_price: Some(receipt.gas_price),
        };

        match self.ledger.complete_request(reference, &outcome).await? {
            RequestCompletion::Completed(transaction) => {
                self.notify(NotificationKind::PaymentSent, &transaction, &payer)
                    .await;
                self.notify(NotificationKind::RequestFulfilled, &transaction, &requester)
                    .await;
                Ok(transaction)
            }
            RequestCompletion::Conflict(status) => {
                // The transfer is on-chain but the row was claimed by a
                // concurrent decline/expiry. The synchronizer records
                // the transfer as a standalone send, so no value is
                // lost; the request operation itself did not win.
                warn!(
                    reference = %reference,
                    status = status.as_str(),
                    tx_hash = %pending.tx_hash,
                    "Request completed on-chain but row was claimed concurrently"
                );
                Err(PaymentError::RequestNotPending {
                    status: status.as_str().to_string(),
                })
            }
        }
    }

    /// Decline a pending request. Pure off-chain compare-and-swap;
    /// exactly one of a racing fulfill/decline pair can win.
    #[instrument(skip_all, fields(reference = %reference, caller = %caller))]
    pub async fn decline_request(
        &self,
        reference: &TxRef,
        caller: &Handle,
    ) -> PaymentResult<Transaction> {
        let request = self.load_request(reference).await?;
        if request.from_handle != *caller {
            return Err(PaymentError::NotRequestTarget);
        }

        let swapped = self
            .ledger
            .transition_request(reference, TransactionStatus::Declined)
            .await?;
        if !swapped {
            return Err(self.request_conflict(reference).await?);
        }

        debug!(reference = %reference, "Request declined");
        let declined = Transaction {
            status: TransactionStatus::Declined,
            updated_at: Utc::now(),
            ..request
        };
        if let Some(requester) = self.identity.resolve_handle(&declined.to_handle).await? {
            self.notify(NotificationKind::RequestDeclined, &declined, &requester)
                .await;
        }

        Ok(declined)
    }

    /// Expire every pending request whose deadline has passed.
    ///
    /// Intended to run on an interval from the binary; fulfillment
    /// also expires lazily, so the sweep is a tidiness pass, not a
    /// correctness requirement.
    #[instrument(skip_all)]
    pub async fn expire_due_requests(&self) -> PaymentResult<Vec<TxRef>> {
        let expired = self.ledger.expire_due_requests(Utc::now()).await?;
        if expired.is_empty() {
            return Ok(expired);
        }

        record_requests_expired(expired.len() as u64);
        info!(count = expired.len(), "⏰ Requests expired");

        for reference in &expired {
            let Some(request) = self.ledger.transactions().get(reference).await? else {
                continue;
            };
            if let Some(requester) = self.identity.resolve_handle(&request.to_handle).await? {
                self.notify(NotificationKind::RequestExpired, &request, &requester)
                    .await;
            }
        }

        Ok(expired)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Balance for a handle: authoritative chain read plus the mirror's
    /// cached value.
    #[instrument(skip_all, fields(handle = %handle))]
    pub async fn balance_of(&self, handle: &Handle) -> PaymentResult<BalanceSnapshot> {
        let user = self
            .identity
            .resolve_handle(handle)
            .await?
            .ok_or_else(|| PaymentError::RecipientNotFound(handle.to_string()))?;

        let on_chain = self.gateway.token_balance(&user.address).await?;
        let cached = self
            .ledger
            .balances()
            .get(&user.address)
            .await?
            .map(|entry| entry.balance);

        Ok(BalanceSnapshot {
            user,
            on_chain,
            cached,
        })
    }

    /// Verify a transaction against the chain: receipt, confirmation
    /// depth/finality, block metadata, and the mirror row side by side.
    #[instrument(skip_all, fields(tx_hash = %tx_hash))]
    pub async fn verify_transaction(
        &self,
        tx_hash: &TxHash,
    ) -> PaymentResult<TransactionVerification> {
        const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

        let receipt = self.gateway.await_receipt(tx_hash, VERIFY_TIMEOUT).await?;
        let height = self.gateway.current_block_height().await?;
        let confirmation = confirmations(height, receipt.block_number, self.config.finality_threshold);
        let block = self.gateway.block_by_number(receipt.block_number).await?;
        let mirror = self.ledger.transactions().get_by_tx_hash(tx_hash).await?;

        Ok(TransactionVerification {
            receipt,
            confirmation,
            block,
            mirror,
        })
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Preconditions plus gateway submission, with the gas-vs-balance
    /// error split applied.
    async fn submit_checked(
        &self,
        from: &UserRef,
        to_address: &Address,
        amount: TokenAmount,
    ) -> PaymentResult<PendingTransfer> {
        if amount.is_zero() {
            return Err(PaymentError::InvalidAmount);
        }

        // Advisory only: the chain is the final arbiter and may still
        // reject after this passes.
        let balance = self.gateway.token_balance(&from.address).await?;
        if balance < amount {
            return Err(PaymentError::InsufficientBalance);
        }

        let secret = self
            .identity
            .signing_secret(&from.handle)
            .await?
            .ok_or_else(|| {
                PaymentError::Internal(format!("no signing credential for {}", from.handle))
            })?;

        let pending = self
            .gateway
            .submit_transfer(&secret, to_address, amount)
            .await
            .map_err(classify_submission_error)?;

        record_transfer_submitted();
        debug!(tx_hash = %pending.tx_hash, "Transfer submitted");
        Ok(pending)
    }

    /// Bounded receipt wait; reverted receipts surface as errors.
    async fn await_completion(&self, tx_hash: &TxHash) -> PaymentResult<TransferReceipt> {
        let _timer = ReceiptTimer::new();
        let receipt = self
            .gateway
            .await_receipt(tx_hash, self.config.receipt_timeout)
            .await
            .map_err(|err| match err {
                ChainError::Timeout { tx_hash } => PaymentError::ReceiptTimeout { tx_hash },
                other => classify_submission_error(other),
            })?;

        if !receipt.succeeded {
            return Err(PaymentError::Chain(ChainError::Reverted {
                reason: "transfer reverted on-chain".to_string(),
            }));
        }

        Ok(receipt)
    }

    async fn resolve_sender(&self, handle: &Handle) -> PaymentResult<UserRef> {
        self.identity
            .resolve_handle(handle)
            .await?
            .ok_or_else(|| PaymentError::Internal(format!("unknown sender handle {handle}")))
    }

    async fn load_request(&self, reference: &TxRef) -> PaymentResult<Transaction> {
        let transaction = self
            .ledger
            .transactions()
            .get(reference)
            .await?
            .ok_or_else(|| PaymentError::RequestNotFound(reference.to_string()))?;
        if transaction.kind != TransactionKind::Request {
            return Err(PaymentError::RequestNotFound(reference.to_string()));
        }
        Ok(transaction)
    }

    /// Re-read the row to report why a request CAS failed.
    async fn request_conflict(&self, reference: &TxRef) -> PaymentResult<PaymentError> {
        let status = self
            .ledger
            .transactions()
            .get(reference)
            .await?
            .map(|tx| tx.status)
            .ok_or_else(|| PaymentError::RequestNotFound(reference.to_string()))?;

        Ok(conflict_error(status))
    }

    fn check_memo(&self, memo: &Option<String>) -> PaymentResult<()> {
        if let Some(memo) = memo
            && memo.len() > self.config.max_memo_length
        {
            return Err(PaymentError::MemoTooLong {
                len: memo.len(),
                max: self.config.max_memo_length,
            });
        }
        Ok(())
    }

    async fn notify(&self, kind: NotificationKind, transaction: &Transaction, user: &UserRef) {
        self.notifier
            .notify(Notification {
                kind,
                transaction: transaction.clone(),
                user: user.clone(),
            })
            .await;
    }
}

// =============================================================================
// Error classification
// =============================================================================

/// Error for an operation that found the request already claimed.
/// Expiry keeps precedence: a fulfillment racing an expiry sweep always
/// observes `RequestExpired`, never a generic conflict.
fn conflict_error(status: TransactionStatus) -> PaymentError {
    match status {
        TransactionStatus::Expired => PaymentError::RequestExpired,
        other => PaymentError::RequestNotPending {
            status: other.as_str().to_string(),
        },
    }
}

/// Split chain submission failures into the two user-actionable money
/// errors, leaving everything else untranslated.
///
/// Gas funds and token balance look similar ("insufficient ...") but
/// need different remediation, so the node error text and the revert
/// reason are inspected explicitly.
fn classify_submission_error(err: ChainError) -> PaymentError {
    match err {
        ChainError::Rpc(ref message) if is_gas_funds_error(message) => {
            PaymentError::InsufficientGasFunds
        }
        ChainError::Reverted { ref reason } if is_token_balance_error(reason) => {
            PaymentError::InsufficientBalance
        }
        other => PaymentError::Chain(other),
    }
}

/// Node-level rejection: the sending account cannot pay for gas.
fn is_gas_funds_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("insufficient funds for gas")
        || message.contains("insufficient funds for transfer")
        || message.contains("insufficient funds")
}

/// Contract-level revert: the token balance does not cover the amount.
fn is_token_balance_error(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    reason.contains("transfer amount exceeds balance")
        || reason.contains("insufficient balance")
        || reason.contains("exceeds balance")
}
