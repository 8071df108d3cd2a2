#![forbid(unsafe_code)]

use anyhow::Result;
use autoledger_core::{
    AccountingPeriod, Correction, CorrectionId, CounterpartyHistory, CounterpartyId, EntryId,
    Event, EventId, EventStatus, LedgerEntry, MatchCategory, NewCorrection, NewEvent,
    NewLedgerEntry, NewPattern, NewReviewItem, NewTask, Pattern, PatternId, Reconciliation,
    ReviewItem, ReviewItemId, ReviewStatus, Task, TaskId, TaskStatus, TenantId,
};
use time::Date;

/// Read-only inputs for the confidence scorer.
pub trait HistoryRepository {
    /// Posting count over the twelve months up to `as_of` and the account
    /// sets of the most recent posted entries for the counterparty.
    #[allow(clippy::missing_errors_doc)]
    fn counterparty_history(
        &self,
        tenant: &TenantId,
        counterparty: &CounterpartyId,
        as_of: Date,
    ) -> Result<CounterpartyHistory>;

    /// Active patterns whose scope includes `tenant`.
    #[allow(clippy::missing_errors_doc)]
    fn active_patterns(&self, tenant: &TenantId) -> Result<Vec<Pattern>>;
}

/// Transactional store for all persisted pipeline state. Implementations
/// serialize writers; every method is atomic on its own.
pub trait LedgerStore: HistoryRepository {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &NewEvent) -> Result<Event>;

    #[allow(clippy::missing_errors_doc)]
    fn get_event(&self, event_id: EventId) -> Result<Option<Event>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events(&self, status: Option<EventStatus>) -> Result<Vec<Event>>;

    /// Returns events stuck in `processing` to `unprocessed`.
    #[allow(clippy::missing_errors_doc)]
    fn reset_stale_events(&self) -> Result<usize>;

    /// Moves up to `limit` unprocessed events to `processing`, oldest first.
    #[allow(clippy::missing_errors_doc)]
    fn claim_event_batch(&self, limit: usize) -> Result<Vec<Event>>;

    #[allow(clippy::missing_errors_doc)]
    fn mark_event_processed(&self, event_id: EventId, last_error: Option<&str>) -> Result<()>;

    /// Records a failed attempt. The event goes back to `unprocessed` until
    /// `max_attempts` is reached, then to `dead_lettered`.
    #[allow(clippy::missing_errors_doc)]
    fn release_failed_event(
        &self,
        event_id: EventId,
        error: &str,
        max_attempts: u32,
    ) -> Result<EventStatus>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_task(&self, task: &NewTask) -> Result<Task>;

    #[allow(clippy::missing_errors_doc)]
    fn finish_task(&self, task_id: TaskId, status: TaskStatus, note: Option<&str>) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_tasks(&self, tenant: Option<&TenantId>) -> Result<Vec<Task>>;

    /// Next per-tenant voucher number, committed on its own so a later
    /// failure never hands the same number out twice.
    #[allow(clippy::missing_errors_doc)]
    fn allocate_sequence(&self, tenant: &TenantId) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_draft_entry(&self, entry: &NewLedgerEntry, sequence_number: i64)
        -> Result<LedgerEntry>;

    #[allow(clippy::missing_errors_doc)]
    fn post_entry(&self, entry_id: EntryId) -> Result<LedgerEntry>;

    #[allow(clippy::missing_errors_doc)]
    fn get_entry(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_reversal(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_entries(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>>;

    /// Posted entries that are neither reconciled, reversed, nor reversals.
    #[allow(clippy::missing_errors_doc)]
    fn list_open_entries(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn lock_period(&self, tenant: &TenantId, period: AccountingPeriod) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn is_period_locked(&self, tenant: &TenantId, period: AccountingPeriod) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_review_item(&self, item: &NewReviewItem) -> Result<ReviewItem>;

    #[allow(clippy::missing_errors_doc)]
    fn get_review_item(&self, item_id: ReviewItemId) -> Result<Option<ReviewItem>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_review_items(
        &self,
        tenant: &TenantId,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<ReviewItem>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_pending_review_by_source(
        &self,
        tenant: &TenantId,
        source_reference: &str,
    ) -> Result<Option<ReviewItem>>;

    #[allow(clippy::missing_errors_doc)]
    fn pending_reviews_for_counterparty(
        &self,
        tenant: &TenantId,
        counterparty: &CounterpartyId,
    ) -> Result<Vec<ReviewItem>>;

    /// Resolves the item only if it is still pending. Returns whether this
    /// call won the claim.
    #[allow(clippy::missing_errors_doc)]
    fn claim_review_item(&self, item_id: ReviewItemId, resolution: &str) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn reopen_review_item(&self, item_id: ReviewItemId) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_correction(&self, correction: &NewCorrection) -> Result<Correction>;

    #[allow(clippy::missing_errors_doc)]
    fn get_correction(&self, correction_id: CorrectionId) -> Result<Option<Correction>>;

    /// Stamps `learned_at` once. Returns `false` if it was already set.
    #[allow(clippy::missing_errors_doc)]
    fn mark_correction_learned(&self, correction_id: CorrectionId) -> Result<bool>;

    /// Records the entry posted for the correction's booking. Returns
    /// `false` if an entry was already recorded.
    #[allow(clippy::missing_errors_doc)]
    fn link_correction_entry(
        &self,
        correction_id: CorrectionId,
        entry_id: EntryId,
    ) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_pattern(&self, pattern: &NewPattern) -> Result<Pattern>;

    #[allow(clippy::missing_errors_doc)]
    fn get_pattern(&self, pattern_id: PatternId) -> Result<Option<Pattern>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_patterns(&self) -> Result<Vec<Pattern>>;

    /// Increments `times_applied` (and `times_correct` when `correct`) and
    /// recomputes the success rate in one transaction.
    #[allow(clippy::missing_errors_doc)]
    fn record_pattern_outcome(&self, pattern_id: PatternId, correct: bool) -> Result<Pattern>;

    #[allow(clippy::missing_errors_doc)]
    fn deactivate_pattern(&self, pattern_id: PatternId) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn reconcile(
        &self,
        tenant: &TenantId,
        bank_transaction_id: &str,
        entry_id: EntryId,
        category: MatchCategory,
        confidence: u8,
    ) -> Result<Reconciliation>;

    #[allow(clippy::missing_errors_doc)]
    fn list_reconciliations(&self, tenant: &TenantId) -> Result<Vec<Reconciliation>>;
}
