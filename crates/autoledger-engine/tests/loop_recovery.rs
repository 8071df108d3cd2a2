use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use autoledger_core::{
    AccountingPeriod, Correction, CorrectionId, CounterpartyHistory, CounterpartyId, EntryId,
    Event, EventId, EventKind, EventStatus, LedgerEntry, MatchCategory, NewCorrection, NewEvent,
    NewLedgerEntry, NewPattern, NewReviewItem, NewTask, Pattern, PatternId, Reconciliation,
    ReviewItem, ReviewItemId, ReviewStatus, Task, TaskId, TaskStatus, TenantId,
};
use autoledger_engine::{EngineConfig, Orchestrator};
use autoledger_store_core::{HistoryRepository, LedgerStore};
use autoledger_store_sqlite::SqliteLedgerStore;
use serde_json::json;
use time::Date;
use ulid::Ulid;

fn temp_db_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "autoledger-engine-loop-{}-{}.sqlite",
        name,
        Ulid::new()
    ))
}

fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

/// SQLite store with slow task inserts and a one-shot failure when marking
/// events processed. Tracks how many task inserts overlap.
struct InstrumentedStore {
    inner: SqliteLedgerStore,
    task_delay: Duration,
    fail_next_mark: AtomicBool,
    task_inserts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InstrumentedStore {
    fn open(name: &str, task_delay: Duration) -> Arc<Self> {
        let inner = must_ok(SqliteLedgerStore::open(&temp_db_path(name)));
        must_ok(inner.migrate());
        Arc::new(Self {
            inner,
            task_delay,
            fail_next_mark: AtomicBool::new(false),
            task_inserts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

impl HistoryRepository for InstrumentedStore {
    fn counterparty_history(
        &self,
        tenant: &TenantId,
        counterparty: &CounterpartyId,
        as_of: Date,
    ) -> Result<CounterpartyHistory> {
        self.inner.counterparty_history(tenant, counterparty, as_of)
    }

    fn active_patterns(&self, tenant: &TenantId) -> Result<Vec<Pattern>> {
        self.inner.active_patterns(tenant)
    }
}

impl LedgerStore for InstrumentedStore {
    fn migrate(&self) -> Result<()> {
        self.inner.migrate()
    }

    fn append_event(&self, event: &NewEvent) -> Result<Event> {
        self.inner.append_event(event)
    }

    fn get_event(&self, event_id: EventId) -> Result<Option<Event>> {
        self.inner.get_event(event_id)
    }

    fn list_events(&self, status: Option<EventStatus>) -> Result<Vec<Event>> {
        self.inner.list_events(status)
    }

    fn reset_stale_events(&self) -> Result<usize> {
        self.inner.reset_stale_events()
    }

    fn claim_event_batch(&self, limit: usize) -> Result<Vec<Event>> {
        self.inner.claim_event_batch(limit)
    }

    fn mark_event_processed(&self, event_id: EventId, last_error: Option<&str>) -> Result<()> {
        if self.fail_next_mark.swap(false, Ordering::SeqCst) {
            bail!("database is locked");
        }
        self.inner.mark_event_processed(event_id, last_error)
    }

    fn release_failed_event(
        &self,
        event_id: EventId,
        error: &str,
        max_attempts: u32,
    ) -> Result<EventStatus> {
        self.inner.release_failed_event(event_id, error, max_attempts)
    }

    fn insert_task(&self, task: &NewTask) -> Result<Task> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.task_inserts.fetch_add(1, Ordering::SeqCst);
        let inserted = self.inner.insert_task(task);
        std::thread::sleep(self.task_delay);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        inserted
    }

    fn finish_task(&self, task_id: TaskId, status: TaskStatus, note: Option<&str>) -> Result<()> {
        self.inner.finish_task(task_id, status, note)
    }

    fn list_tasks(&self, tenant: Option<&TenantId>) -> Result<Vec<Task>> {
        self.inner.list_tasks(tenant)
    }

    fn allocate_sequence(&self, tenant: &TenantId) -> Result<i64> {
        self.inner.allocate_sequence(tenant)
    }

    fn insert_draft_entry(
        &self,
        entry: &NewLedgerEntry,
        sequence_number: i64,
    ) -> Result<LedgerEntry> {
        self.inner.insert_draft_entry(entry, sequence_number)
    }

    fn post_entry(&self, entry_id: EntryId) -> Result<LedgerEntry> {
        self.inner.post_entry(entry_id)
    }

    fn get_entry(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>> {
        self.inner.get_entry(entry_id)
    }

    fn find_reversal(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>> {
        self.inner.find_reversal(entry_id)
    }

    fn list_entries(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>> {
        self.inner.list_entries(tenant)
    }

    fn list_open_entries(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>> {
        self.inner.list_open_entries(tenant)
    }

    fn lock_period(&self, tenant: &TenantId, period: AccountingPeriod) -> Result<()> {
        self.inner.lock_period(tenant, period)
    }

    fn is_period_locked(&self, tenant: &TenantId, period: AccountingPeriod) -> Result<bool> {
        self.inner.is_period_locked(tenant, period)
    }

    fn insert_review_item(&self, item: &NewReviewItem) -> Result<ReviewItem> {
        self.inner.insert_review_item(item)
    }

    fn get_review_item(&self, item_id: ReviewItemId) -> Result<Option<ReviewItem>> {
        self.inner.get_review_item(item_id)
    }

    fn list_review_items(
        &self,
        tenant: &TenantId,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<ReviewItem>> {
        self.inner.list_review_items(tenant, status)
    }

    fn find_pending_review_by_source(
        &self,
        tenant: &TenantId,
        source_reference: &str,
    ) -> Result<Option<ReviewItem>> {
        self.inner
            .find_pending_review_by_source(tenant, source_reference)
    }

    fn pending_reviews_for_counterparty(
        &self,
        tenant: &TenantId,
        counterparty: &CounterpartyId,
    ) -> Result<Vec<ReviewItem>> {
        self.inner
            .pending_reviews_for_counterparty(tenant, counterparty)
    }

    fn claim_review_item(&self, item_id: ReviewItemId, resolution: &str) -> Result<bool> {
        self.inner.claim_review_item(item_id, resolution)
    }

    fn reopen_review_item(&self, item_id: ReviewItemId) -> Result<()> {
        self.inner.reopen_review_item(item_id)
    }

    fn insert_correction(&self, correction: &NewCorrection) -> Result<Correction> {
        self.inner.insert_correction(correction)
    }

    fn get_correction(&self, correction_id: CorrectionId) -> Result<Option<Correction>> {
        self.inner.get_correction(correction_id)
    }

    fn mark_correction_learned(&self, correction_id: CorrectionId) -> Result<bool> {
        self.inner.mark_correction_learned(correction_id)
    }

    fn link_correction_entry(
        &self,
        correction_id: CorrectionId,
        entry_id: EntryId,
    ) -> Result<bool> {
        self.inner.link_correction_entry(correction_id, entry_id)
    }

    fn insert_pattern(&self, pattern: &NewPattern) -> Result<Pattern> {
        self.inner.insert_pattern(pattern)
    }

    fn get_pattern(&self, pattern_id: PatternId) -> Result<Option<Pattern>> {
        self.inner.get_pattern(pattern_id)
    }

    fn list_patterns(&self) -> Result<Vec<Pattern>> {
        self.inner.list_patterns()
    }

    fn record_pattern_outcome(&self, pattern_id: PatternId, correct: bool) -> Result<Pattern> {
        self.inner.record_pattern_outcome(pattern_id, correct)
    }

    fn deactivate_pattern(&self, pattern_id: PatternId) -> Result<()> {
        self.inner.deactivate_pattern(pattern_id)
    }

    fn reconcile(
        &self,
        tenant: &TenantId,
        bank_transaction_id: &str,
        entry_id: EntryId,
        category: MatchCategory,
        confidence: u8,
    ) -> Result<Reconciliation> {
        self.inner
            .reconcile(tenant, bank_transaction_id, entry_id, category, confidence)
    }

    fn list_reconciliations(&self, tenant: &TenantId) -> Result<Vec<Reconciliation>> {
        self.inner.list_reconciliations(tenant)
    }
}

fn invoice_received(store: &InstrumentedStore, file: &str) -> Event {
    must_ok(store.append_event(&NewEvent {
        tenant: TenantId::new("acme"),
        kind: EventKind::InvoiceReceived,
        payload: json!({ "file": file }),
    }))
}

fn stored_event(store: &InstrumentedStore, event_id: EventId) -> Event {
    match must_ok(store.get_event(event_id)) {
        Some(event) => event,
        None => panic!("event {event_id} should exist"),
    }
}

#[tokio::test]
async fn handler_past_its_deadline_fails_without_overlapping_the_next() {
    let store = InstrumentedStore::open("deadline", Duration::from_millis(300));
    let slow = invoice_received(&store, "scan-001.pdf");
    let next = invoice_received(&store, "scan-002.pdf");

    let config = EngineConfig {
        handler_deadline_ms: Some(50),
        ..EngineConfig::default()
    };
    let engine = must_ok(Orchestrator::new(Arc::clone(&store), config));
    let summary = must_ok(engine.drain().await);

    assert_eq!(summary.events, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(store.task_inserts.load(Ordering::SeqCst), 2);
    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);

    for event_id in [slow.id, next.id] {
        let event = stored_event(&store, event_id);
        assert_eq!(event.status, EventStatus::Processed);
        assert!(event
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("deadline")));
    }
    assert_eq!(must_ok(store.list_tasks(None)).len(), 2);
}

#[tokio::test]
async fn handler_within_its_deadline_succeeds() {
    let store = InstrumentedStore::open("deadline-ok", Duration::ZERO);
    let event = invoice_received(&store, "scan-003.pdf");

    let config = EngineConfig {
        handler_deadline_ms: Some(5_000),
        ..EngineConfig::default()
    };
    let engine = must_ok(Orchestrator::new(Arc::clone(&store), config));
    let summary = must_ok(engine.drain().await);

    assert_eq!(summary.failed, 0);
    let event = stored_event(&store, event.id);
    assert_eq!(event.status, EventStatus::Processed);
    assert!(event.last_error.is_none());
}

#[tokio::test]
async fn aborted_batch_releases_its_claimed_events() {
    let store = InstrumentedStore::open("batch-abort", Duration::ZERO);
    let first = invoice_received(&store, "scan-004.pdf");
    let second = invoice_received(&store, "scan-005.pdf");
    store.fail_next_mark.store(true, Ordering::SeqCst);

    let engine = must_ok(Orchestrator::new(
        Arc::clone(&store),
        EngineConfig::default(),
    ));
    assert!(engine.process_batch().await.is_err());
    assert!(must_ok(store.list_events(Some(EventStatus::Processing))).is_empty());
    for event_id in [first.id, second.id] {
        assert_eq!(
            stored_event(&store, event_id).status,
            EventStatus::Unprocessed
        );
    }

    let retry = must_ok(engine.process_batch().await);
    assert_eq!(retry.claimed, 2);
    assert_eq!(retry.succeeded, 2);
    assert_eq!(
        must_ok(store.list_events(Some(EventStatus::Processed))).len(),
        2
    );
}
