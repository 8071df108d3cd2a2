use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use autoledger_core::booking::{
    fallback_booking, parse_suggestion_value, FALLBACK_CONFIDENCE, UNBALANCED_CONFIDENCE_CAP,
};
use autoledger_core::matching::auto_match;
use autoledger_core::scoring::score_booking;
use autoledger_core::{
    AgentKind, BankTransaction, CandidateBooking, ConfidenceScore, Correction, CorrectionId,
    CounterpartyHistory, DocumentFacts, EntryId, Event, EventKind, EventStatus, LedgerEntry,
    LedgerError, NewCorrection, NewLedgerEntry, NewReviewItem, NewTask, NotFoundError,
    ReviewFlag, ReviewItemId, ReviewPriority, ReviewSubject, Route, TaskStatus, TenantId,
};
use autoledger_store_core::LedgerStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, FailurePolicy};
use crate::learner::{Learner, LearningOutcome};
use crate::validator::{BookingValidator, PostingError};

pub const DEFAULT_TASK_PRIORITY: u8 = 5;
pub const LEARNING_TASK_PRIORITY: u8 = 3;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BookingCompletedPayload {
    document: DocumentFacts,
    #[serde(default)]
    suggestion: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CorrectionPayload {
    #[serde(default)]
    correction: Option<NewCorrection>,
    #[serde(default)]
    correction_id: Option<CorrectionId>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BankTransactionPayload {
    transaction: BankTransaction,
}

/// Counts for one claimed batch.
#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct BatchSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct RunSummary {
    pub stale_reset: usize,
    pub batches: usize,
    pub events: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl RunSummary {
    fn absorb(&mut self, batch: BatchSummary) {
        self.batches += 1;
        self.events += batch.claimed;
        self.failed += batch.failed;
        self.dead_lettered += batch.dead_lettered;
    }
}

/// What happened to a scored booking.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BookingDecision {
    Posted {
        entry: LedgerEntry,
        score: ConfidenceScore,
    },
    Queued {
        review_item_id: ReviewItemId,
        priority: ReviewPriority,
        score: ConfidenceScore,
    },
}

/// Synchronous per-event handlers. Every handler runs against a single
/// store and finishes before the next event is dispatched.
pub struct Dispatcher<'a, S: LedgerStore + ?Sized> {
    store: &'a S,
    config: &'a EngineConfig,
}

impl<'a, S: LedgerStore + ?Sized> Dispatcher<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, config: &'a EngineConfig) -> Self {
        Self { store, config }
    }

    /// Handles one event. A missing referenced record is logged and
    /// swallowed so the rest of the batch proceeds.
    ///
    /// # Errors
    /// Returns an error for malformed payloads and store failures.
    pub fn dispatch(&self, event: &Event) -> Result<()> {
        debug!(event_id = %event.id, kind = event.kind.as_str(), "dispatching event");
        let result = match event.kind {
            EventKind::InvoiceReceived => {
                self.enqueue_task(event, AgentKind::InvoiceParser, "parse_invoice")
            }
            EventKind::InvoiceParsed => {
                self.enqueue_task(event, AgentKind::Bookkeeper, "generate_booking")
            }
            EventKind::BookingCompleted => self.handle_booking_completed(event).map(|_| ()),
            EventKind::CorrectionReceived => self.handle_correction(event),
            EventKind::PeriodClosing => {
                info!(
                    event_id = %event.id,
                    tenant = %event.tenant,
                    "period closing received; nothing to do"
                );
                Ok(())
            }
            EventKind::BankTransactionImported => self.handle_bank_transaction(event),
        };

        match result {
            Err(err) if is_not_found(&err) => {
                warn!(event_id = %event.id, error = %err, "referenced record missing; skipping");
                Ok(())
            }
            other => other,
        }
    }

    fn enqueue_task(&self, event: &Event, agent_kind: AgentKind, task_kind: &str) -> Result<()> {
        let priority = event
            .payload
            .get("priority")
            .and_then(Value::as_u64)
            .and_then(|value| u8::try_from(value).ok())
            .filter(|value| (1..=10).contains(value))
            .unwrap_or(DEFAULT_TASK_PRIORITY);
        let task = self.store.insert_task(&NewTask {
            tenant: event.tenant.clone(),
            event_id: Some(event.id),
            agent_kind,
            task_kind: task_kind.to_string(),
            payload: event.payload.clone(),
            priority,
        })?;
        info!(
            task_id = %task.id,
            agent_kind = agent_kind.as_str(),
            task_kind,
            "task enqueued"
        );
        Ok(())
    }

    /// Parses, scores, validates, and routes a generated booking.
    ///
    /// # Errors
    /// Returns an error for a malformed payload or a store failure.
    pub fn handle_booking_completed(&self, event: &Event) -> Result<BookingDecision> {
        let payload: BookingCompletedPayload = serde_json::from_value(event.payload.clone())
            .context("invalid booking_completed payload")?;
        let document = payload.document;

        let (booking, mut flags, fallback) = match parse_suggestion_value(&payload.suggestion) {
            Ok(booking) => (booking, Vec::new(), false),
            Err(err) => {
                warn!(
                    event_id = %event.id,
                    source_reference = %document.source_reference,
                    error = %err,
                    "booking suggestion unreadable; using fallback booking"
                );
                (
                    fallback_booking(&document, &self.config.scoring.chart),
                    vec![ReviewFlag::UnparseableSuggestion],
                    true,
                )
            }
        };

        let mut score = self.score(&event.tenant, &document, &booking)?;
        if fallback {
            score = score.capped(FALLBACK_CONFIDENCE, "unparseable_suggestion");
        }

        let validator = BookingValidator::new(self.store);
        let thresholds = self.config.thresholds_for(&event.tenant);
        let route = match validator.validate(&booking.lines) {
            Ok(_) => thresholds.route(score.score),
            Err(err) => {
                warn!(
                    source_reference = %document.source_reference,
                    error = %err,
                    "booking is unbalanced; routing to review"
                );
                score = score.capped(UNBALANCED_CONFIDENCE_CAP, "unbalanced");
                flags.push(ReviewFlag::Unbalanced);
                match thresholds.route(score.score) {
                    Route::AutoPost => Route::Review(ReviewPriority::High),
                    review => review,
                }
            }
        };

        match route {
            Route::AutoPost => {
                let entry = NewLedgerEntry {
                    tenant: event.tenant.clone(),
                    accounting_date: document.accounting_date,
                    lines: booking.lines.clone(),
                    source_reference: document.source_reference.clone(),
                    counterparty: document.counterparty.clone(),
                    payment_reference: document.payment_reference.clone(),
                    reversal_of: None,
                };
                match validator.post(&entry) {
                    Ok(entry) => Ok(BookingDecision::Posted { entry, score }),
                    Err(PostingError::Store(err)) => Err(err),
                    Err(err) => {
                        warn!(
                            source_reference = %document.source_reference,
                            error = %err,
                            "auto-post refused; routing to review"
                        );
                        let reasoning =
                            format!("{}; auto-post refused: {err}", review_reasoning(&score, &booking));
                        self.queue_review(
                            event,
                            document,
                            booking,
                            score,
                            ReviewPriority::High,
                            flags,
                            reasoning,
                        )
                    }
                }
            }
            Route::Review(priority) => {
                let reasoning = review_reasoning(&score, &booking);
                self.queue_review(event, document, booking, score, priority, flags, reasoning)
            }
        }
    }

    fn score(
        &self,
        tenant: &TenantId,
        document: &DocumentFacts,
        booking: &CandidateBooking,
    ) -> Result<ConfidenceScore> {
        let history = match &document.counterparty {
            Some(counterparty) => self.store.counterparty_history(
                tenant,
                counterparty,
                document.accounting_date,
            )?,
            None => CounterpartyHistory::default(),
        };
        let patterns = self.store.active_patterns(tenant)?;
        let applicable: Vec<_> = patterns
            .iter()
            .filter(|pattern| pattern.is_applicable(tenant, document))
            .collect();
        Ok(score_booking(
            booking,
            document,
            &history,
            &applicable,
            &self.config.scoring,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn queue_review(
        &self,
        event: &Event,
        document: DocumentFacts,
        booking: CandidateBooking,
        score: ConfidenceScore,
        priority: ReviewPriority,
        flags: Vec<ReviewFlag>,
        reasoning: String,
    ) -> Result<BookingDecision> {
        let item = self.store.insert_review_item(&NewReviewItem {
            tenant: event.tenant.clone(),
            source_reference: document.source_reference.clone(),
            counterparty: document.counterparty.clone(),
            subject: ReviewSubject::Booking {
                document,
                proposed_booking: booking,
            },
            priority,
            confidence: score.score,
            reasoning,
            flags,
        })?;
        info!(
            review_item_id = %item.id,
            source_reference = %item.source_reference,
            priority = priority.as_str(),
            confidence = score.score,
            "booking queued for review"
        );
        Ok(BookingDecision::Queued {
            review_item_id: item.id,
            priority,
            score,
        })
    }

    fn handle_correction(&self, event: &Event) -> Result<()> {
        let task = self.store.insert_task(&NewTask {
            tenant: event.tenant.clone(),
            event_id: Some(event.id),
            agent_kind: AgentKind::Learning,
            task_kind: "learn_from_correction".to_string(),
            payload: event.payload.clone(),
            priority: LEARNING_TASK_PRIORITY,
        })?;

        match self.apply_correction(event) {
            Ok(note) => {
                self.store
                    .finish_task(task.id, TaskStatus::Completed, Some(note.as_str()))?;
                Ok(())
            }
            Err(err) => {
                let note = format!("{err:#}");
                self.store
                    .finish_task(task.id, TaskStatus::Aborted, Some(note.as_str()))?;
                if is_not_found(&err) {
                    warn!(task_id = %task.id, error = %note, "learning task aborted");
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    /// Persist, post, resolve the original review item, then learn.
    fn apply_correction(&self, event: &Event) -> Result<String> {
        let payload: CorrectionPayload = serde_json::from_value(event.payload.clone())
            .context("invalid correction_received payload")?;
        let validator = BookingValidator::new(self.store);

        let correction: Correction = match (payload.correction, payload.correction_id) {
            (Some(new), None) => {
                if new.tenant != event.tenant {
                    bail!(LedgerError::Validation(format!(
                        "correction tenant {} does not match event tenant {}",
                        new.tenant, event.tenant
                    )));
                }
                validator
                    .validate(&new.corrected_booking)
                    .map_err(LedgerError::from)?;
                self.store.insert_correction(&new)?
            }
            (None, Some(correction_id)) => self
                .store
                .get_correction(correction_id)?
                .filter(|correction| correction.tenant == event.tenant)
                .ok_or_else(|| NotFoundError {
                    kind: "correction",
                    id: correction_id.to_string(),
                })?,
            _ => bail!(LedgerError::Validation(
                "correction_received needs exactly one of correction or correction_id"
                    .to_string()
            )),
        };

        // A correction posts its booking once, however often it is replayed.
        let posted = match correction.posted_entry_id {
            Some(entry_id) => {
                debug!(
                    correction_id = %correction.id,
                    entry_id = %entry_id,
                    "corrected booking already posted"
                );
                entry_id
            }
            None => {
                let entry = validator.post(&NewLedgerEntry {
                    tenant: correction.tenant.clone(),
                    accounting_date: correction.accounting_date,
                    lines: correction.corrected_booking.clone(),
                    source_reference: correction.source_reference.clone(),
                    counterparty: correction.counterparty.clone(),
                    payment_reference: None,
                    reversal_of: None,
                })?;
                if !self.store.link_correction_entry(correction.id, entry.id)? {
                    bail!("correction {} was posted concurrently", correction.id);
                }
                entry.id
            }
        };

        if let Some(item) = self
            .store
            .find_pending_review_by_source(&correction.tenant, &correction.source_reference)?
        {
            let resolution = format!(
                "corrected by {}: {}",
                correction.corrected_by, correction.reason
            );
            if self.store.claim_review_item(item.id, &resolution)? {
                info!(review_item_id = %item.id, "review item resolved by correction");
            }
        }

        let learner = Learner::new(
            self.store,
            &self.config.scoring.chart,
            self.config.min_success_rate,
        );
        let note = match learner.learn(correction.id)? {
            LearningOutcome::AlreadyLearned { .. } => {
                format!("entry {posted} posted; correction already learned")
            }
            LearningOutcome::Learned(report) => format!(
                "entry {} posted; pattern {}; {} item(s) auto-corrected",
                posted,
                serde_json::to_string(&report.pattern)?,
                report.propagated.len()
            ),
        };
        Ok(note)
    }

    fn handle_bank_transaction(&self, event: &Event) -> Result<()> {
        let payload: BankTransactionPayload = serde_json::from_value(event.payload.clone())
            .context("invalid bank_transaction_imported payload")?;
        let transaction = payload.transaction;

        let candidates: Vec<_> = self
            .store
            .list_open_entries(&event.tenant)?
            .iter()
            .map(LedgerEntry::as_match_candidate)
            .collect();
        let result = auto_match(&transaction, &candidates, &self.config.matching);

        if result.confidence >= self.config.auto_reconcile_threshold {
            if let Some(voucher_id) = &result.matched_voucher_id {
                let entry_id: EntryId = voucher_id.parse().map_err(|_| NotFoundError {
                    kind: "ledger entry",
                    id: voucher_id.clone(),
                })?;
                let reconciliation = self.store.reconcile(
                    &event.tenant,
                    &transaction.id,
                    entry_id,
                    result.category,
                    result.confidence,
                )?;
                info!(
                    bank_transaction_id = %reconciliation.bank_transaction_id,
                    entry_id = %reconciliation.entry_id,
                    category = reconciliation.category.as_str(),
                    confidence = reconciliation.confidence,
                    "bank transaction reconciled"
                );
                return Ok(());
            }
        }

        let priority = if result.is_match() {
            ReviewPriority::Medium
        } else {
            ReviewPriority::High
        };
        let item = self.store.insert_review_item(&NewReviewItem {
            tenant: event.tenant.clone(),
            source_reference: transaction.id.clone(),
            counterparty: None,
            priority,
            confidence: result.confidence,
            reasoning: result.reason.clone(),
            flags: vec![ReviewFlag::BankMatch],
            subject: ReviewSubject::BankMatch {
                transaction,
                result,
            },
        })?;
        info!(
            review_item_id = %item.id,
            confidence = item.confidence,
            "bank transaction queued for review"
        );
        Ok(())
    }
}

fn review_reasoning(score: &ConfidenceScore, booking: &CandidateBooking) -> String {
    let codes = score.reason_codes.join(", ");
    if booking.reasoning.trim().is_empty() {
        codes
    } else {
        format!("{codes}; {}", booking.reasoning.trim())
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<NotFoundError>().is_some()
        || matches!(err.downcast_ref::<LedgerError>(), Some(LedgerError::NotFound(_)))
        || matches!(err.downcast_ref::<PostingError>(), Some(PostingError::NotFound(_)))
}

/// Event loop. Owns the store behind an `Arc` so handlers can run on the
/// blocking pool.
pub struct Orchestrator<S> {
    store: Arc<S>,
    config: Arc<EngineConfig>,
}

impl<S: LedgerStore + Send + Sync + 'static> Orchestrator<S> {
    /// # Errors
    /// Returns an error when the configuration is invalid.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs until `shutdown` fires. Cancellation is checked between
    /// batches; an in-flight batch always completes.
    ///
    /// # Errors
    /// Returns an error only when stale events cannot be reset on start.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunSummary> {
        let stale_reset = self.blocking(|store| store.reset_stale_events()).await?;
        info!(
            stale_reset,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "orchestrator starting"
        );

        let mut summary = RunSummary {
            stale_reset,
            ..RunSummary::default()
        };
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let batch = match self.process_batch().await {
                Ok(batch) => batch,
                Err(err) => {
                    error!(error = %err, "failed to process event batch");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.retry_pause()) => {}
                    }
                    continue;
                }
            };
            summary.absorb(batch);

            if batch.claimed < self.config.batch_size {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
        }

        info!(events = summary.events, failed = summary.failed, "orchestrator stopped");
        Ok(summary)
    }

    /// Resets stale events and processes batches until the queue is empty.
    ///
    /// # Errors
    /// Returns the first store failure.
    pub async fn drain(&self) -> Result<RunSummary> {
        let stale_reset = self.blocking(|store| store.reset_stale_events()).await?;
        let mut summary = RunSummary {
            stale_reset,
            ..RunSummary::default()
        };
        loop {
            let batch = self.process_batch().await?;
            if batch.claimed == 0 {
                break;
            }
            summary.absorb(batch);
        }
        Ok(summary)
    }

    /// Claims one batch and handles its events in order.
    ///
    /// If finalizing an event fails, the rest of the batch is released back
    /// to `unprocessed` before the error is returned.
    ///
    /// # Errors
    /// Returns an error when claiming or finalizing events fails. Handler
    /// failures are settled through the failure policy instead.
    pub async fn process_batch(&self) -> Result<BatchSummary> {
        let limit = self.config.batch_size;
        let events = self
            .blocking(move |store| store.claim_event_batch(limit))
            .await?;
        let mut summary = BatchSummary {
            claimed: events.len(),
            ..BatchSummary::default()
        };

        if let Err(err) = self.handle_claimed(events, &mut summary).await {
            // Single worker: every event still in `processing` is ours.
            match self.blocking(|store| store.reset_stale_events()).await {
                Ok(released) => {
                    warn!(released, error = %err, "event batch aborted; claimed events released");
                }
                Err(release_err) => {
                    error!(error = %release_err, "failed to release claimed events");
                }
            }
            return Err(err);
        }

        if summary.claimed > 0 {
            debug!(
                claimed = summary.claimed,
                failed = summary.failed,
                "event batch processed"
            );
        }
        Ok(summary)
    }

    async fn handle_claimed(&self, events: Vec<Event>, summary: &mut BatchSummary) -> Result<()> {
        for event in events {
            match self.handle(event.clone()).await {
                Ok(()) => {
                    let event_id = event.id;
                    self.blocking(move |store| store.mark_event_processed(event_id, None))
                        .await?;
                    summary.succeeded += 1;
                }
                Err(err) => {
                    summary.failed += 1;
                    if self.settle_failure(&event, &err).await? == EventStatus::DeadLettered {
                        summary.dead_lettered += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, event: Event) -> Result<()> {
        let event_id = event.id;
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let mut handle = tokio::task::spawn_blocking(move || {
            Dispatcher::new(store.as_ref(), config.as_ref()).dispatch(&event)
        });

        let Some(deadline) = self.config.handler_deadline() else {
            return handle
                .await
                .map_err(|err| anyhow!("event handler did not complete: {err}"))?;
        };
        let outcome = tokio::time::timeout(deadline, &mut handle).await;
        match outcome {
            Ok(joined) => joined.map_err(|err| anyhow!("event handler did not complete: {err}"))?,
            Err(_) => {
                // The blocking work cannot be interrupted. Wait it out so
                // handlers never overlap, then fail the event.
                warn!(
                    event_id = %event_id,
                    deadline_ms = %deadline.as_millis(),
                    "event handler exceeded deadline; waiting for it to finish"
                );
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(event_id = %event_id, error = %err, "late handler failed"),
                    Err(err) => warn!(event_id = %event_id, error = %err, "late handler panicked"),
                }
                Err(anyhow!(
                    "handler exceeded deadline of {}ms",
                    deadline.as_millis()
                ))
            }
        }
    }

    async fn settle_failure(&self, event: &Event, err: &anyhow::Error) -> Result<EventStatus> {
        let message = format!("{err:#}");
        let event_id = event.id;
        match self.config.failure_policy {
            FailurePolicy::FailOpen => {
                warn!(
                    event_id = %event_id,
                    kind = event.kind.as_str(),
                    error = %message,
                    "event handler failed; marking processed"
                );
                self.blocking(move |store| {
                    store.mark_event_processed(event_id, Some(message.as_str()))
                })
                .await?;
                Ok(EventStatus::Processed)
            }
            FailurePolicy::DeadLetter { max_attempts } => {
                let status = self
                    .blocking(move |store| {
                        store.release_failed_event(event_id, &message, max_attempts)
                    })
                    .await?;
                if status == EventStatus::DeadLettered {
                    error!(
                        event_id = %event_id,
                        kind = event.kind.as_str(),
                        error = %err,
                        "event dead-lettered"
                    );
                } else {
                    warn!(event_id = %event_id, error = %err, "event handler failed; will retry");
                }
                Ok(status)
            }
        }
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&S) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || work(store.as_ref()))
            .await
            .context("store task did not complete")?
    }
}
