#![forbid(unsafe_code)]

mod schema;

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use autoledger_core::booking::check_balance;
use autoledger_core::scoring::HISTORY_WINDOW;
use autoledger_core::{
    format_date, format_rfc3339, now_utc, parse_date, parse_rfc3339_utc, AccountCode,
    AccountingPeriod, AgentKind, BookingLine, Correction, CorrectionId, CounterpartyHistory,
    CounterpartyId, EntryId, EntryStatus, Event, EventId, EventKind, EventStatus, LedgerEntry,
    MatchCategory, NewCorrection, NewEvent, NewLedgerEntry, NewPattern, NewReviewItem, NewTask,
    Pattern, PatternId, PatternKind, Reconciliation, ReviewItem, ReviewItemId, ReviewPriority,
    ReviewStatus, Task, TaskId, TaskStatus, TenantId,
};
use autoledger_store_core::{HistoryRepository, LedgerStore};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
pub use schema::LEDGER_SCHEMA_VERSION;
use schema::SCHEMA_V1;
use time::{Date, Duration, OffsetDateTime};

const EVENT_COLUMNS: &str =
    "seq, event_id, tenant, kind, payload_json, created_at, status, attempts, last_error";
const TASK_COLUMNS: &str = "task_id, tenant, event_id, agent_kind, task_kind, payload_json, \
     priority, status, note, created_at";
const ENTRY_COLUMNS: &str = "entry_id, tenant, accounting_date, sequence_number, status, \
     source_reference, counterparty, payment_reference, reversal_of, created_at, posted_at";
const REVIEW_COLUMNS: &str = "item_id, tenant, source_reference, counterparty, subject_json, \
     priority, status, confidence, reasoning, flags_json, resolution, created_at, resolved_at";
const CORRECTION_COLUMNS: &str = "correction_id, tenant, source_reference, counterparty, \
     description, document_amount, accounting_date, original_json, corrected_json, reason, \
     corrected_by, created_at, learned_at, posted_entry_id";
const PATTERN_COLUMNS: &str = "pattern_id, kind, trigger_json, action_json, scope_json, \
     success_rate, times_applied, times_correct, confidence_boost, active, created_at, updated_at";

/// `SQLite`-backed ledger store. The connection sits behind a mutex so all
/// writes go through a single writer.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    /// Open or create a `SQLite` ledger database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

impl HistoryRepository for SqliteLedgerStore {
    fn counterparty_history(
        &self,
        tenant: &TenantId,
        counterparty: &CounterpartyId,
        as_of: Date,
    ) -> Result<CounterpartyHistory> {
        let conn = self.conn()?;
        let window_start = as_of.saturating_sub(Duration::days(365));

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM ledger_entries e
                 WHERE e.tenant = ?1 AND e.counterparty = ?2 AND e.status = 'posted'
                   AND e.reversal_of IS NULL
                   AND NOT EXISTS (SELECT 1 FROM ledger_entries r WHERE r.reversal_of = e.entry_id)
                   AND e.accounting_date > ?3 AND e.accounting_date <= ?4",
                params![
                    tenant.as_str(),
                    counterparty.as_str(),
                    format_date(window_start)?,
                    format_date(as_of)?,
                ],
                |row| row.get(0),
            )
            .context("failed to count counterparty postings")?;

        let mut stmt = conn.prepare(
            "SELECT e.entry_id FROM ledger_entries e
             WHERE e.tenant = ?1 AND e.counterparty = ?2 AND e.status = 'posted'
               AND e.reversal_of IS NULL
               AND NOT EXISTS (SELECT 1 FROM ledger_entries r WHERE r.reversal_of = e.entry_id)
               AND e.accounting_date <= ?3
             ORDER BY e.accounting_date DESC, e.sequence_number DESC
             LIMIT ?4",
        )?;
        let mut rows = stmt.query(params![
            tenant.as_str(),
            counterparty.as_str(),
            format_date(as_of)?,
            i64::try_from(HISTORY_WINDOW).map_err(|_| anyhow!("history window too large"))?,
        ])?;
        let mut entry_ids = Vec::new();
        while let Some(row) = rows.next()? {
            entry_ids.push(row.get::<_, String>(0)?);
        }

        let mut recent_account_sets = Vec::with_capacity(entry_ids.len());
        for entry_id in entry_ids {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT account FROM ledger_lines WHERE entry_id = ?1 ORDER BY account",
            )?;
            let mut rows = stmt.query(params![entry_id])?;
            let mut accounts = std::collections::BTreeSet::new();
            while let Some(row) = rows.next()? {
                accounts.insert(AccountCode::new(row.get::<_, String>(0)?));
            }
            recent_account_sets.push(accounts);
        }

        Ok(CounterpartyHistory {
            postings_last_12_months: u32::try_from(count)
                .map_err(|_| anyhow!("posting count out of range"))?,
            recent_account_sets,
        })
    }

    fn active_patterns(&self, tenant: &TenantId) -> Result<Vec<Pattern>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns WHERE active = 1
             ORDER BY created_at ASC, pattern_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let pattern = pattern_from_row(row)?;
            if pattern.scope.includes(tenant) {
                out.push(pattern);
            }
        }
        Ok(out)
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply ledger schema")?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![LEDGER_SCHEMA_VERSION, format_rfc3339(now_utc())?],
        )
        .context("failed to record ledger migration")?;

        Ok(())
    }

    fn append_event(&self, event: &NewEvent) -> Result<Event> {
        event.validate()?;
        let event_id = EventId::new();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events(event_id, tenant, kind, payload_json, created_at, status, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, 'unprocessed', 0)",
            params![
                event_id.to_string(),
                event.tenant.as_str(),
                event.kind.as_str(),
                serde_json::to_string(&event.payload)?,
                format_rfc3339(now_utc())?,
            ],
        )
        .context("failed to append event")?;
        load_event(&conn, event_id)?.ok_or_else(|| anyhow!("event {event_id} vanished after insert"))
    }

    fn get_event(&self, event_id: EventId) -> Result<Option<Event>> {
        let conn = self.conn()?;
        load_event(&conn, event_id)
    }

    fn list_events(&self, status: Option<EventStatus>) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at ASC, seq ASC"
        ))?;
        let mut rows = stmt.query(params![status.map(EventStatus::as_str)])?;
        collect_rows(&mut rows, event_from_row)
    }

    fn reset_stale_events(&self) -> Result<usize> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE events SET status = 'unprocessed' WHERE status = 'processing'",
            [],
        )
        .context("failed to reset stale events")
    }

    fn claim_event_batch(&self, limit: usize) -> Result<Vec<Event>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut claimed = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE status = 'unprocessed'
                 ORDER BY created_at ASC, seq ASC
                 LIMIT ?1"
            ))?;
            let mut rows =
                stmt.query(params![i64::try_from(limit).map_err(|_| anyhow!("batch too large"))?])?;
            while let Some(row) = rows.next()? {
                claimed.push(event_from_row(row)?);
            }
        }
        for event in &mut claimed {
            tx.execute(
                "UPDATE events SET status = 'processing' WHERE event_id = ?1",
                params![event.id.to_string()],
            )
            .context("failed to claim event")?;
            event.status = EventStatus::Processing;
        }
        tx.commit().context("failed to commit event claim")?;
        Ok(claimed)
    }

    fn mark_event_processed(&self, event_id: EventId, last_error: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE events SET status = 'processed', attempts = attempts + 1, last_error = ?2
                 WHERE event_id = ?1",
                params![event_id.to_string(), last_error],
            )
            .context("failed to mark event processed")?;
        if changed == 0 {
            bail!("event {event_id} not found");
        }
        Ok(())
    }

    fn release_failed_event(
        &self,
        event_id: EventId,
        error: &str,
        max_attempts: u32,
    ) -> Result<EventStatus> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let attempts: i64 = tx
            .query_row(
                "SELECT attempts FROM events WHERE event_id = ?1",
                params![event_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow!("event {event_id} not found"))?;
        let attempts = attempts + 1;
        let status = if attempts >= i64::from(max_attempts) {
            EventStatus::DeadLettered
        } else {
            EventStatus::Unprocessed
        };
        tx.execute(
            "UPDATE events SET status = ?2, attempts = ?3, last_error = ?4 WHERE event_id = ?1",
            params![event_id.to_string(), status.as_str(), attempts, error],
        )
        .context("failed to record failed event attempt")?;
        tx.commit().context("failed to commit failed event attempt")?;
        Ok(status)
    }

    fn insert_task(&self, task: &NewTask) -> Result<Task> {
        task.validate()?;
        let task_id = TaskId::new();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks(
                task_id, tenant, event_id, agent_kind, task_kind, payload_json,
                priority, status, note, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', NULL, ?8)",
            params![
                task_id.to_string(),
                task.tenant.as_str(),
                task.event_id.map(|id| id.to_string()),
                task.agent_kind.as_str(),
                task.task_kind,
                serde_json::to_string(&task.payload)?,
                i64::from(task.priority),
                format_rfc3339(now_utc())?,
            ],
        )
        .context("failed to insert task")?;

        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"))?;
        let mut rows = stmt.query(params![task_id.to_string()])?;
        match rows.next()? {
            Some(row) => task_from_row(row),
            None => Err(anyhow!("task {task_id} vanished after insert")),
        }
    }

    fn finish_task(&self, task_id: TaskId, status: TaskStatus, note: Option<&str>) -> Result<()> {
        if status == TaskStatus::Pending {
            bail!("finish_task requires a terminal status");
        }
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = ?2, note = ?3, finished_at = ?4
                 WHERE task_id = ?1 AND status = 'pending'",
                params![
                    task_id.to_string(),
                    status.as_str(),
                    note,
                    format_rfc3339(now_utc())?,
                ],
            )
            .context("failed to finish task")?;
        if changed == 0 {
            bail!("task {task_id} is not pending");
        }
        Ok(())
    }

    fn list_tasks(&self, tenant: Option<&TenantId>) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR tenant = ?1)
             ORDER BY created_at ASC, task_id ASC"
        ))?;
        let mut rows = stmt.query(params![tenant.map(TenantId::as_str)])?;
        collect_rows(&mut rows, task_from_row)
    }

    fn allocate_sequence(&self, tenant: &TenantId) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row(
            "INSERT INTO sequence_counters(tenant, last_value) VALUES (?1, 1)
             ON CONFLICT(tenant) DO UPDATE SET last_value = last_value + 1
             RETURNING last_value",
            params![tenant.as_str()],
            |row| row.get(0),
        )
        .context("failed to allocate voucher sequence number")
    }

    fn insert_draft_entry(
        &self,
        entry: &NewLedgerEntry,
        sequence_number: i64,
    ) -> Result<LedgerEntry> {
        if entry.lines.is_empty() {
            bail!("ledger entry requires at least one line");
        }
        let entry_id = EntryId::new();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO ledger_entries(
                entry_id, tenant, accounting_date, sequence_number, status,
                source_reference, counterparty, payment_reference, reversal_of, created_at, posted_at
             ) VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?6, ?7, ?8, ?9, NULL)",
            params![
                entry_id.to_string(),
                entry.tenant.as_str(),
                format_date(entry.accounting_date)?,
                sequence_number,
                entry.source_reference,
                entry.counterparty.as_ref().map(CounterpartyId::as_str),
                entry.payment_reference,
                entry.reversal_of.map(|id| id.to_string()),
                format_rfc3339(now_utc())?,
            ],
        )
        .context("failed to insert draft ledger entry")?;

        for (line_no, line) in entry.lines.iter().enumerate() {
            tx.execute(
                "INSERT INTO ledger_lines(
                    entry_id, line_no, account, debit, credit, tax_code, description
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry_id.to_string(),
                    i64::try_from(line_no).map_err(|_| anyhow!("too many ledger lines"))?,
                    line.account.as_str(),
                    line.debit.to_string(),
                    line.credit.to_string(),
                    line.tax_code,
                    line.description,
                ],
            )
            .context("failed to insert ledger line")?;
        }

        let stored =
            load_entry(&tx, entry_id)?.ok_or_else(|| anyhow!("entry {entry_id} vanished"))?;
        tx.commit().context("failed to commit draft ledger entry")?;
        Ok(stored)
    }

    fn post_entry(&self, entry_id: EntryId) -> Result<LedgerEntry> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry = load_entry(&tx, entry_id)?
            .ok_or_else(|| anyhow!("ledger entry {entry_id} not found"))?;
        if entry.status == EntryStatus::Posted {
            bail!("ledger entry {entry_id} is already posted");
        }
        check_balance(&entry.lines)?;

        tx.execute(
            "UPDATE ledger_entries SET status = 'posted', posted_at = ?2 WHERE entry_id = ?1",
            params![entry_id.to_string(), format_rfc3339(now_utc())?],
        )
        .context("failed to post ledger entry")?;
        let posted =
            load_entry(&tx, entry_id)?.ok_or_else(|| anyhow!("entry {entry_id} vanished"))?;
        tx.commit().context("failed to commit posting")?;
        Ok(posted)
    }

    fn get_entry(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>> {
        let conn = self.conn()?;
        load_entry(&conn, entry_id)
    }

    fn find_reversal(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>> {
        let conn = self.conn()?;
        let reversal_id: Option<String> = conn
            .query_row(
                "SELECT entry_id FROM ledger_entries WHERE reversal_of = ?1",
                params![entry_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match reversal_id {
            Some(raw) => load_entry(&conn, parse_id(&raw, "entry_id")?),
            None => Ok(None),
        }
    }

    fn list_entries(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn()?;
        query_entries(
            &conn,
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE tenant = ?1
                 ORDER BY sequence_number ASC"
            ),
            tenant,
        )
    }

    fn list_open_entries(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn()?;
        query_entries(
            &conn,
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries e
                 WHERE e.tenant = ?1 AND e.status = 'posted' AND e.reversal_of IS NULL
                   AND NOT EXISTS (SELECT 1 FROM ledger_entries r WHERE r.reversal_of = e.entry_id)
                   AND NOT EXISTS (SELECT 1 FROM reconciliations c WHERE c.entry_id = e.entry_id)
                 ORDER BY e.accounting_date ASC, e.sequence_number ASC"
            ),
            tenant,
        )
    }

    fn lock_period(&self, tenant: &TenantId, period: AccountingPeriod) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO locked_periods(tenant, period, locked_at) VALUES (?1, ?2, ?3)",
            params![
                tenant.as_str(),
                period.to_string(),
                format_rfc3339(now_utc())?
            ],
        )
        .context("failed to lock accounting period")?;
        Ok(())
    }

    fn is_period_locked(&self, tenant: &TenantId, period: AccountingPeriod) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM locked_periods WHERE tenant = ?1 AND period = ?2",
                params![tenant.as_str(), period.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read locked periods")?;
        Ok(found.is_some())
    }

    fn insert_review_item(&self, item: &NewReviewItem) -> Result<ReviewItem> {
        if item.confidence > 100 {
            bail!("review confidence must be within 0..=100");
        }
        let item_id = ReviewItemId::new();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO review_items(
                item_id, tenant, source_reference, counterparty, subject_json, priority,
                status, confidence, reasoning, flags_json, resolution, created_at, resolved_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9, NULL, ?10, NULL)",
            params![
                item_id.to_string(),
                item.tenant.as_str(),
                item.source_reference,
                item.counterparty.as_ref().map(CounterpartyId::as_str),
                serde_json::to_string(&item.subject)?,
                item.priority.as_str(),
                i64::from(item.confidence),
                item.reasoning,
                serde_json::to_string(&item.flags)?,
                format_rfc3339(now_utc())?,
            ],
        )
        .context("failed to insert review item")?;
        load_review_item(&conn, item_id)?
            .ok_or_else(|| anyhow!("review item {item_id} vanished after insert"))
    }

    fn get_review_item(&self, item_id: ReviewItemId) -> Result<Option<ReviewItem>> {
        let conn = self.conn()?;
        load_review_item(&conn, item_id)
    }

    fn list_review_items(
        &self,
        tenant: &TenantId,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<ReviewItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_items
             WHERE tenant = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at ASC, item_id ASC"
        ))?;
        let mut rows = stmt.query(params![tenant.as_str(), status.map(ReviewStatus::as_str)])?;
        collect_rows(&mut rows, review_item_from_row)
    }

    fn find_pending_review_by_source(
        &self,
        tenant: &TenantId,
        source_reference: &str,
    ) -> Result<Option<ReviewItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_items
             WHERE tenant = ?1 AND source_reference = ?2 AND status = 'pending'
             ORDER BY created_at DESC, item_id DESC
             LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![tenant.as_str(), source_reference])?;
        rows.next()?.map(review_item_from_row).transpose()
    }

    fn pending_reviews_for_counterparty(
        &self,
        tenant: &TenantId,
        counterparty: &CounterpartyId,
    ) -> Result<Vec<ReviewItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_items
             WHERE tenant = ?1 AND counterparty = ?2 AND status = 'pending'
             ORDER BY created_at ASC, item_id ASC"
        ))?;
        let mut rows = stmt.query(params![tenant.as_str(), counterparty.as_str()])?;
        collect_rows(&mut rows, review_item_from_row)
    }

    fn claim_review_item(&self, item_id: ReviewItemId, resolution: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE review_items SET status = 'resolved', resolution = ?2, resolved_at = ?3
                 WHERE item_id = ?1 AND status = 'pending'",
                params![item_id.to_string(), resolution, format_rfc3339(now_utc())?],
            )
            .context("failed to claim review item")?;
        Ok(changed == 1)
    }

    fn reopen_review_item(&self, item_id: ReviewItemId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE review_items SET status = 'pending', resolution = NULL, resolved_at = NULL
             WHERE item_id = ?1",
            params![item_id.to_string()],
        )
        .context("failed to reopen review item")?;
        Ok(())
    }

    fn insert_correction(&self, correction: &NewCorrection) -> Result<Correction> {
        correction.validate()?;
        let correction_id = CorrectionId::new();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO corrections(
                correction_id, tenant, source_reference, counterparty, description,
                document_amount, accounting_date, original_json, corrected_json, reason,
                corrected_by, created_at, learned_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL)",
            params![
                correction_id.to_string(),
                correction.tenant.as_str(),
                correction.source_reference,
                correction.counterparty.as_ref().map(CounterpartyId::as_str),
                correction.description,
                correction.document_amount.map(|value| value.to_string()),
                format_date(correction.accounting_date)?,
                serde_json::to_string(&correction.original_booking)?,
                serde_json::to_string(&correction.corrected_booking)?,
                correction.reason,
                correction.corrected_by,
                format_rfc3339(now_utc())?,
            ],
        )
        .context("failed to insert correction")?;
        load_correction(&conn, correction_id)?
            .ok_or_else(|| anyhow!("correction {correction_id} vanished after insert"))
    }

    fn get_correction(&self, correction_id: CorrectionId) -> Result<Option<Correction>> {
        let conn = self.conn()?;
        load_correction(&conn, correction_id)
    }

    fn mark_correction_learned(&self, correction_id: CorrectionId) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE corrections SET learned_at = ?2
                 WHERE correction_id = ?1 AND learned_at IS NULL",
                params![correction_id.to_string(), format_rfc3339(now_utc())?],
            )
            .context("failed to stamp correction as learned")?;
        Ok(changed == 1)
    }

    fn link_correction_entry(
        &self,
        correction_id: CorrectionId,
        entry_id: EntryId,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE corrections SET posted_entry_id = ?2
                 WHERE correction_id = ?1 AND posted_entry_id IS NULL",
                params![correction_id.to_string(), entry_id.to_string()],
            )
            .context("failed to link correction to its ledger entry")?;
        Ok(changed == 1)
    }

    fn insert_pattern(&self, pattern: &NewPattern) -> Result<Pattern> {
        if pattern.action.accounts.is_empty() {
            bail!("pattern action requires at least one account");
        }
        let pattern_id = PatternId::new();
        let now = format_rfc3339(now_utc())?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO patterns(
                pattern_id, kind, trigger_key, trigger_json, action_key, action_json, scope_json,
                success_rate, times_applied, times_correct, confidence_boost, active,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1.0, 1, 1, ?8, 1, ?9, ?9)",
            params![
                pattern_id.to_string(),
                pattern.kind.as_str(),
                pattern.trigger.canonical_key(),
                serde_json::to_string(&pattern.trigger)?,
                pattern.action.canonical_key(),
                serde_json::to_string(&pattern.action)?,
                serde_json::to_string(&pattern.scope)?,
                i64::from(pattern.confidence_boost),
                now,
            ],
        )
        .context("failed to insert pattern")?;
        load_pattern(&conn, pattern_id)?
            .ok_or_else(|| anyhow!("pattern {pattern_id} vanished after insert"))
    }

    fn get_pattern(&self, pattern_id: PatternId) -> Result<Option<Pattern>> {
        let conn = self.conn()?;
        load_pattern(&conn, pattern_id)
    }

    fn list_patterns(&self) -> Result<Vec<Pattern>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns ORDER BY created_at ASC, pattern_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        collect_rows(&mut rows, pattern_from_row)
    }

    fn record_pattern_outcome(&self, pattern_id: PatternId, correct: bool) -> Result<Pattern> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx
            .execute(
                "UPDATE patterns SET
                    times_applied = times_applied + 1,
                    times_correct = times_correct + ?2,
                    success_rate = CAST(times_correct + ?2 AS REAL) / (times_applied + 1),
                    updated_at = ?3
                 WHERE pattern_id = ?1",
                params![
                    pattern_id.to_string(),
                    i64::from(correct),
                    format_rfc3339(now_utc())?
                ],
            )
            .context("failed to update pattern counters")?;
        if changed == 0 {
            bail!("pattern {pattern_id} not found");
        }
        let pattern = load_pattern(&tx, pattern_id)?
            .ok_or_else(|| anyhow!("pattern {pattern_id} vanished"))?;
        tx.commit().context("failed to commit pattern counters")?;
        Ok(pattern)
    }

    fn deactivate_pattern(&self, pattern_id: PatternId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE patterns SET active = 0, updated_at = ?2 WHERE pattern_id = ?1 AND active = 1",
            params![pattern_id.to_string(), format_rfc3339(now_utc())?],
        )
        .context("failed to deactivate pattern")?;
        Ok(())
    }

    fn reconcile(
        &self,
        tenant: &TenantId,
        bank_transaction_id: &str,
        entry_id: EntryId,
        category: MatchCategory,
        confidence: u8,
    ) -> Result<Reconciliation> {
        let created_at = now_utc();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reconciliations(
                tenant, bank_transaction_id, entry_id, category, confidence, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tenant.as_str(),
                bank_transaction_id,
                entry_id.to_string(),
                category.as_str(),
                i64::from(confidence),
                format_rfc3339(created_at)?,
            ],
        )
        .with_context(|| {
            format!("failed to reconcile bank transaction {bank_transaction_id} with {entry_id}")
        })?;
        Ok(Reconciliation {
            tenant: tenant.clone(),
            bank_transaction_id: bank_transaction_id.to_string(),
            entry_id,
            category,
            confidence,
            created_at,
        })
    }

    fn list_reconciliations(&self, tenant: &TenantId) -> Result<Vec<Reconciliation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT tenant, bank_transaction_id, entry_id, category, confidence, created_at
             FROM reconciliations WHERE tenant = ?1
             ORDER BY created_at ASC, bank_transaction_id ASC",
        )?;
        let mut rows = stmt.query(params![tenant.as_str()])?;
        collect_rows(&mut rows, |row| {
            Ok(Reconciliation {
                tenant: TenantId::new(row.get::<_, String>(0)?),
                bank_transaction_id: row.get(1)?,
                entry_id: parse_id(&row.get::<_, String>(2)?, "entry_id")?,
                category: parse_enum(&row.get::<_, String>(3)?, "category", MatchCategory::parse)?,
                confidence: u8::try_from(row.get::<_, i64>(4)?)?,
                created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
            })
        })
    }
}

fn collect_rows<T>(
    rows: &mut rusqlite::Rows<'_>,
    parse: impl Fn(&Row<'_>) -> Result<T>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(parse(row)?);
    }
    Ok(out)
}

fn load_event(conn: &Connection, event_id: EventId) -> Result<Option<Event>> {
    let mut stmt = conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"))?;
    let mut rows = stmt.query(params![event_id.to_string()])?;
    rows.next()?.map(event_from_row).transpose()
}

fn event_from_row(row: &Row<'_>) -> Result<Event> {
    let payload_raw: String = row.get(4)?;
    Ok(Event {
        seq: row.get(0)?,
        id: parse_id(&row.get::<_, String>(1)?, "event_id")?,
        tenant: TenantId::new(row.get::<_, String>(2)?),
        kind: parse_enum(&row.get::<_, String>(3)?, "event kind", EventKind::parse)?,
        payload: serde_json::from_str(&payload_raw).context("invalid payload_json")?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
        status: parse_enum(&row.get::<_, String>(6)?, "event status", EventStatus::parse)?,
        attempts: u32::try_from(row.get::<_, i64>(7)?)?,
        last_error: row.get(8)?,
    })
}

fn task_from_row(row: &Row<'_>) -> Result<Task> {
    let payload_raw: String = row.get(5)?;
    Ok(Task {
        id: parse_id(&row.get::<_, String>(0)?, "task_id")?,
        tenant: TenantId::new(row.get::<_, String>(1)?),
        event_id: row
            .get::<_, Option<String>>(2)?
            .map(|raw| parse_id(&raw, "event_id"))
            .transpose()?,
        agent_kind: parse_enum(&row.get::<_, String>(3)?, "agent kind", AgentKind::parse)?,
        task_kind: row.get(4)?,
        payload: serde_json::from_str(&payload_raw).context("invalid task payload_json")?,
        priority: u8::try_from(row.get::<_, i64>(6)?)?,
        status: parse_enum(&row.get::<_, String>(7)?, "task status", TaskStatus::parse)?,
        note: row.get(8)?,
        created_at: parse_timestamp(&row.get::<_, String>(9)?)?,
    })
}

fn query_entries(conn: &Connection, sql: &str, tenant: &TenantId) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![tenant.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(entry_from_row(conn, row)?);
    }
    Ok(out)
}

fn load_entry(conn: &Connection, entry_id: EntryId) -> Result<Option<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE entry_id = ?1"
    ))?;
    let mut rows = stmt.query(params![entry_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(entry_from_row(conn, row)?)),
        None => Ok(None),
    }
}

fn entry_from_row(conn: &Connection, row: &Row<'_>) -> Result<LedgerEntry> {
    let entry_id: EntryId = parse_id(&row.get::<_, String>(0)?, "entry_id")?;
    Ok(LedgerEntry {
        id: entry_id,
        tenant: TenantId::new(row.get::<_, String>(1)?),
        accounting_date: parse_date(&row.get::<_, String>(2)?)?,
        sequence_number: row.get(3)?,
        lines: load_lines(conn, entry_id)?,
        status: parse_enum(&row.get::<_, String>(4)?, "entry status", EntryStatus::parse)?,
        source_reference: row.get(5)?,
        counterparty: row.get::<_, Option<String>>(6)?.map(CounterpartyId::new),
        payment_reference: row.get(7)?,
        reversal_of: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_id(&raw, "reversal_of"))
            .transpose()?,
        created_at: parse_timestamp(&row.get::<_, String>(9)?)?,
        posted_at: row
            .get::<_, Option<String>>(10)?
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
    })
}

fn load_lines(conn: &Connection, entry_id: EntryId) -> Result<Vec<BookingLine>> {
    let mut stmt = conn.prepare(
        "SELECT account, debit, credit, tax_code, description
         FROM ledger_lines WHERE entry_id = ?1 ORDER BY line_no ASC",
    )?;
    let mut rows = stmt.query(params![entry_id.to_string()])?;
    collect_rows(&mut rows, |row| {
        Ok(BookingLine {
            account: AccountCode::new(row.get::<_, String>(0)?),
            debit: parse_decimal(&row.get::<_, String>(1)?)?,
            credit: parse_decimal(&row.get::<_, String>(2)?)?,
            tax_code: row.get(3)?,
            description: row.get(4)?,
        })
    })
}

fn load_review_item(conn: &Connection, item_id: ReviewItemId) -> Result<Option<ReviewItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REVIEW_COLUMNS} FROM review_items WHERE item_id = ?1"
    ))?;
    let mut rows = stmt.query(params![item_id.to_string()])?;
    rows.next()?.map(review_item_from_row).transpose()
}

fn review_item_from_row(row: &Row<'_>) -> Result<ReviewItem> {
    let subject_raw: String = row.get(4)?;
    let flags_raw: String = row.get(9)?;
    Ok(ReviewItem {
        id: parse_id(&row.get::<_, String>(0)?, "item_id")?,
        tenant: TenantId::new(row.get::<_, String>(1)?),
        source_reference: row.get(2)?,
        counterparty: row.get::<_, Option<String>>(3)?.map(CounterpartyId::new),
        subject: serde_json::from_str(&subject_raw).context("invalid review subject_json")?,
        priority: parse_enum(&row.get::<_, String>(5)?, "review priority", ReviewPriority::parse)?,
        status: parse_enum(&row.get::<_, String>(6)?, "review status", ReviewStatus::parse)?,
        confidence: u8::try_from(row.get::<_, i64>(7)?)?,
        reasoning: row.get(8)?,
        flags: serde_json::from_str(&flags_raw).context("invalid review flags_json")?,
        resolution: row.get(10)?,
        created_at: parse_timestamp(&row.get::<_, String>(11)?)?,
        resolved_at: row
            .get::<_, Option<String>>(12)?
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
    })
}

fn load_correction(conn: &Connection, correction_id: CorrectionId) -> Result<Option<Correction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CORRECTION_COLUMNS} FROM corrections WHERE correction_id = ?1"
    ))?;
    let mut rows = stmt.query(params![correction_id.to_string()])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let original_raw: String = row.get(7)?;
    let corrected_raw: String = row.get(8)?;
    Ok(Some(Correction {
        id: parse_id(&row.get::<_, String>(0)?, "correction_id")?,
        tenant: TenantId::new(row.get::<_, String>(1)?),
        source_reference: row.get(2)?,
        counterparty: row.get::<_, Option<String>>(3)?.map(CounterpartyId::new),
        description: row.get(4)?,
        document_amount: row
            .get::<_, Option<String>>(5)?
            .map(|raw| parse_decimal(&raw))
            .transpose()?,
        accounting_date: parse_date(&row.get::<_, String>(6)?)?,
        original_booking: serde_json::from_str(&original_raw)
            .context("invalid correction original_json")?,
        corrected_booking: serde_json::from_str(&corrected_raw)
            .context("invalid correction corrected_json")?,
        reason: row.get(9)?,
        corrected_by: row.get(10)?,
        created_at: parse_timestamp(&row.get::<_, String>(11)?)?,
        learned_at: row
            .get::<_, Option<String>>(12)?
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
        posted_entry_id: row
            .get::<_, Option<String>>(13)?
            .map(|raw| parse_id(&raw, "posted_entry_id"))
            .transpose()?,
    }))
}

fn load_pattern(conn: &Connection, pattern_id: PatternId) -> Result<Option<Pattern>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATTERN_COLUMNS} FROM patterns WHERE pattern_id = ?1"
    ))?;
    let mut rows = stmt.query(params![pattern_id.to_string()])?;
    rows.next()?.map(pattern_from_row).transpose()
}

fn pattern_from_row(row: &Row<'_>) -> Result<Pattern> {
    let trigger_raw: String = row.get(2)?;
    let action_raw: String = row.get(3)?;
    let scope_raw: String = row.get(4)?;
    Ok(Pattern {
        id: parse_id(&row.get::<_, String>(0)?, "pattern_id")?,
        kind: parse_enum(&row.get::<_, String>(1)?, "pattern kind", PatternKind::parse)?,
        trigger: serde_json::from_str(&trigger_raw).context("invalid pattern trigger_json")?,
        action: serde_json::from_str(&action_raw).context("invalid pattern action_json")?,
        scope: serde_json::from_str(&scope_raw).context("invalid pattern scope_json")?,
        success_rate: row.get(5)?,
        times_applied: u32::try_from(row.get::<_, i64>(6)?)?,
        times_correct: u32::try_from(row.get::<_, i64>(7)?)?,
        confidence_boost: u8::try_from(row.get::<_, i64>(8)?)?,
        active: sql_to_bool(row.get::<_, i64>(9)?),
        created_at: parse_timestamp(&row.get::<_, String>(10)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(11)?)?,
    })
}

fn parse_id<T>(value: &str, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    T::from_str(value).map_err(|err| anyhow!("invalid {column} ULID: {err}"))
}

fn parse_enum<T>(value: &str, what: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T> {
    parse(value).ok_or_else(|| anyhow!("unknown {what}: {value}"))
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).map_err(|err| anyhow!("invalid decimal amount '{value}': {err}"))
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    Ok(parse_rfc3339_utc(value)?)
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}
