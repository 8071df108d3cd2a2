use std::fmt::{Display, Formatter};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime};

use crate::booking::{self, BookingTotals};
use crate::ids::{
    AccountCode, CorrectionId, CounterpartyId, EntryId, EventId, PatternId, ReviewItemId, TaskId,
    TenantId,
};
use crate::patterns::PatternTrigger;
use crate::LedgerError;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InvoiceReceived,
    InvoiceParsed,
    BookingCompleted,
    CorrectionReceived,
    PeriodClosing,
    BankTransactionImported,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvoiceReceived => "invoice_received",
            Self::InvoiceParsed => "invoice_parsed",
            Self::BookingCompleted => "booking_completed",
            Self::CorrectionReceived => "correction_received",
            Self::PeriodClosing => "period_closing",
            Self::BankTransactionImported => "bank_transaction_imported",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "invoice_received" => Some(Self::InvoiceReceived),
            "invoice_parsed" => Some(Self::InvoiceParsed),
            "booking_completed" => Some(Self::BookingCompleted),
            "correction_received" => Some(Self::CorrectionReceived),
            "period_closing" => Some(Self::PeriodClosing),
            "bank_transaction_imported" => Some(Self::BankTransactionImported),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Unprocessed,
    Processing,
    Processed,
    DeadLettered,
}

impl EventStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unprocessed" => Some(Self::Unprocessed),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    /// Whether the event has left the work queue for good.
    #[must_use]
    pub fn is_processed(self) -> bool {
        matches!(self, Self::Processed | Self::DeadLettered)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub seq: i64,
    pub tenant: TenantId,
    pub kind: EventKind,
    pub payload: Value,
    pub created_at: OffsetDateTime,
    pub status: EventStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    pub tenant: TenantId,
    pub kind: EventKind,
    pub payload: Value,
}

impl NewEvent {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the tenant is blank or the
    /// payload is not a JSON object.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.tenant.as_str().trim().is_empty() {
            return Err(LedgerError::Validation(
                "tenant MUST be provided for every event".to_string(),
            ));
        }
        if !self.payload.is_object() {
            return Err(LedgerError::Validation(
                "event payload MUST be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Bookkeeper,
    Learning,
    InvoiceParser,
}

impl AgentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bookkeeper => "bookkeeper",
            Self::Learning => "learning",
            Self::InvoiceParser => "invoice_parser",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bookkeeper" => Some(Self::Bookkeeper),
            "learning" => Some(Self::Learning),
            "invoice_parser" => Some(Self::InvoiceParser),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Aborted,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub tenant: TenantId,
    pub event_id: Option<EventId>,
    pub agent_kind: AgentKind,
    pub task_kind: String,
    pub payload: Value,
    pub priority: u8,
    pub status: TaskStatus,
    pub note: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub tenant: TenantId,
    pub event_id: Option<EventId>,
    pub agent_kind: AgentKind,
    pub task_kind: String,
    pub payload: Value,
    pub priority: u8,
}

impl NewTask {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when priority is outside `1..=10`
    /// or the task kind is blank.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if !(1..=10).contains(&self.priority) {
            return Err(LedgerError::Validation(
                "task priority MUST be in [1, 10]".to_string(),
            ));
        }
        if self.task_kind.trim().is_empty() {
            return Err(LedgerError::Validation(
                "task_kind MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Documents and bookings
// ---------------------------------------------------------------------------

/// Facts about a parsed source document that the pipeline reasons over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DocumentFacts {
    pub source_reference: String,
    #[serde(default)]
    pub counterparty: Option<CounterpartyId>,
    pub accounting_date: Date,
    pub total_amount: Decimal,
    #[serde(default)]
    pub vat_amount: Option<Decimal>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub payment_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BookingLine {
    pub account: AccountCode,
    #[serde(default)]
    pub debit: Decimal,
    #[serde(default)]
    pub credit: Decimal,
    #[serde(default)]
    pub tax_code: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl BookingLine {
    #[must_use]
    pub fn debit(account: &str, amount: Decimal) -> Self {
        Self {
            account: AccountCode::new(account),
            debit: amount,
            credit: Decimal::ZERO,
            tax_code: None,
            description: String::new(),
        }
    }

    #[must_use]
    pub fn credit(account: &str, amount: Decimal) -> Self {
        Self {
            account: AccountCode::new(account),
            debit: Decimal::ZERO,
            credit: amount,
            tax_code: None,
            description: String::new(),
        }
    }

    #[must_use]
    pub fn with_tax_code(mut self, tax_code: &str) -> Self {
        self.tax_code = Some(tax_code.to_string());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Signed net effect of the line (`debit - credit`).
    #[must_use]
    pub fn net(&self) -> Decimal {
        self.debit - self.credit
    }
}

/// A proposed booking that has not been validated yet. Never persisted as a
/// ledger entry until the booking validator accepts it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateBooking {
    pub lines: Vec<BookingLine>,
    pub confidence: Option<u8>,
    pub reasoning: String,
}

impl CandidateBooking {
    #[must_use]
    pub fn new(lines: Vec<BookingLine>) -> Self {
        Self {
            lines,
            confidence: None,
            reasoning: String::new(),
        }
    }

    #[must_use]
    pub fn totals(&self) -> BookingTotals {
        booking::totals(&self.lines)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Draft,
    Posted,
}

impl EntryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Posted => "posted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "posted" => Some(Self::Posted),
            _ => None,
        }
    }
}

/// Calendar month used for period locking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AccountingPeriod {
    pub year: i32,
    pub month: u8,
}

impl AccountingPeriod {
    #[must_use]
    pub fn new(year: i32, month: u8) -> Self {
        Self { year, month }
    }

    #[must_use]
    pub fn of(date: Date) -> Self {
        Self {
            year: date.year(),
            month: u8::from(date.month()),
        }
    }

    /// Parses `YYYY-MM`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for malformed input.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        let invalid = || LedgerError::Validation(format!("period must be YYYY-MM, got '{value}'"));
        let (year_raw, month_raw) = value.split_once('-').ok_or_else(invalid)?;
        let year: i32 = year_raw.parse().map_err(|_| invalid())?;
        let month: u8 = month_raw.parse().map_err(|_| invalid())?;
        if year_raw.len() != 4 || !(1..=12).contains(&month) {
            return Err(invalid());
        }
        Ok(Self { year, month })
    }
}

impl Display for AccountingPeriod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub tenant: TenantId,
    pub accounting_date: Date,
    pub sequence_number: i64,
    pub lines: Vec<BookingLine>,
    pub status: EntryStatus,
    pub source_reference: String,
    pub counterparty: Option<CounterpartyId>,
    pub payment_reference: Option<String>,
    pub reversal_of: Option<EntryId>,
    pub created_at: OffsetDateTime,
    pub posted_at: Option<OffsetDateTime>,
}

impl LedgerEntry {
    #[must_use]
    pub fn totals(&self) -> BookingTotals {
        booking::totals(&self.lines)
    }

    #[must_use]
    pub fn period(&self) -> AccountingPeriod {
        AccountingPeriod::of(self.accounting_date)
    }

    /// Open-voucher view used by the bank matcher.
    #[must_use]
    pub fn as_match_candidate(&self) -> MatchCandidate {
        let description = self
            .lines
            .iter()
            .map(|line| line.description.trim())
            .find(|text| !text.is_empty())
            .unwrap_or(self.source_reference.as_str())
            .to_string();
        MatchCandidate {
            id: self.id.to_string(),
            number: self.sequence_number.to_string(),
            date: self.accounting_date,
            amount: self.totals().debit,
            description,
            reference: self.payment_reference.clone(),
        }
    }
}

/// Input for a new voucher; the store assigns id, sequence number and status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewLedgerEntry {
    pub tenant: TenantId,
    pub accounting_date: Date,
    pub lines: Vec<BookingLine>,
    pub source_reference: String,
    pub counterparty: Option<CounterpartyId>,
    pub payment_reference: Option<String>,
    pub reversal_of: Option<EntryId>,
}

// ---------------------------------------------------------------------------
// Review queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPriority {
    Medium,
    High,
}

impl ReviewPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Resolved,
}

impl ReviewStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReviewFlag {
    Unbalanced,
    UnparseableSuggestion,
    BankMatch,
}

/// What the reviewer is asked to decide on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReviewSubject {
    Booking {
        document: DocumentFacts,
        proposed_booking: CandidateBooking,
    },
    BankMatch {
        transaction: BankTransaction,
        result: MatchResult,
    },
}

impl ReviewSubject {
    #[must_use]
    pub fn document(&self) -> Option<&DocumentFacts> {
        match self {
            Self::Booking { document, .. } => Some(document),
            Self::BankMatch { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewItem {
    pub id: ReviewItemId,
    pub tenant: TenantId,
    pub source_reference: String,
    pub counterparty: Option<CounterpartyId>,
    pub subject: ReviewSubject,
    pub priority: ReviewPriority,
    pub status: ReviewStatus,
    pub confidence: u8,
    pub reasoning: String,
    pub flags: Vec<ReviewFlag>,
    pub resolution: Option<String>,
    pub created_at: OffsetDateTime,
    pub resolved_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewReviewItem {
    pub tenant: TenantId,
    pub source_reference: String,
    pub counterparty: Option<CounterpartyId>,
    pub subject: ReviewSubject,
    pub priority: ReviewPriority,
    pub confidence: u8,
    pub reasoning: String,
    pub flags: Vec<ReviewFlag>,
}

// ---------------------------------------------------------------------------
// Corrections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Correction {
    pub id: CorrectionId,
    pub tenant: TenantId,
    pub source_reference: String,
    pub counterparty: Option<CounterpartyId>,
    pub description: Option<String>,
    pub document_amount: Option<Decimal>,
    pub accounting_date: Date,
    pub original_booking: Vec<BookingLine>,
    pub corrected_booking: Vec<BookingLine>,
    pub reason: String,
    pub corrected_by: String,
    pub created_at: OffsetDateTime,
    pub learned_at: Option<OffsetDateTime>,
    /// Ledger entry posted for the corrected booking, set at most once.
    pub posted_entry_id: Option<EntryId>,
}

impl Correction {
    /// Amount the corrected booking refers to: the document total when
    /// known, otherwise the corrected booking's debit total.
    #[must_use]
    pub fn reference_amount(&self) -> Decimal {
        self.document_amount
            .unwrap_or_else(|| booking::totals(&self.corrected_booking).debit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NewCorrection {
    pub tenant: TenantId,
    pub source_reference: String,
    #[serde(default)]
    pub counterparty: Option<CounterpartyId>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub document_amount: Option<Decimal>,
    pub accounting_date: Date,
    #[serde(default)]
    pub original_booking: Vec<BookingLine>,
    pub corrected_booking: Vec<BookingLine>,
    pub reason: String,
    pub corrected_by: String,
}

impl NewCorrection {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when required fields are missing.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.source_reference.trim().is_empty() {
            return Err(LedgerError::Validation(
                "source_reference MUST be provided".to_string(),
            ));
        }
        if self.corrected_by.trim().is_empty() {
            return Err(LedgerError::Validation(
                "corrected_by MUST be provided for every correction".to_string(),
            ));
        }
        if self.reason.trim().is_empty() {
            return Err(LedgerError::Validation(
                "reason MUST be provided for every correction".to_string(),
            ));
        }
        if self.corrected_booking.is_empty() {
            return Err(LedgerError::Validation(
                "corrected_booking MUST contain at least one line".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    CounterpartyAccount,
    KeywordAccount,
    Manual,
}

impl PatternKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CounterpartyAccount => "counterparty_account",
            Self::KeywordAccount => "keyword_account",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "counterparty_account" => Some(Self::CounterpartyAccount),
            "keyword_account" => Some(Self::KeywordAccount),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", content = "tenants", rename_all = "snake_case")]
pub enum PatternScope {
    Global,
    Tenants(std::collections::BTreeSet<TenantId>),
}

impl PatternScope {
    #[must_use]
    pub fn tenant(tenant: &TenantId) -> Self {
        Self::Tenants(std::iter::once(tenant.clone()).collect())
    }

    #[must_use]
    pub fn includes(&self, tenant: &TenantId) -> bool {
        match self {
            Self::Global => true,
            Self::Tenants(tenants) => tenants.contains(tenant),
        }
    }
}

/// Effect of a pattern: the accounts a matching document should be booked to.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PatternAction {
    pub accounts: std::collections::BTreeSet<AccountCode>,
    #[serde(default)]
    pub tax_code: Option<String>,
}

impl PatternAction {
    /// Canonical text form used for duplicate detection.
    #[must_use]
    pub fn canonical_key(&self) -> String {
        let accounts: Vec<&str> = self.accounts.iter().map(AccountCode::as_str).collect();
        format!(
            "accounts={};tax={}",
            accounts.join(","),
            self.tax_code.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub id: PatternId,
    pub kind: PatternKind,
    pub trigger: PatternTrigger,
    pub action: PatternAction,
    pub scope: PatternScope,
    pub success_rate: f64,
    pub times_applied: u32,
    pub times_correct: u32,
    pub confidence_boost: u8,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Pattern {
    /// Active, in scope for the tenant, and the trigger predicate holds.
    #[must_use]
    pub fn is_applicable(&self, tenant: &TenantId, document: &DocumentFacts) -> bool {
        self.active && self.scope.includes(tenant) && self.trigger.matches(document)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewPattern {
    pub kind: PatternKind,
    pub trigger: PatternTrigger,
    pub action: PatternAction,
    pub scope: PatternScope,
    pub confidence_boost: u8,
}

// ---------------------------------------------------------------------------
// Bank matching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BankTransaction {
    pub id: String,
    pub date: Date,
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MatchCandidate {
    pub id: String,
    pub number: String,
    pub date: Date,
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchCategory {
    ExactId,
    Reference,
    Amount,
    Combination,
}

impl MatchCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExactId => "exact_id",
            Self::Reference => "reference",
            Self::Amount => "amount",
            Self::Combination => "combination",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact_id" => Some(Self::ExactId),
            "reference" => Some(Self::Reference),
            "amount" => Some(Self::Amount),
            "combination" => Some(Self::Combination),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub bank_transaction_id: String,
    pub matched_voucher_id: Option<String>,
    pub category: MatchCategory,
    pub confidence: u8,
    pub reason: String,
    pub suggested_entries: Vec<MatchCandidate>,
}

impl MatchResult {
    #[must_use]
    pub fn is_match(&self) -> bool {
        self.matched_voucher_id.is_some() && self.confidence > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reconciliation {
    pub tenant: TenantId,
    pub bank_transaction_id: String,
    pub entry_id: EntryId,
    pub category: MatchCategory,
    pub confidence: u8,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::TriggerCondition;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn accounting_period_parses_and_displays() {
        let period = must_ok(AccountingPeriod::parse("2026-03"));
        assert_eq!(period, AccountingPeriod::new(2026, 3));
        assert_eq!(period.to_string(), "2026-03");
        assert!(AccountingPeriod::parse("2026-13").is_err());
        assert!(AccountingPeriod::parse("26-01").is_err());
    }

    #[test]
    fn new_task_rejects_out_of_range_priority() {
        let task = NewTask {
            tenant: TenantId::new("acme"),
            event_id: None,
            agent_kind: AgentKind::Bookkeeper,
            task_kind: "generate_booking".to_string(),
            payload: serde_json::json!({}),
            priority: 11,
        };
        assert!(task.validate().is_err());
    }

    #[test]
    fn pattern_scope_limits_applicability() {
        let now = crate::now_utc();
        let trigger = PatternTrigger::from_conditions([TriggerCondition::Counterparty(
            CounterpartyId::new("vendor-x"),
        )]);
        let pattern = Pattern {
            id: PatternId::new(),
            kind: PatternKind::CounterpartyAccount,
            trigger: must_ok(trigger),
            action: PatternAction {
                accounts: std::iter::once(AccountCode::new("6340")).collect(),
                tax_code: None,
            },
            scope: PatternScope::tenant(&TenantId::new("acme")),
            success_rate: 1.0,
            times_applied: 1,
            times_correct: 1,
            confidence_boost: 15,
            active: true,
            created_at: now,
            updated_at: now,
        };
        let document = DocumentFacts {
            source_reference: "inv-1".to_string(),
            counterparty: Some(CounterpartyId::new("vendor-x")),
            accounting_date: time::macros::date!(2026 - 01 - 15),
            total_amount: Decimal::new(125_000, 2),
            vat_amount: None,
            description: String::new(),
            payment_reference: None,
        };

        assert!(pattern.is_applicable(&TenantId::new("acme"), &document));
        assert!(!pattern.is_applicable(&TenantId::new("other"), &document));

        let mut inactive = pattern;
        inactive.active = false;
        assert!(!inactive.is_applicable(&TenantId::new("acme"), &document));
    }

    #[test]
    fn review_subject_serializes_with_type_tag() {
        let subject = ReviewSubject::BankMatch {
            transaction: BankTransaction {
                id: "tx-1".to_string(),
                date: time::macros::date!(2026 - 01 - 15),
                amount: Decimal::new(100, 0),
                description: String::new(),
                reference: None,
            },
            result: MatchResult {
                bank_transaction_id: "tx-1".to_string(),
                matched_voucher_id: None,
                category: MatchCategory::Combination,
                confidence: 0,
                reason: "no match".to_string(),
                suggested_entries: Vec::new(),
            },
        };
        let value = must_ok(serde_json::to_value(&subject));
        assert_eq!(value["type"], "bank_match");
    }
}
