//! Domain model and pure decision logic for automated bookkeeping.
//!
//! Everything in this crate is free of I/O: the confidence scorer, the bank
//! matcher, pattern trigger evaluation and booking validation all operate on
//! data handed to them. Persistence lives behind the traits in
//! `autoledger-store-core`; orchestration lives in `autoledger-engine`.

pub mod booking;
pub mod ids;
pub mod matching;
pub mod model;
pub mod patterns;
pub mod routing;
pub mod scoring;

use time::{OffsetDateTime, UtcOffset};

pub use booking::{BalanceError, BookingTotals, ChartOfAccounts, ParseError};
pub use ids::{
    AccountCode, CorrectionId, CounterpartyId, EntryId, EventId, PatternId, ReviewItemId, TaskId,
    TenantId,
};
pub use matching::{MatchReport, MatchTolerance};
pub use model::*;
pub use patterns::{PatternTrigger, TriggerCondition, TriggerSpec};
pub use routing::{Route, RoutingThresholds};
pub use scoring::{ConfidenceScore, CounterpartyHistory, ScoreBreakdown, ScoringConfig};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{kind} not found: {id}")]
pub struct NotFoundError {
    pub kind: &'static str,
    pub id: String,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("accounting period {period} is locked for tenant {tenant}")]
pub struct LockedPeriodError {
    pub tenant: TenantId,
    pub period: AccountingPeriod,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum LedgerError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    LockedPeriod(#[from] LockedPeriodError),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format timestamp: {err}")))
}

/// Parses an ISO `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for malformed dates.
pub fn parse_date(value: &str) -> Result<time::Date, LedgerError> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    time::Date::parse(value, format)
        .map_err(|err| LedgerError::Validation(format!("invalid date '{value}': {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_date(value: time::Date) -> Result<String, LedgerError> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    value
        .format(format)
        .map_err(|err| LedgerError::Validation(format!("failed to format date: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
