//! Balance arithmetic, strict suggestion parsing and booking construction.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::AccountCode;
use crate::model::{BookingLine, CandidateBooking, DocumentFacts};

/// Largest tolerated gap between debit and credit totals (one hundredth).
pub const EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Confidence given to the deterministic fallback booking.
pub const FALLBACK_CONFIDENCE: u8 = 30;

/// Ceiling for the confidence of a booking that does not balance.
pub const UNBALANCED_CONFIDENCE_CAP: u8 = 40;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct BookingTotals {
    pub debit: Decimal,
    pub credit: Decimal,
}

impl BookingTotals {
    #[must_use]
    pub fn difference(&self) -> Decimal {
        (self.debit - self.credit).abs()
    }

    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.difference() <= EPSILON
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("booking does not balance: debit {debit}, credit {credit}, difference {difference}")]
pub struct BalanceError {
    pub debit: Decimal,
    pub credit: Decimal,
    pub difference: Decimal,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("unreadable booking suggestion: {message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[must_use]
pub fn totals(lines: &[BookingLine]) -> BookingTotals {
    lines.iter().fold(
        BookingTotals {
            debit: Decimal::ZERO,
            credit: Decimal::ZERO,
        },
        |acc, line| BookingTotals {
            debit: acc.debit + line.debit,
            credit: acc.credit + line.credit,
        },
    )
}

/// # Errors
/// Returns [`BalanceError`] when `|Σdebit − Σcredit|` exceeds [`EPSILON`].
pub fn check_balance(lines: &[BookingLine]) -> Result<BookingTotals, BalanceError> {
    let totals = totals(lines);
    if totals.is_balanced() {
        Ok(totals)
    } else {
        Err(BalanceError {
            debit: totals.debit,
            credit: totals.credit,
            difference: totals.difference(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SuggestionDocument {
    lines: Vec<BookingLine>,
    #[serde(default)]
    confidence: Option<u8>,
    #[serde(default)]
    reasoning: String,
}

/// Parses a generated booking suggestion from JSON text.
///
/// # Errors
/// Returns [`ParseError`] when the text is not a well-formed suggestion.
pub fn parse_suggestion(raw: &str) -> Result<CandidateBooking, ParseError> {
    let document: SuggestionDocument =
        serde_json::from_str(raw.trim()).map_err(|err| ParseError::new(err.to_string()))?;
    finish_suggestion(document)
}

/// Parses a suggestion that arrives either as an embedded object or as JSON
/// text inside a string value.
///
/// # Errors
/// Returns [`ParseError`] when the value is not a well-formed suggestion.
pub fn parse_suggestion_value(value: &Value) -> Result<CandidateBooking, ParseError> {
    match value {
        Value::String(raw) => parse_suggestion(raw),
        Value::Object(_) => {
            let document: SuggestionDocument = serde_json::from_value(value.clone())
                .map_err(|err| ParseError::new(err.to_string()))?;
            finish_suggestion(document)
        }
        Value::Null => Err(ParseError::new("suggestion is missing")),
        _ => Err(ParseError::new("suggestion must be an object or JSON text")),
    }
}

fn finish_suggestion(document: SuggestionDocument) -> Result<CandidateBooking, ParseError> {
    if document.lines.is_empty() {
        return Err(ParseError::new("suggestion has no lines"));
    }
    for (index, line) in document.lines.iter().enumerate() {
        if line.account.as_str().trim().is_empty() {
            return Err(ParseError::new(format!("line {index} has no account")));
        }
        if line.debit.is_sign_negative() || line.credit.is_sign_negative() {
            return Err(ParseError::new(format!("line {index} has a negative amount")));
        }
        if line.debit.is_zero() == line.credit.is_zero() {
            return Err(ParseError::new(format!(
                "line {index} must carry exactly one of debit or credit"
            )));
        }
    }
    if document.confidence.is_some_and(|value| value > 100) {
        return Err(ParseError::new("confidence must be within 0..=100"));
    }

    Ok(CandidateBooking {
        lines: document.lines,
        confidence: document.confidence,
        reasoning: document.reasoning,
    })
}

/// Opaque chart-of-accounts facts the pipeline needs to classify lines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ChartOfAccounts {
    pub liability_prefixes: Vec<String>,
    pub tax_prefixes: Vec<String>,
    pub fallback_expense_account: AccountCode,
    pub input_vat_account: AccountCode,
    pub payable_account: AccountCode,
}

impl Default for ChartOfAccounts {
    fn default() -> Self {
        Self {
            liability_prefixes: vec!["2".to_string()],
            tax_prefixes: vec!["27".to_string()],
            fallback_expense_account: AccountCode::new("7790"),
            input_vat_account: AccountCode::new("2710"),
            payable_account: AccountCode::new("2400"),
        }
    }
}

impl ChartOfAccounts {
    #[must_use]
    pub fn is_liability(&self, account: &AccountCode) -> bool {
        account.has_any_prefix(&self.liability_prefixes)
    }

    #[must_use]
    pub fn is_tax(&self, account: &AccountCode) -> bool {
        account.has_any_prefix(&self.tax_prefixes)
    }

    /// Expense-side accounts: neither liability nor tax.
    pub fn non_liability_accounts<'a>(
        &'a self,
        lines: &'a [BookingLine],
    ) -> impl Iterator<Item = &'a AccountCode> + 'a {
        lines
            .iter()
            .map(|line| &line.account)
            .filter(|account| !self.is_liability(account) && !self.is_tax(account))
    }
}

/// Deterministic low-confidence booking used when a suggestion is unreadable:
/// net amount to the fallback expense account, VAT to input VAT, gross to
/// accounts payable.
#[must_use]
pub fn fallback_booking(document: &DocumentFacts, chart: &ChartOfAccounts) -> CandidateBooking {
    let gross = document.total_amount.abs();
    let vat = document.vat_amount.unwrap_or(Decimal::ZERO).abs();
    let net = gross - vat;

    let mut lines = vec![BookingLine::debit(
        chart.fallback_expense_account.as_str(),
        net,
    )
    .with_description(&document.description)];
    if !vat.is_zero() {
        lines.push(BookingLine::debit(chart.input_vat_account.as_str(), vat));
    }
    lines.push(BookingLine::credit(chart.payable_account.as_str(), gross));

    CandidateBooking {
        lines,
        confidence: Some(FALLBACK_CONFIDENCE),
        reasoning: "suggestion could not be parsed; fallback booking to suspense expense"
            .to_string(),
    }
}

fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Scales every amount by `ratio`, rounded to cents. Any rounding residue is
/// moved onto the largest line of the smaller side so a balanced input stays
/// balanced.
#[must_use]
pub fn scale_booking(lines: &[BookingLine], ratio: Decimal) -> Vec<BookingLine> {
    let mut scaled: Vec<BookingLine> = lines
        .iter()
        .map(|line| BookingLine {
            debit: round_cents(line.debit * ratio),
            credit: round_cents(line.credit * ratio),
            ..line.clone()
        })
        .collect();

    let totals = totals(&scaled);
    let residue = totals.debit - totals.credit;
    if residue.is_zero() {
        return scaled;
    }

    if residue.is_sign_positive() {
        if let Some(line) = scaled
            .iter_mut()
            .filter(|line| line.debit.is_zero())
            .max_by(|a, b| a.credit.cmp(&b.credit))
        {
            line.credit += residue;
        }
    } else if let Some(line) = scaled
        .iter_mut()
        .filter(|line| line.credit.is_zero())
        .max_by(|a, b| a.debit.cmp(&b.debit))
    {
        line.debit -= residue;
    }
    scaled
}
