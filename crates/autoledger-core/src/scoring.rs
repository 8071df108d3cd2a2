//! Multi-factor confidence scoring for candidate bookings.
//!
//! The scorer is a pure function: counterparty history and applicable
//! patterns are loaded by the caller and handed in as data.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::booking::{self, ChartOfAccounts, EPSILON};
use crate::ids::AccountCode;
use crate::model::{CandidateBooking, DocumentFacts, Pattern};
use crate::LedgerError;

pub const MAX_SCORE: u8 = 100;
pub const BOOSTED_SCORE_CAP: u8 = 99;
/// Number of recent posted entries considered for historical similarity.
pub const HISTORY_WINDOW: usize = 10;

const VENDOR_FAMILIARITY_MAX: u8 = 30;
const HISTORICAL_SIMILARITY_MAX: u64 = 30;
const TAX_AMOUNT_POINTS: u8 = 8;
const TAX_CODE_ALL_POINTS: u8 = 4;
const TAX_CODE_SOME_POINTS: u8 = 2;
const TAX_LINE_EXACT_POINTS: u8 = 8;
const TAX_LINE_MISMATCH_POINTS: u8 = 4;
const PATTERN_EXACT_POINTS: u8 = 15;
const PATTERN_PARTIAL_POINTS: u8 = 8;
const AMOUNT_NORMAL_POINTS: u8 = 5;
const AMOUNT_MEDIUM_POINTS: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    pub normal_amount_threshold: Decimal,
    pub large_amount_threshold: Decimal,
    /// Patterns must exceed this success rate to boost a score.
    pub boost_min_success_rate: f64,
    pub chart: ChartOfAccounts,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            normal_amount_threshold: Decimal::new(10_000, 0),
            large_amount_threshold: Decimal::new(100_000, 0),
            boost_min_success_rate: 0.9,
            chart: ChartOfAccounts::default(),
        }
    }
}

impl ScoringConfig {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when thresholds are out of order
    /// or the boost rate is outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.normal_amount_threshold <= Decimal::ZERO
            || self.large_amount_threshold <= self.normal_amount_threshold
        {
            return Err(LedgerError::Configuration(
                "amount thresholds MUST satisfy 0 < normal < large".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.boost_min_success_rate) {
            return Err(LedgerError::Configuration(
                "boost_min_success_rate MUST be in [0, 1]".to_string(),
            ));
        }
        if self.chart.liability_prefixes.is_empty() {
            return Err(LedgerError::Configuration(
                "chart.liability_prefixes MUST NOT be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the ledger already knows about a counterparty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CounterpartyHistory {
    /// Posted entries with this counterparty in the trailing twelve months.
    pub postings_last_12_months: u32,
    /// Account sets of the most recent posted entries, newest first.
    pub recent_account_sets: Vec<BTreeSet<AccountCode>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub vendor_familiarity: u8,
    pub historical_similarity: u8,
    pub tax_consistency: u8,
    pub pattern_match: u8,
    pub amount_plausibility: u8,
    pub pattern_boost: u8,
}

impl ScoreBreakdown {
    #[must_use]
    pub fn subtotal(&self) -> u8 {
        let sum = u16::from(self.vendor_familiarity)
            + u16::from(self.historical_similarity)
            + u16::from(self.tax_consistency)
            + u16::from(self.pattern_match)
            + u16::from(self.amount_plausibility);
        u8::try_from(sum.min(u16::from(MAX_SCORE))).unwrap_or(MAX_SCORE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfidenceScore {
    pub score: u8,
    pub breakdown: ScoreBreakdown,
    pub reason_codes: Vec<String>,
}

impl ConfidenceScore {
    /// Lowers the score to `cap` and records why.
    #[must_use]
    pub fn capped(mut self, cap: u8, reason: &str) -> Self {
        if self.score > cap {
            self.score = cap;
        }
        self.reason_codes.push(reason.to_string());
        self
    }
}

#[must_use]
pub fn vendor_familiarity(postings: u32) -> u8 {
    match postings {
        21.. => VENDOR_FAMILIARITY_MAX,
        10..=20 => 20,
        3..=9 => 10,
        1..=2 => 5,
        0 => 0,
    }
}

/// `round(30 × |P ∩ H| / |P|)`, zero when either set is empty.
#[must_use]
pub fn historical_similarity(
    proposed: &BTreeSet<AccountCode>,
    history: &CounterpartyHistory,
) -> u8 {
    let known: BTreeSet<&AccountCode> = history
        .recent_account_sets
        .iter()
        .take(HISTORY_WINDOW)
        .flatten()
        .collect();
    if proposed.is_empty() || known.is_empty() {
        return 0;
    }
    let overlap = proposed.iter().filter(|code| known.contains(code)).count() as u64;
    let total = proposed.len() as u64;
    let rounded = (2 * HISTORICAL_SIMILARITY_MAX * overlap + total) / (2 * total);
    u8::try_from(rounded).unwrap_or(u8::MAX)
}

#[must_use]
pub fn tax_consistency(
    booking: &CandidateBooking,
    document: &DocumentFacts,
    chart: &ChartOfAccounts,
) -> u8 {
    let mut points = 0;

    let totals = booking::totals(&booking.lines);
    if (totals.debit - document.total_amount.abs()).abs() <= EPSILON {
        points += TAX_AMOUNT_POINTS;
    }

    let expense_lines: Vec<_> = booking
        .lines
        .iter()
        .filter(|line| !chart.is_tax(&line.account) && !chart.is_liability(&line.account))
        .collect();
    let coded = expense_lines
        .iter()
        .filter(|line| line.tax_code.as_deref().is_some_and(|code| !code.trim().is_empty()))
        .count();
    if !expense_lines.is_empty() && coded == expense_lines.len() {
        points += TAX_CODE_ALL_POINTS;
    } else if coded > 0 {
        points += TAX_CODE_SOME_POINTS;
    }

    let tax_lines: Vec<_> = booking
        .lines
        .iter()
        .filter(|line| chart.is_tax(&line.account))
        .collect();
    let booked_vat: Decimal = tax_lines.iter().map(|line| line.net().abs()).sum();
    match document.vat_amount.filter(|vat| !vat.is_zero()) {
        Some(vat) if !tax_lines.is_empty() => {
            if (booked_vat - vat.abs()).abs() <= EPSILON {
                points += TAX_LINE_EXACT_POINTS;
            } else {
                points += TAX_LINE_MISMATCH_POINTS;
            }
        }
        Some(_) => {}
        None => {
            if tax_lines.is_empty() {
                points += TAX_LINE_EXACT_POINTS;
            }
        }
    }

    points
}

/// Best match over the supplied patterns against the booking's expense-side
/// account set.
#[must_use]
pub fn pattern_match(
    booking: &CandidateBooking,
    patterns: &[&Pattern],
    chart: &ChartOfAccounts,
) -> u8 {
    let accounts: BTreeSet<&AccountCode> = chart.non_liability_accounts(&booking.lines).collect();
    if accounts.is_empty() {
        return 0;
    }
    patterns
        .iter()
        .map(|pattern| {
            let action: BTreeSet<&AccountCode> = pattern.action.accounts.iter().collect();
            if action == accounts {
                PATTERN_EXACT_POINTS
            } else if action.intersection(&accounts).next().is_some() {
                PATTERN_PARTIAL_POINTS
            } else {
                0
            }
        })
        .max()
        .unwrap_or(0)
}

#[must_use]
pub fn amount_plausibility(gross: Decimal, config: &ScoringConfig) -> u8 {
    let gross = gross.abs();
    if gross < config.normal_amount_threshold {
        AMOUNT_NORMAL_POINTS
    } else if gross < config.large_amount_threshold {
        AMOUNT_MEDIUM_POINTS
    } else {
        0
    }
}

/// Highest boost among patterns whose success rate clears the configured
/// minimum.
#[must_use]
pub fn pattern_boost(patterns: &[&Pattern], config: &ScoringConfig) -> u8 {
    patterns
        .iter()
        .filter(|pattern| pattern.success_rate > config.boost_min_success_rate)
        .map(|pattern| pattern.confidence_boost)
        .max()
        .unwrap_or(0)
}

/// Scores a candidate booking. `patterns` must already be filtered to those
/// applicable to the document's tenant.
#[must_use]
pub fn score_booking(
    booking: &CandidateBooking,
    document: &DocumentFacts,
    history: &CounterpartyHistory,
    patterns: &[&Pattern],
    config: &ScoringConfig,
) -> ConfidenceScore {
    let proposed: BTreeSet<AccountCode> =
        booking.lines.iter().map(|line| line.account.clone()).collect();

    let mut breakdown = ScoreBreakdown {
        vendor_familiarity: vendor_familiarity(history.postings_last_12_months),
        historical_similarity: historical_similarity(&proposed, history),
        tax_consistency: tax_consistency(booking, document, &config.chart),
        pattern_match: pattern_match(booking, patterns, &config.chart),
        amount_plausibility: amount_plausibility(document.total_amount, config),
        pattern_boost: 0,
    };

    let mut reason_codes = Vec::new();
    let push_if = |codes: &mut Vec<String>, points: u8, code: &str| {
        if points > 0 {
            codes.push(format!("{code}:{points}"));
        }
    };
    push_if(&mut reason_codes, breakdown.vendor_familiarity, "vendor_familiarity");
    push_if(&mut reason_codes, breakdown.historical_similarity, "historical_similarity");
    push_if(&mut reason_codes, breakdown.tax_consistency, "tax_consistency");
    push_if(&mut reason_codes, breakdown.pattern_match, "pattern_match");
    push_if(&mut reason_codes, breakdown.amount_plausibility, "amount_plausibility");

    let subtotal = breakdown.subtotal();
    let boost = pattern_boost(patterns, config);
    let score = if boost > 0 {
        let boosted = subtotal.saturating_add(boost).min(BOOSTED_SCORE_CAP);
        let score = subtotal.max(boosted);
        breakdown.pattern_boost = score - subtotal;
        push_if(&mut reason_codes, breakdown.pattern_boost, "pattern_boost");
        score
    } else {
        subtotal
    };

    ConfidenceScore {
        score,
        breakdown,
        reason_codes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CounterpartyId, PatternId, TenantId};
    use crate::model::{BookingLine, PatternAction, PatternKind, PatternScope};
    use crate::patterns::PatternTrigger;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn amount(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    fn accounts(codes: &[&str]) -> BTreeSet<AccountCode> {
        codes.iter().map(|code| AccountCode::new(*code)).collect()
    }

    fn fixture_document() -> DocumentFacts {
        DocumentFacts {
            source_reference: "inv-1250".to_string(),
            counterparty: Some(CounterpartyId::new("vendor-x")),
            accounting_date: time::macros::date!(2026 - 01 - 15),
            total_amount: amount(125_000),
            vat_amount: Some(amount(25_000)),
            description: "Office supplies".to_string(),
            payment_reference: None,
        }
    }

    fn fixture_booking(with_tax_code: bool) -> CandidateBooking {
        let expense = BookingLine::debit("6300", amount(100_000));
        let expense = if with_tax_code {
            expense.with_tax_code("1")
        } else {
            expense
        };
        CandidateBooking::new(vec![
            expense,
            BookingLine::debit("2740", amount(25_000)),
            BookingLine::credit("2400", amount(125_000)),
        ])
    }

    fn fixture_pattern(codes: &[&str], success_rate: f64, boost: u8) -> Pattern {
        let now = crate::now_utc();
        Pattern {
            id: PatternId::new(),
            kind: PatternKind::CounterpartyAccount,
            trigger: must_ok(PatternTrigger::counterparty(CounterpartyId::new("vendor-x"))),
            action: PatternAction {
                accounts: accounts(codes),
                tax_code: None,
            },
            scope: PatternScope::tenant(&TenantId::new("acme")),
            success_rate,
            times_applied: 10,
            times_correct: 10,
            confidence_boost: boost,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn vendor_familiarity_buckets() {
        assert_eq!(vendor_familiarity(0), 0);
        assert_eq!(vendor_familiarity(2), 5);
        assert_eq!(vendor_familiarity(3), 10);
        assert_eq!(vendor_familiarity(9), 10);
        assert_eq!(vendor_familiarity(10), 20);
        assert_eq!(vendor_familiarity(20), 20);
        assert_eq!(vendor_familiarity(21), 30);
    }

    #[test]
    fn historical_similarity_rounds_overlap_fraction() {
        let history = CounterpartyHistory {
            postings_last_12_months: 4,
            recent_account_sets: vec![accounts(&["6300", "2400"])],
        };
        assert_eq!(
            historical_similarity(&accounts(&["6300", "2740", "2400"]), &history),
            20
        );
        assert_eq!(historical_similarity(&accounts(&["6300"]), &history), 30);
        assert_eq!(
            historical_similarity(&accounts(&["6300"]), &CounterpartyHistory::default()),
            0
        );
    }

    #[test]
    fn historical_similarity_only_reads_last_ten_entries() {
        let mut sets = vec![accounts(&["6300"]); HISTORY_WINDOW];
        sets.push(accounts(&["6340"]));
        let history = CounterpartyHistory {
            postings_last_12_months: 11,
            recent_account_sets: sets,
        };
        assert_eq!(historical_similarity(&accounts(&["6340"]), &history), 0);
    }

    #[test]
    fn tax_consistency_rewards_matching_vat_and_codes() {
        let chart = ChartOfAccounts::default();
        let document = fixture_document();
        assert_eq!(tax_consistency(&fixture_booking(true), &document, &chart), 20);
        assert_eq!(tax_consistency(&fixture_booking(false), &document, &chart), 16);

        let mut wrong_vat = fixture_booking(true);
        wrong_vat.lines[1].debit = amount(20_000);
        // debit total no longer matches the gross total either
        assert_eq!(tax_consistency(&wrong_vat, &document, &chart), 8);
    }

    #[test]
    fn tax_consistency_without_document_vat_prefers_no_vat_line() {
        let chart = ChartOfAccounts::default();
        let mut document = fixture_document();
        document.vat_amount = None;
        document.total_amount = amount(100_000);
        let booking = CandidateBooking::new(vec![
            BookingLine::debit("6300", amount(100_000)),
            BookingLine::credit("2400", amount(100_000)),
        ]);
        assert_eq!(tax_consistency(&booking, &document, &chart), 16);
    }

    #[test]
    fn pattern_match_distinguishes_exact_and_partial() {
        let chart = ChartOfAccounts::default();
        let booking = fixture_booking(false);
        let exact = fixture_pattern(&["6300"], 1.0, 15);
        let partial = fixture_pattern(&["6300", "6340"], 1.0, 15);
        let unrelated = fixture_pattern(&["7000"], 1.0, 15);
        assert_eq!(pattern_match(&booking, &[&exact], &chart), 15);
        assert_eq!(pattern_match(&booking, &[&partial], &chart), 8);
        assert_eq!(pattern_match(&booking, &[&unrelated], &chart), 0);
        assert_eq!(pattern_match(&booking, &[&unrelated, &partial], &chart), 8);
    }

    #[test]
    fn first_time_vendor_scores_low() {
        let score = score_booking(
            &fixture_booking(false),
            &fixture_document(),
            &CounterpartyHistory::default(),
            &[],
            &ScoringConfig::default(),
        );
        assert_eq!(score.breakdown.tax_consistency, 16);
        assert_eq!(score.breakdown.amount_plausibility, 5);
        assert_eq!(score.score, 21);
    }

    #[test]
    fn familiar_vendor_with_reliable_pattern_is_boosted_but_capped() {
        let history = CounterpartyHistory {
            postings_last_12_months: 25,
            recent_account_sets: vec![accounts(&["6300", "2740", "2400"])],
        };
        let pattern = fixture_pattern(&["6300"], 0.95, 15);
        let score = score_booking(
            &fixture_booking(false),
            &fixture_document(),
            &history,
            &[&pattern],
            &ScoringConfig::default(),
        );
        // 30 + 30 + 16 + 15 + 5 = 96, boost capped at 99
        assert_eq!(score.score, 99);
        assert_eq!(score.breakdown.pattern_boost, 3);
    }

    #[test]
    fn boost_never_lowers_a_full_score() {
        let history = CounterpartyHistory {
            postings_last_12_months: 25,
            recent_account_sets: vec![accounts(&["6300", "2740", "2400"])],
        };
        let pattern = fixture_pattern(&["6300"], 1.0, 15);
        let score = score_booking(
            &fixture_booking(true),
            &fixture_document(),
            &history,
            &[&pattern],
            &ScoringConfig::default(),
        );
        assert_eq!(score.score, 100);
        assert_eq!(score.breakdown.pattern_boost, 0);
    }

    #[test]
    fn unreliable_pattern_does_not_boost() {
        let pattern = fixture_pattern(&["6300"], 0.9, 15);
        let score = score_booking(
            &fixture_booking(false),
            &fixture_document(),
            &CounterpartyHistory::default(),
            &[&pattern],
            &ScoringConfig::default(),
        );
        assert_eq!(score.breakdown.pattern_boost, 0);
        assert_eq!(score.score, 36);
    }

    #[test]
    fn capping_records_reason() {
        let score = ConfidenceScore {
            score: 90,
            breakdown: ScoreBreakdown::default(),
            reason_codes: Vec::new(),
        }
        .capped(40, "unbalanced");
        assert_eq!(score.score, 40);
        assert_eq!(score.reason_codes, vec!["unbalanced".to_string()]);
    }

    #[test]
    fn config_validation_rejects_inverted_thresholds() {
        let config = ScoringConfig {
            normal_amount_threshold: Decimal::new(100, 0),
            large_amount_threshold: Decimal::new(50, 0),
            ..ScoringConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ScoringConfig::default().validate().is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn score_is_bounded_and_deterministic(
            postings in 0_u32..60,
            net_cents in 1_i64..50_000_000,
            vat_cents in 0_i64..5_000_000,
            history_len in 0_usize..15,
            success_rate in 0.0_f64..=1.0,
            boost in 0_u8..=60,
        ) {
            let document = DocumentFacts {
                total_amount: amount(net_cents + vat_cents),
                vat_amount: Some(amount(vat_cents)),
                ..fixture_document()
            };
            let booking = CandidateBooking::new(vec![
                BookingLine::debit("6300", amount(net_cents)),
                BookingLine::debit("2710", amount(vat_cents)),
                BookingLine::credit("2400", amount(net_cents + vat_cents)),
            ]);
            let history = CounterpartyHistory {
                postings_last_12_months: postings,
                recent_account_sets: vec![accounts(&["6300", "2400"]); history_len],
            };
            let pattern = fixture_pattern(&["6300"], success_rate, boost);
            let config = ScoringConfig::default();

            let first = score_booking(&booking, &document, &history, &[&pattern], &config);
            let second = score_booking(&booking, &document, &history, &[&pattern], &config);
            prop_assert!(first.score <= MAX_SCORE);
            prop_assert!(first.score >= first.breakdown.subtotal());
            prop_assert_eq!(first, second);
        }
    }
}
