//! Bank transaction to voucher matching.
//!
//! Four independent strategies in fixed priority order: payment identifier
//! (KID), voucher reference number, amount within a date window, and a
//! weighted combination. Every strategy returns a zero-confidence result
//! instead of failing when nothing matches.

use std::cmp::Ordering;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::model::{BankTransaction, MatchCandidate, MatchCategory, MatchResult};
use crate::LedgerError;

pub const EXACT_ID_CONFIDENCE: u8 = 100;
pub const REFERENCE_CONFIDENCE: u8 = 95;
pub const AMOUNT_DATE_BASE_CONFIDENCE: u8 = 90;
const AMOUNT_DATE_MAX_PENALTY: u32 = 10;
const AMOUNT_DATE_PENALTY_PER_DAY: u32 = 3;

/// `auto_match` stops at the first strategy reaching its threshold.
pub const AUTO_EXACT_ID_THRESHOLD: u8 = 100;
pub const AUTO_REFERENCE_THRESHOLD: u8 = 95;
pub const AUTO_AMOUNT_DATE_THRESHOLD: u8 = 80;

const KID_MIN_DIGITS: usize = 2;
const KID_MAX_DIGITS: usize = 25;
const REFERENCE_MIN_DIGITS: usize = 4;
const REFERENCE_MAX_DIGITS: usize = 10;

const WEIGHT_AMOUNT: f64 = 40.0;
const WEIGHT_DESCRIPTION: f64 = 30.0;
const WEIGHT_DATE: f64 = 20.0;
const WEIGHT_COUNTERPARTY: f64 = 10.0;
const AMOUNT_FALLOFF: f64 = 100.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MatchTolerance {
    /// Allowed absolute difference between amounts.
    pub amount: Decimal,
    pub date_window_days: u32,
    pub combination_window_days: u32,
    pub combination_min_score: u8,
}

impl Default for MatchTolerance {
    fn default() -> Self {
        Self {
            amount: Decimal::ONE,
            date_window_days: 3,
            combination_window_days: 7,
            combination_min_score: 60,
        }
    }
}

impl MatchTolerance {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] for negative tolerances, an empty
    /// combination window, or a minimum score above 100.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount.is_sign_negative() {
            return Err(LedgerError::Configuration(
                "matching.amount MUST NOT be negative".to_string(),
            ));
        }
        if self.combination_window_days == 0 {
            return Err(LedgerError::Configuration(
                "matching.combination_window_days MUST be positive".to_string(),
            ));
        }
        if self.combination_min_score > 100 {
            return Err(LedgerError::Configuration(
                "matching.combination_min_score MUST be in [0, 100]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Every strategy's result plus the overall best one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchReport {
    pub results: Vec<MatchResult>,
    pub best: MatchResult,
}

fn amount_difference(left: Decimal, right: Decimal) -> Decimal {
    (left.abs() - right.abs()).abs()
}

fn day_difference(left: Date, right: Date) -> u32 {
    u32::try_from((left - right).whole_days().unsigned_abs()).unwrap_or(u32::MAX)
}

fn digits_only(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

fn digit_runs(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
}

fn trim_leading_zeros(value: &str) -> &str {
    let trimmed = value.trim_start_matches('0');
    if trimmed.is_empty() && !value.is_empty() {
        "0"
    } else {
        trimmed
    }
}

/// Payment identifier of a transaction: its reference digits when present,
/// otherwise the longest 2-25 digit run in the description.
#[must_use]
pub fn extract_identifier(transaction: &BankTransaction) -> Option<String> {
    if let Some(reference) = &transaction.reference {
        let digits = digits_only(reference);
        if !digits.is_empty() {
            return Some(digits);
        }
    }
    digit_runs(&transaction.description)
        .filter(|run| (KID_MIN_DIGITS..=KID_MAX_DIGITS).contains(&run.len()))
        .fold(None::<&str>, |longest, run| match longest {
            Some(current) if current.len() >= run.len() => Some(current),
            _ => Some(run),
        })
        .map(str::to_string)
}

fn no_match(transaction: &BankTransaction, category: MatchCategory, reason: &str) -> MatchResult {
    MatchResult {
        bank_transaction_id: transaction.id.clone(),
        matched_voucher_id: None,
        category,
        confidence: 0,
        reason: reason.to_string(),
        suggested_entries: Vec::new(),
    }
}

fn matched(
    transaction: &BankTransaction,
    category: MatchCategory,
    confidence: u8,
    candidate: &MatchCandidate,
    reason: String,
) -> MatchResult {
    MatchResult {
        bank_transaction_id: transaction.id.clone(),
        matched_voucher_id: Some(candidate.id.clone()),
        category,
        confidence,
        reason,
        suggested_entries: vec![candidate.clone()],
    }
}

/// Strategy 1: identifier equality plus amount tolerance gives 100.
#[must_use]
pub fn match_exact_id(
    transaction: &BankTransaction,
    candidates: &[MatchCandidate],
    tolerance: &MatchTolerance,
) -> MatchResult {
    let Some(identifier) = extract_identifier(transaction) else {
        return no_match(
            transaction,
            MatchCategory::ExactId,
            "no payment identifier on transaction",
        );
    };

    let best = candidates
        .iter()
        .filter(|candidate| {
            candidate
                .reference
                .as_deref()
                .is_some_and(|reference| digits_only(reference) == identifier)
        })
        .map(|candidate| (amount_difference(transaction.amount, candidate.amount), candidate))
        .filter(|(diff, _)| *diff <= tolerance.amount)
        .min_by(|left, right| left.0.cmp(&right.0));

    match best {
        Some((_, candidate)) => matched(
            transaction,
            MatchCategory::ExactId,
            EXACT_ID_CONFIDENCE,
            candidate,
            format!(
                "payment identifier {identifier} matches voucher {}",
                candidate.number
            ),
        ),
        None => no_match(
            transaction,
            MatchCategory::ExactId,
            "no voucher carries the payment identifier within amount tolerance",
        ),
    }
}

/// Strategy 2: a 4-10 digit token in the description equals a voucher number.
#[must_use]
pub fn match_reference(
    transaction: &BankTransaction,
    candidates: &[MatchCandidate],
    tolerance: &MatchTolerance,
) -> MatchResult {
    let tokens: Vec<&str> = digit_runs(&transaction.description)
        .filter(|run| (REFERENCE_MIN_DIGITS..=REFERENCE_MAX_DIGITS).contains(&run.len()))
        .map(trim_leading_zeros)
        .collect();
    if tokens.is_empty() {
        return no_match(
            transaction,
            MatchCategory::Reference,
            "no reference number in description",
        );
    }

    let best = candidates
        .iter()
        .filter(|candidate| {
            let number = digits_only(&candidate.number);
            !number.is_empty() && tokens.contains(&trim_leading_zeros(&number))
        })
        .map(|candidate| (amount_difference(transaction.amount, candidate.amount), candidate))
        .filter(|(diff, _)| *diff <= tolerance.amount)
        .min_by(|left, right| left.0.cmp(&right.0));

    match best {
        Some((_, candidate)) => matched(
            transaction,
            MatchCategory::Reference,
            REFERENCE_CONFIDENCE,
            candidate,
            format!("description references voucher {}", candidate.number),
        ),
        None => no_match(
            transaction,
            MatchCategory::Reference,
            "no voucher number referenced within amount tolerance",
        ),
    }
}

fn amount_date_confidence(days: u32) -> u8 {
    let penalty = (AMOUNT_DATE_PENALTY_PER_DAY.saturating_mul(days)).min(AMOUNT_DATE_MAX_PENALTY);
    AMOUNT_DATE_BASE_CONFIDENCE.saturating_sub(u8::try_from(penalty).unwrap_or(u8::MAX))
}

/// Strategy 3: amount within tolerance and date inside the window. Closest
/// date wins, then closest amount.
#[must_use]
pub fn match_amount_date(
    transaction: &BankTransaction,
    candidates: &[MatchCandidate],
    tolerance: &MatchTolerance,
) -> MatchResult {
    let best = candidates
        .iter()
        .map(|candidate| {
            (
                day_difference(transaction.date, candidate.date),
                amount_difference(transaction.amount, candidate.amount),
                candidate,
            )
        })
        .filter(|(days, diff, _)| *days <= tolerance.date_window_days && *diff <= tolerance.amount)
        .min_by(|left, right| left.0.cmp(&right.0).then_with(|| left.1.cmp(&right.1)));

    match best {
        Some((days, _, candidate)) => matched(
            transaction,
            MatchCategory::Amount,
            amount_date_confidence(days),
            candidate,
            format!(
                "amount matches voucher {} with {days} day(s) date difference",
                candidate.number
            ),
        ),
        None => no_match(
            transaction,
            MatchCategory::Amount,
            "no voucher within amount and date tolerance",
        ),
    }
}

/// Weighted 0-100 similarity between a transaction and one candidate.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn combination_score(
    transaction: &BankTransaction,
    candidate: &MatchCandidate,
    tolerance: &MatchTolerance,
) -> u8 {
    let diff = amount_difference(transaction.amount, candidate.amount)
        .to_f64()
        .unwrap_or(f64::MAX);
    let amount_similarity = (1.0 - diff / AMOUNT_FALLOFF).max(0.0);

    let description_similarity = strsim::normalized_levenshtein(
        &transaction.description.to_lowercase(),
        &candidate.description.to_lowercase(),
    );

    let days = day_difference(transaction.date, candidate.date);
    let date_similarity = if days <= tolerance.combination_window_days {
        1.0 - f64::from(days) / f64::from(tolerance.combination_window_days)
    } else {
        0.0
    };

    let score = WEIGHT_AMOUNT * amount_similarity
        + WEIGHT_DESCRIPTION * description_similarity
        + WEIGHT_DATE * date_similarity
        + WEIGHT_COUNTERPARTY;
    score.round().clamp(0.0, 100.0) as u8
}

/// Strategy 4: candidates scoring at least the minimum, best first.
#[must_use]
pub fn match_combination(
    transaction: &BankTransaction,
    candidates: &[MatchCandidate],
    tolerance: &MatchTolerance,
) -> MatchResult {
    let mut scored: Vec<(u8, &MatchCandidate)> = candidates
        .iter()
        .map(|candidate| (combination_score(transaction, candidate, tolerance), candidate))
        .filter(|(score, _)| *score >= tolerance.combination_min_score)
        .collect();
    scored.sort_by(|left, right| {
        right
            .0
            .cmp(&left.0)
            .then_with(|| left.1.id.cmp(&right.1.id))
    });

    let Some((confidence, best)) = scored.first().copied() else {
        return no_match(
            transaction,
            MatchCategory::Combination,
            "no voucher reaches the combined score threshold",
        );
    };

    MatchResult {
        bank_transaction_id: transaction.id.clone(),
        matched_voucher_id: Some(best.id.clone()),
        category: MatchCategory::Combination,
        confidence,
        reason: format!(
            "combined similarity {confidence} with voucher {} ({} candidate(s) above threshold)",
            best.number,
            scored.len()
        ),
        suggested_entries: scored
            .into_iter()
            .map(|(_, candidate)| candidate.clone())
            .collect(),
    }
}

fn priority(category: MatchCategory) -> u8 {
    match category {
        MatchCategory::ExactId => 0,
        MatchCategory::Reference => 1,
        MatchCategory::Amount => 2,
        MatchCategory::Combination => 3,
    }
}

/// Runs every strategy. The best result has the highest confidence; ties go
/// to the higher-priority strategy.
#[must_use]
pub fn match_all(
    transaction: &BankTransaction,
    candidates: &[MatchCandidate],
    tolerance: &MatchTolerance,
) -> MatchReport {
    let results = vec![
        match_exact_id(transaction, candidates, tolerance),
        match_reference(transaction, candidates, tolerance),
        match_amount_date(transaction, candidates, tolerance),
        match_combination(transaction, candidates, tolerance),
    ];
    let best = results
        .iter()
        .min_by(|left, right| match right.confidence.cmp(&left.confidence) {
            Ordering::Equal => priority(left.category).cmp(&priority(right.category)),
            other => other,
        })
        .cloned()
        .unwrap_or_else(|| no_match(transaction, MatchCategory::Combination, "no strategies"));
    MatchReport { results, best }
}

/// Runs strategies in priority order and stops at the first that clears its
/// threshold; otherwise returns the combination result.
#[must_use]
pub fn auto_match(
    transaction: &BankTransaction,
    candidates: &[MatchCandidate],
    tolerance: &MatchTolerance,
) -> MatchResult {
    let exact = match_exact_id(transaction, candidates, tolerance);
    if exact.confidence >= AUTO_EXACT_ID_THRESHOLD {
        return exact;
    }
    let reference = match_reference(transaction, candidates, tolerance);
    if reference.confidence >= AUTO_REFERENCE_THRESHOLD {
        return reference;
    }
    let amount = match_amount_date(transaction, candidates, tolerance);
    if amount.confidence >= AUTO_AMOUNT_DATE_THRESHOLD {
        return amount;
    }
    match_combination(transaction, candidates, tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::date;
    use time::Duration;

    fn amount(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    fn fixture_transaction(cents: i64, description: &str, reference: Option<&str>) -> BankTransaction {
        BankTransaction {
            id: "tx-1".to_string(),
            date: date!(2026 - 03 - 10),
            amount: amount(cents),
            description: description.to_string(),
            reference: reference.map(str::to_string),
        }
    }

    fn fixture_candidate(id: &str, number: &str, cents: i64, day_offset: i64) -> MatchCandidate {
        MatchCandidate {
            id: id.to_string(),
            number: number.to_string(),
            date: date!(2026 - 03 - 10) + Duration::days(day_offset),
            amount: amount(cents),
            description: String::new(),
            reference: None,
        }
    }

    #[test]
    fn exact_id_matches_kid_with_equal_amount() {
        let transaction = fixture_transaction(-525_000, "Payment", Some("12345678901"));
        let mut voucher = fixture_candidate("v-1", "1001", 525_000, 5);
        voucher.reference = Some("1234 5678 901".to_string());
        let result = match_exact_id(&transaction, &[voucher], &MatchTolerance::default());
        assert_eq!(result.confidence, 100);
        assert_eq!(result.category, MatchCategory::ExactId);
        assert_eq!(result.matched_voucher_id.as_deref(), Some("v-1"));
    }

    #[test]
    fn exact_id_falls_back_to_longest_digit_run_in_description() {
        let transaction = fixture_transaction(10_000, "KID 12 ref 98765432101 inv 55", None);
        assert_eq!(
            extract_identifier(&transaction).as_deref(),
            Some("98765432101")
        );
    }

    #[test]
    fn exact_id_rejects_amount_outside_tolerance() {
        let transaction = fixture_transaction(525_000, "Payment", Some("12345678901"));
        let mut voucher = fixture_candidate("v-1", "1001", 525_101, 0);
        voucher.reference = Some("12345678901".to_string());
        let result = match_exact_id(&transaction, &[voucher], &MatchTolerance::default());
        assert_eq!(result.confidence, 0);
        assert!(!result.is_match());
    }

    #[test]
    fn reference_strategy_trims_leading_zeros() {
        let transaction = fixture_transaction(99_900, "Betaling faktura 0004711", None);
        let candidates = vec![
            fixture_candidate("v-1", "4710", 99_900, 0),
            fixture_candidate("v-2", "4711", 99_950, 20),
        ];
        let result = match_reference(&transaction, &candidates, &MatchTolerance::default());
        assert_eq!(result.confidence, 95);
        assert_eq!(result.matched_voucher_id.as_deref(), Some("v-2"));
    }

    #[test]
    fn amount_date_prefers_closest_date_then_amount() {
        let transaction = fixture_transaction(50_000, "", None);
        let candidates = vec![
            fixture_candidate("far", "1", 50_000, 3),
            fixture_candidate("near-off", "2", 50_080, -1),
            fixture_candidate("near-exact", "3", 50_000, 1),
            fixture_candidate("outside", "4", 50_000, 4),
        ];
        let result = match_amount_date(&transaction, &candidates, &MatchTolerance::default());
        assert_eq!(result.matched_voucher_id.as_deref(), Some("near-exact"));
        assert_eq!(result.confidence, 87);
    }

    #[test]
    fn amount_date_confidence_decreases_with_days() {
        let values: Vec<u8> = (0..=3).map(amount_date_confidence).collect();
        assert_eq!(values, vec![90, 87, 84, 81]);
        assert_eq!(amount_date_confidence(30), 80);
    }

    #[test]
    fn combination_keeps_only_strong_candidates_sorted() {
        let transaction = fixture_transaction(100_000, "Acme hosting march", None);
        let mut strong = fixture_candidate("strong", "10", 100_000, 0);
        strong.description = "acme hosting march".to_string();
        let mut medium = fixture_candidate("medium", "11", 102_000, 2);
        medium.description = "acme hosting".to_string();
        let weak = fixture_candidate("weak", "12", 900_000, 30);
        let result = match_combination(
            &transaction,
            &[weak, medium, strong],
            &MatchTolerance::default(),
        );
        assert_eq!(result.confidence, 100);
        assert_eq!(result.matched_voucher_id.as_deref(), Some("strong"));
        let ids: Vec<&str> = result
            .suggested_entries
            .iter()
            .map(|entry| entry.id.as_str())
            .collect();
        assert_eq!(ids, vec!["strong", "medium"]);
    }

    #[test]
    fn every_strategy_tolerates_empty_candidates() {
        let transaction = fixture_transaction(100, "ref 123456", Some("99"));
        let report = match_all(&transaction, &[], &MatchTolerance::default());
        assert_eq!(report.results.len(), 4);
        assert!(report.results.iter().all(|result| result.confidence == 0));
        assert_eq!(report.best.confidence, 0);
        assert_eq!(report.best.category, MatchCategory::ExactId);
    }

    #[test]
    fn auto_match_stops_at_first_confident_strategy() {
        let transaction = fixture_transaction(525_000, "Invoice 12345678901", None);
        let mut voucher = fixture_candidate("v-1", "77", 525_000, 0);
        voucher.reference = Some("12345678901".to_string());
        let result = auto_match(&transaction, &[voucher], &MatchTolerance::default());
        assert_eq!(result.category, MatchCategory::ExactId);
        assert_eq!(result.confidence, 100);
    }

    #[test]
    fn auto_match_falls_through_to_combination() {
        let transaction = fixture_transaction(100_000, "acme", None);
        let mut voucher = fixture_candidate("v-1", "77", 100_500, 5);
        voucher.description = "acme".to_string();
        let result = auto_match(&transaction, &[voucher], &MatchTolerance::default());
        assert_eq!(result.category, MatchCategory::Combination);
        // 40 * 0.95 + 30 + 20 * (2/7) + 10 = 83.71
        assert_eq!(result.confidence, 84);
    }

    #[test]
    fn match_all_reports_best_by_confidence() {
        let transaction = fixture_transaction(50_000, "", None);
        let mut voucher = fixture_candidate("v-1", "1", 50_000, 0);
        voucher.description = "office rent".to_string();
        let candidates = vec![voucher];
        let report = match_all(&transaction, &candidates, &MatchTolerance::default());
        assert_eq!(report.best.category, MatchCategory::Amount);
        assert_eq!(report.best.confidence, 90);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn amount_date_never_accepts_outside_tolerance(
            tx_cents in 1_i64..10_000_000,
            offsets in proptest::collection::vec((-500_i64..500, -10_i64..10), 0..8),
        ) {
            let transaction = fixture_transaction(tx_cents, "", None);
            let candidates: Vec<MatchCandidate> = offsets
                .iter()
                .enumerate()
                .map(|(index, (cents, days))| {
                    fixture_candidate(&format!("v-{index}"), "1", tx_cents + cents, *days)
                })
                .collect();
            let result = match_amount_date(&transaction, &candidates, &MatchTolerance::default());
            if let Some(id) = &result.matched_voucher_id {
                let candidate = candidates.iter().find(|candidate| &candidate.id == id);
                prop_assert!(candidate.is_some());
                if let Some(candidate) = candidate {
                    prop_assert!(day_difference(transaction.date, candidate.date) <= 3);
                    prop_assert!(amount_difference(transaction.amount, candidate.amount) <= Decimal::ONE);
                }
            } else {
                prop_assert_eq!(result.confidence, 0);
            }
        }

        #[test]
        fn combination_never_reports_below_threshold(
            tx_cents in 1_i64..1_000_000,
            offsets in proptest::collection::vec((-20_000_i64..20_000, -10_i64..10, "[a-z ]{0,12}"), 0..8),
        ) {
            let transaction = fixture_transaction(tx_cents, "acme hosting", None);
            let candidates: Vec<MatchCandidate> = offsets
                .iter()
                .enumerate()
                .map(|(index, (cents, days, text))| {
                    let mut candidate =
                        fixture_candidate(&format!("v-{index}"), "1", tx_cents + cents, *days);
                    candidate.description = text.clone();
                    candidate
                })
                .collect();
            let result = match_combination(&transaction, &candidates, &MatchTolerance::default());
            prop_assert!(result.confidence == 0 || result.confidence >= 60);
            for entry in &result.suggested_entries {
                prop_assert!(combination_score(&transaction, entry, &MatchTolerance::default()) >= 60);
            }
        }

        #[test]
        fn exact_id_is_all_or_nothing(
            cents in 1_000_i64..10_000_000,
            delta in -300_i64..300,
            same_id in proptest::bool::ANY,
        ) {
            let transaction = fixture_transaction(cents, "", Some("12345678901"));
            let mut voucher = fixture_candidate("v-1", "1", cents + delta, 0);
            voucher.reference = Some(if same_id { "12345678901" } else { "12345678902" }.to_string());
            let result = match_exact_id(&transaction, &[voucher], &MatchTolerance::default());
            let expected = same_id && delta.abs() <= 100;
            prop_assert_eq!(result.confidence == 100, expected);
            prop_assert!(result.confidence == 0 || result.confidence == 100);
        }
    }
}
