//! Pattern triggers: canonical, order-independent predicates over documents.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::CounterpartyId;
use crate::model::DocumentFacts;
use crate::LedgerError;

/// Maximum number of keywords kept by [`extract_keywords`].
pub const MAX_KEYWORDS: usize = 5;

const MIN_KEYWORD_LEN: usize = 4;

const STOP_WORDS: &[&str] = &[
    // english
    "about", "after", "also", "been", "from", "have", "into", "invoice", "more", "only", "other",
    "over", "payment", "some", "such", "than", "that", "their", "them", "then", "there", "these",
    "they", "this", "total", "very", "were", "what", "when", "which", "will", "with", "your",
    // norwegian
    "alle", "andre", "bare", "blir", "både", "dere", "denne", "dette", "eller", "etter",
    "faktura", "fordi", "hadde", "hans", "hennes", "hvor", "ikke", "inkl", "mellom", "mens",
    "noen", "også", "samt", "skal", "slik", "totalt", "under", "uten", "vare", "vært", "være",
];

/// One predicate of a trigger.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TriggerCondition {
    Counterparty(CounterpartyId),
    /// Holds when any keyword is a case-insensitive substring of the
    /// document description.
    DescriptionContains(BTreeSet<String>),
    AmountRange {
        min: Option<Decimal>,
        max: Option<Decimal>,
    },
}

impl TriggerCondition {
    fn kind_rank(&self) -> u8 {
        match self {
            Self::Counterparty(_) => 0,
            Self::DescriptionContains(_) => 1,
            Self::AmountRange { .. } => 2,
        }
    }

    fn normalized(self) -> Result<Self, LedgerError> {
        match self {
            Self::Counterparty(id) => {
                let trimmed = id.as_str().trim();
                if trimmed.is_empty() {
                    return Err(LedgerError::Validation(
                        "vendor_id MUST NOT be blank".to_string(),
                    ));
                }
                Ok(Self::Counterparty(CounterpartyId::new(trimmed)))
            }
            Self::DescriptionContains(keywords) => {
                let keywords: BTreeSet<String> = keywords
                    .iter()
                    .map(|keyword| keyword.trim().to_lowercase())
                    .filter(|keyword| !keyword.is_empty())
                    .collect();
                if keywords.is_empty() {
                    return Err(LedgerError::Validation(
                        "description_contains MUST name at least one keyword".to_string(),
                    ));
                }
                Ok(Self::DescriptionContains(keywords))
            }
            Self::AmountRange { min, max } => {
                if min.is_none() && max.is_none() {
                    return Err(LedgerError::Validation(
                        "amount_range MUST set min or max".to_string(),
                    ));
                }
                if let (Some(low), Some(high)) = (min, max) {
                    if low > high {
                        return Err(LedgerError::Validation(format!(
                            "amount_range min {low} exceeds max {high}"
                        )));
                    }
                }
                Ok(Self::AmountRange {
                    min: min.map(|value| value.normalize()),
                    max: max.map(|value| value.normalize()),
                })
            }
        }
    }

    #[must_use]
    pub fn holds(&self, document: &DocumentFacts) -> bool {
        match self {
            Self::Counterparty(id) => document.counterparty.as_ref() == Some(id),
            Self::DescriptionContains(keywords) => {
                let haystack = document.description.to_lowercase();
                keywords
                    .iter()
                    .any(|keyword| haystack.contains(keyword.as_str()))
            }
            Self::AmountRange { min, max } => {
                let amount = document.total_amount.abs();
                min.map_or(true, |low| amount >= low) && max.map_or(true, |high| amount <= high)
            }
        }
    }

    fn canonical_key(&self) -> String {
        match self {
            Self::Counterparty(id) => format!("counterparty={id}"),
            Self::DescriptionContains(keywords) => {
                let joined: Vec<&str> = keywords.iter().map(String::as_str).collect();
                format!("description_contains={}", joined.join(","))
            }
            Self::AmountRange { min, max } => format!(
                "amount_range={}..{}",
                min.map(|value| value.to_string()).unwrap_or_default(),
                max.map(|value| value.to_string()).unwrap_or_default()
            ),
        }
    }
}

/// Conjunction of conditions. Equality is structural over the canonical set,
/// so representation and key order in the external schema do not matter.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "TriggerSpec", into = "TriggerSpec")]
pub struct PatternTrigger {
    conditions: BTreeSet<TriggerCondition>,
}

impl PatternTrigger {
    /// # Errors
    /// Returns [`LedgerError::Validation`] for an empty trigger, a repeated
    /// condition kind, or an invalid condition.
    pub fn from_conditions(
        conditions: impl IntoIterator<Item = TriggerCondition>,
    ) -> Result<Self, LedgerError> {
        let mut seen = BTreeSet::new();
        let mut normalized = BTreeSet::new();
        for condition in conditions {
            if !seen.insert(condition.kind_rank()) {
                return Err(LedgerError::Validation(
                    "trigger MUST NOT repeat a condition kind".to_string(),
                ));
            }
            normalized.insert(condition.normalized()?);
        }
        if normalized.is_empty() {
            return Err(LedgerError::Validation(
                "trigger MUST contain at least one condition".to_string(),
            ));
        }
        Ok(Self {
            conditions: normalized,
        })
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] when the id is blank.
    pub fn counterparty(id: CounterpartyId) -> Result<Self, LedgerError> {
        Self::from_conditions([TriggerCondition::Counterparty(id)])
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] when no usable keyword remains.
    pub fn keywords<I, S>(keywords: I) -> Result<Self, LedgerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_conditions([TriggerCondition::DescriptionContains(
            keywords.into_iter().map(Into::into).collect(),
        )])
    }

    pub fn conditions(&self) -> impl Iterator<Item = &TriggerCondition> {
        self.conditions.iter()
    }

    #[must_use]
    pub fn counterparty_id(&self) -> Option<&CounterpartyId> {
        self.conditions.iter().find_map(|condition| match condition {
            TriggerCondition::Counterparty(id) => Some(id),
            _ => None,
        })
    }

    #[must_use]
    pub fn matches(&self, document: &DocumentFacts) -> bool {
        self.conditions
            .iter()
            .all(|condition| condition.holds(document))
    }

    /// Stable textual form; equal triggers have equal keys.
    #[must_use]
    pub fn canonical_key(&self) -> String {
        let parts: Vec<String> = self
            .conditions
            .iter()
            .map(TriggerCondition::canonical_key)
            .collect();
        parts.join(";")
    }
}

/// Keyword list accepted as either a single string or an array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum KeywordList {
    One(String),
    Many(Vec<String>),
}

impl KeywordList {
    fn into_set(self) -> BTreeSet<String> {
        match self {
            Self::One(keyword) => std::iter::once(keyword).collect(),
            Self::Many(keywords) => keywords.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AmountRangeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Decimal>,
}

/// External trigger schema:
/// `{vendor_id?, description_contains?: string|string[], amount_range?: {min?, max?}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TriggerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<CounterpartyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_contains: Option<KeywordList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_range: Option<AmountRangeSpec>,
}

impl TryFrom<TriggerSpec> for PatternTrigger {
    type Error = LedgerError;

    fn try_from(spec: TriggerSpec) -> Result<Self, Self::Error> {
        let mut conditions = Vec::new();
        if let Some(vendor) = spec.vendor_id {
            conditions.push(TriggerCondition::Counterparty(vendor));
        }
        if let Some(keywords) = spec.description_contains {
            conditions.push(TriggerCondition::DescriptionContains(keywords.into_set()));
        }
        if let Some(range) = spec.amount_range {
            conditions.push(TriggerCondition::AmountRange {
                min: range.min,
                max: range.max,
            });
        }
        Self::from_conditions(conditions)
    }
}

impl From<PatternTrigger> for TriggerSpec {
    fn from(trigger: PatternTrigger) -> Self {
        let mut spec = TriggerSpec::default();
        for condition in trigger.conditions {
            match condition {
                TriggerCondition::Counterparty(id) => spec.vendor_id = Some(id),
                TriggerCondition::DescriptionContains(keywords) => {
                    spec.description_contains =
                        Some(KeywordList::Many(keywords.into_iter().collect()));
                }
                TriggerCondition::AmountRange { min, max } => {
                    spec.amount_range = Some(AmountRangeSpec { min, max });
                }
            }
        }
        spec
    }
}

/// Lower-cases, splits on non-alphanumerics, drops short tokens, digits-only
/// tokens and stop words, dedupes, and keeps the first [`MAX_KEYWORDS`].
#[must_use]
pub fn extract_keywords(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut keywords: Vec<String> = Vec::new();
    for token in lowered.split(|c: char| !c.is_alphanumeric()) {
        if token.chars().count() < MIN_KEYWORD_LEN
            || token.chars().all(|c| c.is_ascii_digit())
            || STOP_WORDS.contains(&token)
            || keywords.iter().any(|existing| existing == token)
        {
            continue;
        }
        keywords.push(token.to_string());
        if keywords.len() == MAX_KEYWORDS {
            break;
        }
    }
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_document(description: &str, total_cents: i64) -> DocumentFacts {
        DocumentFacts {
            source_reference: "inv-1".to_string(),
            counterparty: Some(CounterpartyId::new("vendor-x")),
            accounting_date: time::macros::date!(2026 - 02 - 01),
            total_amount: Decimal::new(total_cents, 2),
            vat_amount: None,
            description: description.to_string(),
            payment_reference: None,
        }
    }

    #[test]
    fn string_and_array_keywords_are_the_same_trigger() {
        let single: PatternTrigger =
            must_ok(serde_json::from_str(r#"{"description_contains": "Rent"}"#));
        let many: PatternTrigger =
            must_ok(serde_json::from_str(r#"{"description_contains": ["rent"]}"#));
        assert_eq!(single, many);
        assert_eq!(single.canonical_key(), many.canonical_key());
    }

    #[test]
    fn key_order_and_decimal_scale_do_not_affect_equality() {
        let first: PatternTrigger = must_ok(serde_json::from_str(
            r#"{"vendor_id": "vendor-x", "amount_range": {"min": "100.00", "max": 500}}"#,
        ));
        let second: PatternTrigger = must_ok(serde_json::from_str(
            r#"{"amount_range": {"max": "500.0", "min": 100}, "vendor_id": "vendor-x"}"#,
        ));
        assert_eq!(first, second);
        assert_eq!(
            first.canonical_key(),
            "counterparty=vendor-x;amount_range=100..500"
        );
    }

    #[test]
    fn empty_and_unknown_triggers_are_rejected() {
        assert!(serde_json::from_str::<PatternTrigger>("{}").is_err());
        assert!(serde_json::from_str::<PatternTrigger>(r#"{"vendor": "x"}"#).is_err());
        assert!(serde_json::from_str::<PatternTrigger>(r#"{"amount_range": {}}"#).is_err());
        assert!(
            serde_json::from_str::<PatternTrigger>(r#"{"amount_range": {"min": 5, "max": 1}}"#)
                .is_err()
        );
    }

    #[test]
    fn conditions_are_conjunctive() {
        let trigger: PatternTrigger = must_ok(serde_json::from_str(
            r#"{"vendor_id": "vendor-x", "description_contains": ["cloud", "hosting"], "amount_range": {"max": 1000}}"#,
        ));
        assert!(trigger.matches(&fixture_document("Monthly HOSTING fee", 50_000)));
        assert!(!trigger.matches(&fixture_document("Monthly hosting fee", 150_000)));
        assert!(!trigger.matches(&fixture_document("Office chairs", 50_000)));
    }

    #[test]
    fn serialization_round_trips_through_external_schema() {
        let trigger = must_ok(PatternTrigger::keywords(["Hosting", "cloud"]));
        let value = must_ok(serde_json::to_value(&trigger));
        assert_eq!(
            value,
            serde_json::json!({"description_contains": ["cloud", "hosting"]})
        );
        let back: PatternTrigger = must_ok(serde_json::from_value(value));
        assert_eq!(back, trigger);
    }

    #[test]
    fn keyword_extraction_drops_noise() {
        let keywords =
            extract_keywords("Faktura 2026-001: Cloud hosting for the office, cloud backup 12345");
        assert_eq!(keywords, vec!["cloud", "hosting", "office", "backup"]);
    }

    #[test]
    fn keyword_extraction_keeps_at_most_five() {
        let keywords = extract_keywords("alpha bravo charlie delta echoes foxtrot golfing");
        assert_eq!(keywords.len(), MAX_KEYWORDS);
        assert_eq!(keywords[0], "alpha");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn extracted_keywords_are_bounded_and_long(text in "[A-Za-z0-9 ,.]{0,120}") {
            let keywords = extract_keywords(&text);
            prop_assert!(keywords.len() <= MAX_KEYWORDS);
            for keyword in &keywords {
                prop_assert!(keyword.chars().count() >= MIN_KEYWORD_LEN);
                prop_assert!(!keyword.chars().all(|c| c.is_ascii_digit()));
                prop_assert_eq!(keyword.clone(), keyword.to_lowercase());
            }
        }

        #[test]
        fn keyword_order_never_changes_trigger_identity(
            words in proptest::collection::vec("[a-z]{4,8}", 1..5)
        ) {
            let forward = PatternTrigger::keywords(words.clone());
            let mut reversed_words = words;
            reversed_words.reverse();
            let reversed = PatternTrigger::keywords(reversed_words);
            prop_assert_eq!(forward, reversed);
        }
    }
}
