//! Turns accountant corrections into patterns and applies them to similar
//! pending review items.

use std::collections::BTreeSet;

use anyhow::Result;
use autoledger_core::booking::scale_booking;
use autoledger_core::patterns::extract_keywords;
use autoledger_core::{
    ChartOfAccounts, Correction, CorrectionId, NewLedgerEntry, NewPattern, NotFoundError,
    PatternAction, PatternId, PatternKind, PatternScope, PatternTrigger, ReviewItemId,
    ReviewSubject,
};
use autoledger_store_core::LedgerStore;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::validator::BookingValidator;

pub const DEFAULT_CONFIDENCE_BOOST: u8 = 15;

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(tag = "change", content = "pattern_id", rename_all = "snake_case")]
pub enum PatternChange {
    Created(PatternId),
    Reinforced(PatternId),
    /// Neither a counterparty nor usable keywords were available.
    NoTrigger,
}

impl PatternChange {
    #[must_use]
    pub fn pattern_id(self) -> Option<PatternId> {
        match self {
            Self::Created(id) | Self::Reinforced(id) => Some(id),
            Self::NoTrigger => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct LearningReport {
    pub correction_id: CorrectionId,
    pub pattern: PatternChange,
    pub deactivated: Vec<PatternId>,
    pub propagated: Vec<ReviewItemId>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LearningOutcome {
    AlreadyLearned { correction_id: CorrectionId },
    Learned(LearningReport),
}

pub struct Learner<'a, S: LedgerStore + ?Sized> {
    store: &'a S,
    chart: &'a ChartOfAccounts,
    min_success_rate: f64,
}

impl<'a, S: LedgerStore + ?Sized> Learner<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, chart: &'a ChartOfAccounts, min_success_rate: f64) -> Self {
        Self {
            store,
            chart,
            min_success_rate,
        }
    }

    /// Learns from a stored correction exactly once, then resolves similar
    /// pending review items for the same counterparty.
    ///
    /// # Errors
    /// Returns [`NotFoundError`] (wrapped) for an unknown correction and
    /// store errors as-is.
    pub fn learn(&self, correction_id: CorrectionId) -> Result<LearningOutcome> {
        let correction =
            self.store
                .get_correction(correction_id)?
                .ok_or_else(|| NotFoundError {
                    kind: "correction",
                    id: correction_id.to_string(),
                })?;

        if correction.learned_at.is_some() {
            debug!(correction_id = %correction_id, "correction already learned");
            return Ok(LearningOutcome::AlreadyLearned { correction_id });
        }

        let (pattern, deactivated) = match self.derive_rule(&correction)? {
            Some((kind, trigger, action)) => self.record_rule(&correction, kind, trigger, action)?,
            None => (PatternChange::NoTrigger, Vec::new()),
        };

        if !self.store.mark_correction_learned(correction_id)? {
            warn!(correction_id = %correction_id, "correction was learned concurrently");
            return Ok(LearningOutcome::AlreadyLearned { correction_id });
        }

        let propagated = self.propagate(&correction, pattern.pattern_id())?;

        info!(
            correction_id = %correction_id,
            tenant = %correction.tenant,
            pattern = ?pattern,
            deactivated = deactivated.len(),
            propagated = propagated.len(),
            "learned from correction"
        );

        Ok(LearningOutcome::Learned(LearningReport {
            correction_id,
            pattern,
            deactivated,
            propagated,
        }))
    }

    fn derive_rule(
        &self,
        correction: &Correction,
    ) -> Result<Option<(PatternKind, PatternTrigger, PatternAction)>> {
        let trigger = if let Some(counterparty) = &correction.counterparty {
            Some((
                PatternKind::CounterpartyAccount,
                PatternTrigger::counterparty(counterparty.clone())?,
            ))
        } else {
            let keywords = extract_keywords(correction.description.as_deref().unwrap_or_default());
            if keywords.is_empty() {
                None
            } else {
                Some((PatternKind::KeywordAccount, PatternTrigger::keywords(keywords)?))
            }
        };
        let Some((kind, trigger)) = trigger else {
            return Ok(None);
        };

        let expense_lines: Vec<_> = correction
            .corrected_booking
            .iter()
            .filter(|line| {
                !self.chart.is_liability(&line.account) && !self.chart.is_tax(&line.account)
            })
            .collect();
        let accounts: BTreeSet<_> = expense_lines.iter().map(|line| line.account.clone()).collect();
        if accounts.is_empty() {
            return Ok(None);
        }
        let tax_codes: BTreeSet<_> = expense_lines
            .iter()
            .map(|line| line.tax_code.clone())
            .collect();
        let tax_code = match tax_codes.into_iter().collect::<Vec<_>>().as_slice() {
            [Some(code)] => Some(code.clone()),
            _ => None,
        };

        Ok(Some((kind, trigger, PatternAction { accounts, tax_code })))
    }

    fn record_rule(
        &self,
        correction: &Correction,
        kind: PatternKind,
        trigger: PatternTrigger,
        action: PatternAction,
    ) -> Result<(PatternChange, Vec<PatternId>)> {
        let existing: Vec<_> = self
            .store
            .list_patterns()?
            .into_iter()
            .filter(|pattern| {
                pattern.active
                    && pattern.scope.includes(&correction.tenant)
                    && pattern.trigger == trigger
            })
            .collect();

        let own_scope = PatternScope::tenant(&correction.tenant);
        let mut reinforced = None;
        let mut deactivated = Vec::new();
        for pattern in existing {
            if pattern.kind == kind && pattern.action == action {
                self.store.record_pattern_outcome(pattern.id, true)?;
                reinforced.get_or_insert(pattern.id);
                continue;
            }
            // Shared patterns are never penalised by a single tenant.
            if pattern.scope != own_scope {
                continue;
            }
            let missed = self.store.record_pattern_outcome(pattern.id, false)?;
            if missed.success_rate < self.min_success_rate {
                self.store.deactivate_pattern(missed.id)?;
                info!(
                    pattern_id = %missed.id,
                    success_rate = missed.success_rate,
                    "pattern deactivated after contradicting correction"
                );
                deactivated.push(missed.id);
            }
        }

        if let Some(pattern_id) = reinforced {
            return Ok((PatternChange::Reinforced(pattern_id), deactivated));
        }

        let created = self.store.insert_pattern(&NewPattern {
            kind,
            trigger,
            action,
            scope: own_scope,
            confidence_boost: DEFAULT_CONFIDENCE_BOOST,
        })?;
        Ok((PatternChange::Created(created.id), deactivated))
    }

    /// One generation only: items resolved here are never fed back into the
    /// learner.
    fn propagate(
        &self,
        correction: &Correction,
        pattern_id: Option<PatternId>,
    ) -> Result<Vec<ReviewItemId>> {
        let Some(counterparty) = &correction.counterparty else {
            return Ok(Vec::new());
        };
        let original_amount = correction.reference_amount().abs();
        if original_amount.is_zero() {
            return Ok(Vec::new());
        }

        let validator = BookingValidator::new(self.store);
        let mut visited: BTreeSet<ReviewItemId> = BTreeSet::new();
        let mut propagated = Vec::new();

        for item in self
            .store
            .pending_reviews_for_counterparty(&correction.tenant, counterparty)?
        {
            if item.source_reference == correction.source_reference || !visited.insert(item.id) {
                continue;
            }
            let ReviewSubject::Booking { document, .. } = &item.subject else {
                continue;
            };

            let ratio = document.total_amount.abs() / original_amount;
            if ratio <= Decimal::ZERO {
                continue;
            }
            let resolution = format!("auto-corrected from correction {}", correction.id);
            if !self.store.claim_review_item(item.id, &resolution)? {
                continue;
            }

            let entry = NewLedgerEntry {
                tenant: item.tenant.clone(),
                accounting_date: document.accounting_date,
                lines: scale_booking(&correction.corrected_booking, ratio),
                source_reference: document.source_reference.clone(),
                counterparty: document.counterparty.clone(),
                payment_reference: document.payment_reference.clone(),
                reversal_of: None,
            };
            match validator.post(&entry) {
                Ok(posted) => {
                    if let Some(pattern_id) = pattern_id {
                        self.store.record_pattern_outcome(pattern_id, true)?;
                    }
                    debug!(
                        review_item_id = %item.id,
                        entry_id = %posted.id,
                        "review item auto-corrected"
                    );
                    propagated.push(item.id);
                }
                Err(err) => {
                    warn!(
                        review_item_id = %item.id,
                        error = %err,
                        "propagated correction could not be posted; reopening review item"
                    );
                    self.store.reopen_review_item(item.id)?;
                }
            }
        }
        Ok(propagated)
    }
}
