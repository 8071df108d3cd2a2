use autoledger_core::booking::check_balance;
use autoledger_core::{
    AccountingPeriod, BalanceError, BookingLine, BookingTotals, EntryId, EntryStatus,
    LedgerEntry, LockedPeriodError, NewLedgerEntry, NotFoundError, TenantId,
};
use autoledger_store_core::LedgerStore;
use time::Date;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum PostingError {
    #[error(transparent)]
    Unbalanced(#[from] BalanceError),
    #[error(transparent)]
    LockedPeriod(#[from] LockedPeriodError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error("ledger entry requires at least one line")]
    Empty,
    #[error("ledger entry {0} has already been reversed")]
    AlreadyReversed(EntryId),
    #[error("ledger entry {0} is not posted and cannot be reversed")]
    NotPosted(EntryId),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Gatekeeper between candidate bookings and the ledger. Nothing reaches
/// `posted` without passing the balance check here.
pub struct BookingValidator<'a, S: LedgerStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: LedgerStore + ?Sized> BookingValidator<'a, S> {
    #[must_use]
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// # Errors
    /// Returns [`BalanceError`] when debits and credits differ by more than 0.01.
    pub fn validate(&self, lines: &[BookingLine]) -> Result<BookingTotals, BalanceError> {
        check_balance(lines)
    }

    /// Validates, numbers, and posts a new voucher.
    ///
    /// The sequence number is committed before the draft is written, so a
    /// failure after allocation leaves a gap rather than a reused number.
    ///
    /// # Errors
    /// Returns [`PostingError::Unbalanced`] for unbalanced lines,
    /// [`PostingError::LockedPeriod`] when the accounting period is locked,
    /// or [`PostingError::Store`] when persistence fails.
    pub fn post(&self, entry: &NewLedgerEntry) -> Result<LedgerEntry, PostingError> {
        if entry.lines.is_empty() {
            return Err(PostingError::Empty);
        }
        let totals = self.validate(&entry.lines)?;
        self.ensure_open(&entry.tenant, AccountingPeriod::of(entry.accounting_date))?;

        let sequence_number = self.store.allocate_sequence(&entry.tenant)?;
        let draft = self.store.insert_draft_entry(entry, sequence_number)?;
        let posted = self.store.post_entry(draft.id)?;

        info!(
            tenant = %posted.tenant,
            entry_id = %posted.id,
            sequence_number = posted.sequence_number,
            debit = %totals.debit,
            source_reference = %posted.source_reference,
            "ledger entry posted"
        );
        Ok(posted)
    }

    /// Posts a mirror entry that cancels `entry_id`.
    ///
    /// # Errors
    /// Returns [`PostingError::LockedPeriod`] when either the original or the
    /// reversal period is locked, [`PostingError::AlreadyReversed`] on a
    /// second reversal, [`PostingError::NotPosted`] for drafts, and
    /// [`PostingError::NotFound`] for unknown entries.
    pub fn reverse(
        &self,
        tenant: &TenantId,
        entry_id: EntryId,
        accounting_date: Date,
    ) -> Result<LedgerEntry, PostingError> {
        let original = self
            .store
            .get_entry(entry_id)?
            .filter(|entry| &entry.tenant == tenant)
            .ok_or_else(|| NotFoundError {
                kind: "ledger entry",
                id: entry_id.to_string(),
            })?;

        if original.status != EntryStatus::Posted {
            return Err(PostingError::NotPosted(entry_id));
        }
        if original.reversal_of.is_some() || self.store.find_reversal(entry_id)?.is_some() {
            return Err(PostingError::AlreadyReversed(entry_id));
        }
        self.ensure_open(tenant, original.period())?;

        let lines = original
            .lines
            .iter()
            .map(|line| BookingLine {
                debit: line.credit,
                credit: line.debit,
                ..line.clone()
            })
            .collect();

        self.post(&NewLedgerEntry {
            tenant: tenant.clone(),
            accounting_date,
            lines,
            source_reference: format!("reversal:{}", original.source_reference),
            counterparty: original.counterparty.clone(),
            payment_reference: None,
            reversal_of: Some(entry_id),
        })
    }

    fn ensure_open(&self, tenant: &TenantId, period: AccountingPeriod) -> Result<(), PostingError> {
        if self.store.is_period_locked(tenant, period)? {
            return Err(LockedPeriodError {
                tenant: tenant.clone(),
                period,
            }
            .into());
        }
        Ok(())
    }
}
