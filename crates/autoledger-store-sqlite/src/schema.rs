pub const LEDGER_SCHEMA_VERSION: i64 = 1;

pub(crate) const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  tenant TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN (
    'invoice_received','invoice_parsed','booking_completed',
    'correction_received','period_closing','bank_transaction_imported'
  )),
  payload_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('unprocessed','processing','processed','dead_lettered')),
  attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
  last_error TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
  task_id TEXT PRIMARY KEY,
  tenant TEXT NOT NULL,
  event_id TEXT,
  agent_kind TEXT NOT NULL CHECK (agent_kind IN ('bookkeeper','learning','invoice_parser')),
  task_kind TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  priority INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 10),
  status TEXT NOT NULL CHECK (status IN ('pending','completed','aborted')),
  note TEXT,
  created_at TEXT NOT NULL,
  finished_at TEXT,
  FOREIGN KEY (event_id) REFERENCES events(event_id)
);

CREATE TABLE IF NOT EXISTS sequence_counters (
  tenant TEXT PRIMARY KEY,
  last_value INTEGER NOT NULL CHECK (last_value > 0)
);

CREATE TABLE IF NOT EXISTS ledger_entries (
  entry_id TEXT PRIMARY KEY,
  tenant TEXT NOT NULL,
  accounting_date TEXT NOT NULL,
  sequence_number INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('draft','posted')),
  source_reference TEXT NOT NULL,
  counterparty TEXT,
  payment_reference TEXT,
  reversal_of TEXT UNIQUE,
  created_at TEXT NOT NULL,
  posted_at TEXT,
  UNIQUE(tenant, sequence_number),
  FOREIGN KEY (reversal_of) REFERENCES ledger_entries(entry_id)
);

CREATE TABLE IF NOT EXISTS ledger_lines (
  entry_id TEXT NOT NULL,
  line_no INTEGER NOT NULL,
  account TEXT NOT NULL,
  debit TEXT NOT NULL,
  credit TEXT NOT NULL,
  tax_code TEXT,
  description TEXT NOT NULL,
  PRIMARY KEY (entry_id, line_no),
  FOREIGN KEY (entry_id) REFERENCES ledger_entries(entry_id)
);

CREATE TABLE IF NOT EXISTS locked_periods (
  tenant TEXT NOT NULL,
  period TEXT NOT NULL,
  locked_at TEXT NOT NULL,
  PRIMARY KEY (tenant, period)
);

CREATE TABLE IF NOT EXISTS review_items (
  item_id TEXT PRIMARY KEY,
  tenant TEXT NOT NULL,
  source_reference TEXT NOT NULL,
  counterparty TEXT,
  subject_json TEXT NOT NULL,
  priority TEXT NOT NULL CHECK (priority IN ('medium','high')),
  status TEXT NOT NULL CHECK (status IN ('pending','resolved')),
  confidence INTEGER NOT NULL CHECK (confidence BETWEEN 0 AND 100),
  reasoning TEXT NOT NULL,
  flags_json TEXT NOT NULL,
  resolution TEXT,
  created_at TEXT NOT NULL,
  resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS corrections (
  correction_id TEXT PRIMARY KEY,
  tenant TEXT NOT NULL,
  source_reference TEXT NOT NULL,
  counterparty TEXT,
  description TEXT,
  document_amount TEXT,
  accounting_date TEXT NOT NULL,
  original_json TEXT NOT NULL,
  corrected_json TEXT NOT NULL,
  reason TEXT NOT NULL,
  corrected_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  learned_at TEXT,
  posted_entry_id TEXT REFERENCES ledger_entries(entry_id)
);

CREATE TABLE IF NOT EXISTS patterns (
  pattern_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('counterparty_account','keyword_account','manual')),
  trigger_key TEXT NOT NULL,
  trigger_json TEXT NOT NULL,
  action_key TEXT NOT NULL,
  action_json TEXT NOT NULL,
  scope_json TEXT NOT NULL,
  success_rate REAL NOT NULL CHECK (success_rate BETWEEN 0.0 AND 1.0),
  times_applied INTEGER NOT NULL CHECK (times_applied >= 0),
  times_correct INTEGER NOT NULL CHECK (times_correct >= 0 AND times_correct <= times_applied),
  confidence_boost INTEGER NOT NULL CHECK (confidence_boost BETWEEN 0 AND 100),
  active INTEGER NOT NULL CHECK (active IN (0,1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reconciliations (
  tenant TEXT NOT NULL,
  bank_transaction_id TEXT NOT NULL,
  entry_id TEXT NOT NULL UNIQUE,
  category TEXT NOT NULL CHECK (category IN ('exact_id','reference','amount','combination')),
  confidence INTEGER NOT NULL CHECK (confidence BETWEEN 0 AND 100),
  created_at TEXT NOT NULL,
  PRIMARY KEY (tenant, bank_transaction_id),
  FOREIGN KEY (entry_id) REFERENCES ledger_entries(entry_id)
);

CREATE INDEX IF NOT EXISTS idx_events_queue ON events(status, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_tasks_tenant ON tasks(tenant, created_at);
CREATE INDEX IF NOT EXISTS idx_entries_counterparty ON ledger_entries(tenant, counterparty, accounting_date);
CREATE INDEX IF NOT EXISTS idx_review_tenant_status ON review_items(tenant, status, created_at);
CREATE INDEX IF NOT EXISTS idx_review_counterparty ON review_items(tenant, counterparty, status);
CREATE INDEX IF NOT EXISTS idx_patterns_trigger ON patterns(trigger_key, active);

CREATE TRIGGER IF NOT EXISTS trg_events_fact_immutable
BEFORE UPDATE OF event_id, tenant, kind, payload_json, created_at ON events
BEGIN
  SELECT RAISE(FAIL, 'events are immutable apart from status bookkeeping');
END;
CREATE TRIGGER IF NOT EXISTS trg_events_no_delete
BEFORE DELETE ON events
BEGIN
  SELECT RAISE(FAIL, 'events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_sequence_counters_monotonic
BEFORE UPDATE ON sequence_counters
WHEN NEW.last_value <= OLD.last_value
BEGIN
  SELECT RAISE(FAIL, 'sequence counters only move forward');
END;
CREATE TRIGGER IF NOT EXISTS trg_sequence_counters_no_delete
BEFORE DELETE ON sequence_counters
BEGIN
  SELECT RAISE(FAIL, 'sequence counters are never reset');
END;

CREATE TRIGGER IF NOT EXISTS trg_ledger_entries_posted_immutable
BEFORE UPDATE ON ledger_entries
WHEN OLD.status = 'posted'
BEGIN
  SELECT RAISE(FAIL, 'posted ledger entries are immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_ledger_entries_posted_no_delete
BEFORE DELETE ON ledger_entries
WHEN OLD.status = 'posted'
BEGIN
  SELECT RAISE(FAIL, 'posted ledger entries are immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_ledger_lines_posted_no_insert
BEFORE INSERT ON ledger_lines
WHEN (SELECT status FROM ledger_entries WHERE entry_id = NEW.entry_id) = 'posted'
BEGIN
  SELECT RAISE(FAIL, 'posted ledger entries are immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_ledger_lines_posted_no_update
BEFORE UPDATE ON ledger_lines
WHEN (SELECT status FROM ledger_entries WHERE entry_id = OLD.entry_id) = 'posted'
BEGIN
  SELECT RAISE(FAIL, 'posted ledger entries are immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_ledger_lines_posted_no_delete
BEFORE DELETE ON ledger_lines
WHEN (SELECT status FROM ledger_entries WHERE entry_id = OLD.entry_id) = 'posted'
BEGIN
  SELECT RAISE(FAIL, 'posted ledger entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_locked_periods_no_update
BEFORE UPDATE ON locked_periods
BEGIN
  SELECT RAISE(FAIL, 'locked periods are append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_locked_periods_no_delete
BEFORE DELETE ON locked_periods
BEGIN
  SELECT RAISE(FAIL, 'locked periods are append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_corrections_immutable
BEFORE UPDATE OF correction_id, tenant, source_reference, counterparty, description,
  document_amount, accounting_date, original_json, corrected_json, reason, corrected_by,
  created_at ON corrections
BEGIN
  SELECT RAISE(FAIL, 'corrections are immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_corrections_learned_once
BEFORE UPDATE OF learned_at ON corrections
WHEN OLD.learned_at IS NOT NULL
BEGIN
  SELECT RAISE(FAIL, 'corrections are learned exactly once');
END;
CREATE TRIGGER IF NOT EXISTS trg_corrections_posted_once
BEFORE UPDATE OF posted_entry_id ON corrections
WHEN OLD.posted_entry_id IS NOT NULL
BEGIN
  SELECT RAISE(FAIL, 'a correction posts its booking once');
END;
CREATE TRIGGER IF NOT EXISTS trg_corrections_no_delete
BEFORE DELETE ON corrections
BEGIN
  SELECT RAISE(FAIL, 'corrections are append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_patterns_no_delete
BEFORE DELETE ON patterns
BEGIN
  SELECT RAISE(FAIL, 'patterns are never deleted; deactivate instead');
END;
CREATE TRIGGER IF NOT EXISTS trg_patterns_counters_monotonic
BEFORE UPDATE ON patterns
WHEN NEW.times_applied < OLD.times_applied OR NEW.times_correct < OLD.times_correct
BEGIN
  SELECT RAISE(FAIL, 'pattern counters only increase');
END;
CREATE TRIGGER IF NOT EXISTS trg_patterns_identity_immutable
BEFORE UPDATE OF pattern_id, kind, trigger_key, trigger_json, action_key, action_json,
  scope_json, created_at ON patterns
BEGIN
  SELECT RAISE(FAIL, 'pattern identity is immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_patterns_no_reactivate
BEFORE UPDATE OF active ON patterns
WHEN OLD.active = 0 AND NEW.active = 1
BEGIN
  SELECT RAISE(FAIL, 'deactivated patterns stay deactivated');
END;

CREATE TRIGGER IF NOT EXISTS trg_reconciliations_no_update
BEFORE UPDATE ON reconciliations
BEGIN
  SELECT RAISE(FAIL, 'reconciliations are append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_reconciliations_no_delete
BEFORE DELETE ON reconciliations
BEGIN
  SELECT RAISE(FAIL, 'reconciliations are append-only');
END;
";
