//! Command surface for the automated ledger.
//!
//! Every command prints pretty JSON on stdout; logs go to stderr.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use autoledger_core::booking::{check_balance, parse_suggestion_value, UNBALANCED_CONFIDENCE_CAP};
use autoledger_core::matching::match_all;
use autoledger_core::scoring::score_booking;
use autoledger_core::{
    parse_date, AccountingPeriod, BankTransaction, ConfidenceScore, CounterpartyHistory,
    DocumentFacts, EntryId, EventKind, EventStatus, MatchCandidate, MatchTolerance, NewEvent,
    Pattern, ReviewPriority, ReviewStatus, Route, RoutingThresholds, ScoringConfig, TaskId,
    TaskStatus, TenantId,
};
use autoledger_engine::{BookingValidator, EngineConfig, Orchestrator};
use autoledger_store_core::LedgerStore;
use autoledger_store_sqlite::SqliteLedgerStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "autoledger")]
#[command(about = "Automated bookkeeping pipeline")]
pub struct Cli {
    #[arg(long, default_value = "./autoledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the ledger schema.
    Migrate,
    Event {
        #[command(subcommand)]
        command: EventCommand,
    },
    /// Process events until interrupted, or once with `--once`.
    Run(RunArgs),
    /// Score a booking fixture without touching the database.
    Score(InputArgs),
    /// Run every bank matching strategy on a fixture.
    Match(InputArgs),
    Review {
        #[command(subcommand)]
        command: ReviewCommand,
    },
    Pattern {
        #[command(subcommand)]
        command: PatternCommand,
    },
    Period {
        #[command(subcommand)]
        command: PeriodCommand,
    },
    Entry {
        #[command(subcommand)]
        command: EntryCommand,
    },
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Submit(EventSubmitArgs),
    List(EventListArgs),
}

#[derive(Debug, Args)]
pub struct EventSubmitArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    kind: EventKindArg,
    #[arg(long, default_value = "{}")]
    payload_json: String,
}

#[derive(Debug, Args)]
pub struct EventListArgs {
    #[arg(long)]
    status: Option<EventStatusArg>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Args)]
pub struct InputArgs {
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum ReviewCommand {
    List(ReviewListArgs),
}

#[derive(Debug, Args)]
pub struct ReviewListArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    status: Option<ReviewStatusArg>,
}

#[derive(Debug, Subcommand)]
pub enum PatternCommand {
    List,
}

#[derive(Debug, Subcommand)]
pub enum PeriodCommand {
    Lock(PeriodLockArgs),
}

#[derive(Debug, Args)]
pub struct PeriodLockArgs {
    #[arg(long)]
    tenant: String,
    /// `YYYY-MM`
    #[arg(long)]
    period: String,
}

#[derive(Debug, Subcommand)]
pub enum EntryCommand {
    List(EntryListArgs),
    Reverse(EntryReverseArgs),
}

#[derive(Debug, Args)]
pub struct EntryListArgs {
    #[arg(long)]
    tenant: String,
}

#[derive(Debug, Args)]
pub struct EntryReverseArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    entry_id: String,
    /// Accounting date of the reversal, `YYYY-MM-DD`.
    #[arg(long)]
    date: String,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    List(TaskListArgs),
    /// Settle a pending task picked up by an agent.
    Finish(TaskFinishArgs),
}

#[derive(Debug, Args)]
pub struct TaskListArgs {
    #[arg(long)]
    tenant: Option<String>,
}

#[derive(Debug, Args)]
pub struct TaskFinishArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    status: TaskOutcomeArg,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TaskOutcomeArg {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EventKindArg {
    InvoiceReceived,
    InvoiceParsed,
    BookingCompleted,
    CorrectionReceived,
    PeriodClosing,
    BankTransactionImported,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EventStatusArg {
    Unprocessed,
    Processing,
    Processed,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ReviewStatusArg {
    Pending,
    Resolved,
}

/// Booking fixture for `score`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScoreInput {
    #[serde(default)]
    tenant: Option<TenantId>,
    document: DocumentFacts,
    suggestion: Value,
    #[serde(default)]
    history: CounterpartyHistory,
    #[serde(default)]
    patterns: Vec<Pattern>,
    #[serde(default)]
    scoring: ScoringConfig,
    #[serde(default)]
    routing: RoutingThresholds,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatchInput {
    transaction: BankTransaction,
    #[serde(default)]
    candidates: Vec<MatchCandidate>,
    #[serde(default)]
    tolerance: MatchTolerance,
}

#[derive(Debug, Serialize)]
struct ScoreOutput {
    score: ConfidenceScore,
    route: Route,
    balance_error: Option<String>,
}

/// Installs the stderr log subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Executes the parsed command.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, an input is
/// malformed, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Score(args) => run_score(&args.input),
        Command::Match(args) => run_match(&args.input),
        command => {
            let store = SqliteLedgerStore::open(&cli.db)?;
            store.migrate()?;
            run_with_store(command, store, &cli.db)
        }
    }
}

fn run_with_store(command: Command, store: SqliteLedgerStore, db: &Path) -> Result<()> {
    match command {
        Command::Migrate => print_json(&json!({
            "db": db.display().to_string(),
            "schema_version": autoledger_store_sqlite::LEDGER_SCHEMA_VERSION,
        })),
        Command::Event { command } => match command {
            EventCommand::Submit(args) => {
                let event = store.append_event(&NewEvent {
                    tenant: TenantId::new(args.tenant),
                    kind: map_event_kind(args.kind),
                    payload: parse_payload_json(&args.payload_json)?,
                })?;
                print_json(&event)
            }
            EventCommand::List(args) => {
                let events = store.list_events(args.status.map(map_event_status))?;
                print_json(&events)
            }
        },
        Command::Run(args) => {
            let config = match &args.config {
                Some(path) => EngineConfig::load(path)?,
                None => EngineConfig::default(),
            };
            let summary = run_orchestrator(Arc::new(store), config, args.once)?;
            print_json(&summary)
        }
        Command::Review { command } => match command {
            ReviewCommand::List(args) => {
                let items = store.list_review_items(
                    &TenantId::new(args.tenant),
                    args.status.map(map_review_status),
                )?;
                print_json(&items)
            }
        },
        Command::Pattern { command } => match command {
            PatternCommand::List => print_json(&store.list_patterns()?),
        },
        Command::Period { command } => match command {
            PeriodCommand::Lock(args) => {
                let tenant = TenantId::new(args.tenant);
                let period = AccountingPeriod::parse(&args.period)?;
                store.lock_period(&tenant, period)?;
                info!(tenant = %tenant, period = %period, "period locked");
                print_json(&json!({
                    "tenant": tenant,
                    "period": period.to_string(),
                    "locked": true,
                }))
            }
        },
        Command::Entry { command } => match command {
            EntryCommand::List(args) => {
                print_json(&store.list_entries(&TenantId::new(args.tenant))?)
            }
            EntryCommand::Reverse(args) => {
                let entry_id: EntryId = args
                    .entry_id
                    .parse()
                    .map_err(|_| anyhow!("invalid entry id: {}", args.entry_id))?;
                let date = parse_date(&args.date)?;
                let reversal = BookingValidator::new(&store).reverse(
                    &TenantId::new(args.tenant),
                    entry_id,
                    date,
                )?;
                print_json(&reversal)
            }
        },
        Command::Task { command } => match command {
            TaskCommand::List(args) => {
                let tenant = args.tenant.map(TenantId::new);
                print_json(&store.list_tasks(tenant.as_ref())?)
            }
            TaskCommand::Finish(args) => {
                let task_id: TaskId = args
                    .task_id
                    .parse()
                    .map_err(|_| anyhow!("invalid task id: {}", args.task_id))?;
                let status = match args.status {
                    TaskOutcomeArg::Completed => TaskStatus::Completed,
                    TaskOutcomeArg::Aborted => TaskStatus::Aborted,
                };
                store.finish_task(task_id, status, args.note.as_deref())?;
                print_json(&json!({
                    "task_id": task_id.to_string(),
                    "status": status.as_str(),
                }))
            }
        },
        Command::Score(args) => run_score(&args.input),
        Command::Match(args) => run_match(&args.input),
    }
}

fn run_orchestrator(
    store: Arc<SqliteLedgerStore>,
    config: EngineConfig,
    once: bool,
) -> Result<autoledger_engine::RunSummary> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(async move {
        let orchestrator = Orchestrator::new(store, config)?;
        if once {
            return orchestrator.drain().await;
        }

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received shutdown signal");
            }
            signal.cancel();
        });
        orchestrator.run(shutdown).await
    })
}

fn run_score(input: &Path) -> Result<()> {
    let fixture: ScoreInput = read_fixture(input)?;
    fixture.scoring.validate()?;
    fixture.routing.validate()?;

    let booking = parse_suggestion_value(&fixture.suggestion)?;
    let tenant = fixture
        .tenant
        .clone()
        .unwrap_or_else(|| TenantId::new("default"));
    let applicable: Vec<&Pattern> = fixture
        .patterns
        .iter()
        .filter(|pattern| pattern.is_applicable(&tenant, &fixture.document))
        .collect();

    let mut score = score_booking(
        &booking,
        &fixture.document,
        &fixture.history,
        &applicable,
        &fixture.scoring,
    );
    let balance_error = match check_balance(&booking.lines) {
        Ok(_) => None,
        Err(err) => {
            score = score.capped(UNBALANCED_CONFIDENCE_CAP, "unbalanced");
            Some(err.to_string())
        }
    };
    let route = match (&balance_error, fixture.routing.route(score.score)) {
        (Some(_), Route::AutoPost) => Route::Review(ReviewPriority::High),
        (_, route) => route,
    };

    print_json(&ScoreOutput {
        score,
        route,
        balance_error,
    })
}

fn run_match(input: &Path) -> Result<()> {
    let fixture: MatchInput = read_fixture(input)?;
    fixture.tolerance.validate()?;
    let report = match_all(&fixture.transaction, &fixture.candidates, &fixture.tolerance);
    print_json(&report)
}

fn read_fixture<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read input {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("invalid input JSON in {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_payload_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("payload_json must be valid JSON: {raw}"))
}

fn map_event_kind(value: EventKindArg) -> EventKind {
    match value {
        EventKindArg::InvoiceReceived => EventKind::InvoiceReceived,
        EventKindArg::InvoiceParsed => EventKind::InvoiceParsed,
        EventKindArg::BookingCompleted => EventKind::BookingCompleted,
        EventKindArg::CorrectionReceived => EventKind::CorrectionReceived,
        EventKindArg::PeriodClosing => EventKind::PeriodClosing,
        EventKindArg::BankTransactionImported => EventKind::BankTransactionImported,
    }
}

fn map_event_status(value: EventStatusArg) -> EventStatus {
    match value {
        EventStatusArg::Unprocessed => EventStatus::Unprocessed,
        EventStatusArg::Processing => EventStatus::Processing,
        EventStatusArg::Processed => EventStatus::Processed,
        EventStatusArg::DeadLettered => EventStatus::DeadLettered,
    }
}

fn map_review_status(value: ReviewStatusArg) -> ReviewStatus {
    match value {
        ReviewStatusArg::Pending => ReviewStatus::Pending,
        ReviewStatusArg::Resolved => ReviewStatus::Resolved,
    }
}
