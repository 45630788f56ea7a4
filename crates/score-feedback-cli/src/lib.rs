use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use score_feedback_core::{
    parse_iso_date, CrmOpportunity, CrmSource, FeedbackError, OutcomeState, SnapshotInput,
};
use score_feedback_store_sqlite::SqliteFeedbackStore;
use serde_json::json;
use time::Date;
use ulid::Ulid;

/// Opportunity scoring feedback loop over a local sqlite database.
#[derive(Debug, Parser)]
#[command(name = "osf", version, about)]
pub struct Cli {
    /// Path to the sqlite database file.
    #[arg(long, global = true, default_value = "feedback.sqlite3")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Record and inspect dated scoring snapshots.
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    /// Resolve open opportunities against an upstream CRM export.
    Reconcile {
        /// Reconciliation date, YYYY-MM-DD.
        #[arg(long, value_parser = parse_date_arg)]
        as_of: Date,
        /// JSON file with an array of CRM opportunity records.
        #[arg(long)]
        source: PathBuf,
    },
    /// Compute an accuracy report for a configuration over a window.
    Analyze {
        #[arg(long, value_parser = parse_ulid_arg)]
        config: Option<Ulid>,
        #[arg(long, value_parser = parse_date_arg)]
        window_start: Date,
        #[arg(long, value_parser = parse_date_arg)]
        window_end: Date,
    },
    /// Overwrite a terminal outcome through the explicit correction path.
    Correct {
        #[arg(long)]
        opportunity: String,
        #[arg(long, value_parser = parse_outcome_arg)]
        outcome: OutcomeState,
        #[arg(long, value_parser = parse_date_arg)]
        resolved_date: Option<Date>,
        #[arg(long, default_value_t = 0.0)]
        final_value: f64,
    },
    /// Manage weight configurations.
    Weights {
        #[command(subcommand)]
        command: WeightsCommand,
    },
    /// Score one window under two configurations and apply the promotion rule.
    AbTest {
        /// Defaults to the active configuration.
        #[arg(long, value_parser = parse_ulid_arg)]
        incumbent: Option<Ulid>,
        #[arg(long, value_parser = parse_ulid_arg)]
        candidate: Ulid,
        #[arg(long, value_parser = parse_date_arg)]
        window_start: Date,
        #[arg(long, value_parser = parse_date_arg)]
        window_end: Date,
        /// Promote immediately when the decision is promote.
        #[arg(long)]
        promote: bool,
    },
    /// Promote a candidate configuration to active.
    Promote {
        #[arg(long, value_parser = parse_ulid_arg)]
        candidate: Ulid,
        /// Fail unless the active pointer is still at this version.
        #[arg(long)]
        expected_version: Option<i64>,
    },
    /// Summary counters for the whole store.
    Status,
    /// Invariant checks; exits 2 when unhealthy.
    Check,
}

#[derive(Debug, Subcommand)]
pub enum SnapshotCommand {
    /// Record one snapshot; a same-day snapshot for the opportunity is
    /// overwritten.
    Record {
        #[arg(long)]
        opportunity: String,
        #[arg(long, value_parser = parse_date_arg)]
        date: Date,
        /// Repeated factor=score pairs, each score in [0,1].
        #[arg(long = "component", value_parser = parse_key_value, required = true)]
        components: Vec<(String, f64)>,
        /// Repeated key=value raw inputs kept for audit.
        #[arg(long = "raw", value_parser = parse_key_value)]
        raw_inputs: Vec<(String, f64)>,
        /// Defaults to the active configuration.
        #[arg(long, value_parser = parse_ulid_arg)]
        config: Option<Ulid>,
    },
    /// List all snapshots for an opportunity, oldest first.
    List {
        #[arg(long)]
        opportunity: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum WeightsCommand {
    /// Add a manual candidate configuration from factor=weight pairs.
    Add {
        #[arg(long = "weight", value_parser = parse_key_value, required = true)]
        weights: Vec<(String, f64)>,
    },
    /// Analyze a window and derive a step-bounded candidate configuration.
    Propose {
        /// Defaults to the active configuration.
        #[arg(long, value_parser = parse_ulid_arg)]
        config: Option<Ulid>,
        #[arg(long, value_parser = parse_date_arg)]
        window_start: Date,
        #[arg(long, value_parser = parse_date_arg)]
        window_end: Date,
    },
    /// List every configuration, oldest first.
    List,
    /// Show one configuration.
    Show {
        #[arg(long, value_parser = parse_ulid_arg)]
        id: Ulid,
    },
}

/// CRM export on disk: a JSON array of opportunity records. An opportunity
/// absent from the file is treated as vanished upstream.
pub struct JsonCrmSource {
    records: BTreeMap<String, CrmOpportunity>,
}

impl JsonCrmSource {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read CRM export at {}", path.display()))?;
        let records: Vec<CrmOpportunity> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid CRM export at {}", path.display()))?;

        Ok(Self {
            records: records
                .into_iter()
                .map(|record| (record.opportunity_id.clone(), record))
                .collect(),
        })
    }
}

impl CrmSource for JsonCrmSource {
    fn fetch_opportunity(
        &self,
        opportunity_id: &str,
    ) -> Result<Option<CrmOpportunity>, FeedbackError> {
        Ok(self.records.get(opportunity_id).cloned())
    }
}

#[must_use]
pub fn run() -> ExitCode {
    let cli = Cli::parse();
    match execute(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn execute(cli: &Cli) -> Result<ExitCode> {
    let mut store = SqliteFeedbackStore::open(&cli.db)?;
    store.migrate()?;

    match &cli.command {
        Command::Snapshot { command } => run_snapshot(&mut store, command),
        Command::Reconcile { as_of, source } => {
            let crm = JsonCrmSource::load(source)?;
            let summary = store.reconcile(*as_of, &crm)?;
            print_json(&summary)?;
            if summary.is_partial() {
                return Ok(ExitCode::from(2));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Analyze {
            config,
            window_start,
            window_end,
        } => {
            let configuration_id = resolve_configuration(&store, *config)?;
            let report = store.analyze(configuration_id, *window_start, *window_end)?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Correct {
            opportunity,
            outcome,
            resolved_date,
            final_value,
        } => {
            let corrected =
                store.record_correction(opportunity, *outcome, *resolved_date, *final_value)?;
            print_json(&corrected)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Weights { command } => run_weights(&mut store, command),
        Command::AbTest {
            incumbent,
            candidate,
            window_start,
            window_end,
            promote,
        } => {
            let incumbent_id = resolve_configuration(&store, *incumbent)?;
            let (run, promotion) =
                store.run_ab_test(incumbent_id, *candidate, *window_start, *window_end, *promote)?;
            print_json(&json!({ "run": run, "promotion": promotion }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Promote {
            candidate,
            expected_version,
        } => {
            let promotion = store.promote_configuration(*candidate, *expected_version)?;
            print_json(&promotion)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            print_json(&store.status()?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => {
            let check = store.check()?;
            print_json(&check)?;
            if check.healthy {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(2))
            }
        }
    }
}

fn run_snapshot(store: &mut SqliteFeedbackStore, command: &SnapshotCommand) -> Result<ExitCode> {
    match command {
        SnapshotCommand::Record {
            opportunity,
            date,
            components,
            raw_inputs,
            config,
        } => {
            let configuration_id = resolve_configuration(store, *config)?;
            let input = SnapshotInput {
                opportunity_id: opportunity.clone(),
                snapshot_date: *date,
                component_scores: components.iter().cloned().collect(),
                raw_inputs: raw_inputs.iter().cloned().collect(),
                weight_configuration_id: configuration_id,
            };
            let snapshot = store.record_snapshot(&input)?;
            print_json(&snapshot)?;
            Ok(ExitCode::SUCCESS)
        }
        SnapshotCommand::List { opportunity } => {
            print_json(&store.get_snapshots(opportunity)?)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_weights(store: &mut SqliteFeedbackStore, command: &WeightsCommand) -> Result<ExitCode> {
    match command {
        WeightsCommand::Add { weights } => {
            let configuration = store.insert_configuration(
                weights.iter().cloned().collect(),
                score_feedback_core::ConfigProvenance::Manual,
                score_feedback_core::ConfigStatus::Candidate,
            )?;
            print_json(&configuration)?;
            Ok(ExitCode::SUCCESS)
        }
        WeightsCommand::Propose {
            config,
            window_start,
            window_end,
        } => {
            let configuration_id = resolve_configuration(store, *config)?;
            let (report, candidate) =
                store.propose_weights(configuration_id, *window_start, *window_end)?;
            print_json(&json!({ "report": report, "candidate": candidate }))?;
            Ok(ExitCode::SUCCESS)
        }
        WeightsCommand::List => {
            print_json(&store.list_configurations()?)?;
            Ok(ExitCode::SUCCESS)
        }
        WeightsCommand::Show { id } => {
            let configuration = store.get_configuration(*id)?.ok_or_else(|| {
                FeedbackError::Validation(format!("unknown weight configuration {id}"))
            })?;
            print_json(&configuration)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn resolve_configuration(store: &SqliteFeedbackStore, explicit: Option<Ulid>) -> Result<Ulid> {
    match explicit {
        Some(id) => Ok(id),
        None => {
            let (active, _) = store.active_configuration()?;
            Ok(active.id)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(value).context("failed to serialize command output")?;
    println!("{rendered}");
    Ok(())
}

fn parse_key_value(raw: &str) -> Result<(String, f64), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty name in '{raw}'"));
    }
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|err| format!("invalid value for {key}: {err}"))?;
    Ok((key.to_string(), parsed))
}

fn parse_date_arg(raw: &str) -> Result<Date, String> {
    parse_iso_date(raw).map_err(|err| err.to_string())
}

fn parse_ulid_arg(raw: &str) -> Result<Ulid, String> {
    Ulid::from_string(raw).map_err(|err| format!("invalid configuration id '{raw}': {err}"))
}

fn parse_outcome_arg(raw: &str) -> Result<OutcomeState, String> {
    OutcomeState::parse(raw).ok_or_else(|| format!("expected won, lost or open, got '{raw}'"))
}
