#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use score_feedback_core::{
    analyze_observations, composite_score, days_between, decide_promotion, format_iso_date,
    format_rfc3339, now_utc, parse_iso_date, parse_rfc3339_utc, propose_weights, AbDecision,
    AbTestRun, AccuracyReport, ConfigProvenance, ConfigStatus, CrmSource, CrmStage, FeedbackError,
    FeedbackPolicy, MatchedObservation, OpportunityOutcome, OpportunitySnapshot, OutcomeState,
    SegmentCounts, SnapshotInput, WeightConfiguration,
};
use serde_json::Value;
use time::{Date, OffsetDateTime};
use ulid::Ulid;

const FEEDBACK_MIGRATION_VERSION: i64 = 1;

const SCHEMA_FEEDBACK_V1: &str = r"
CREATE TABLE IF NOT EXISTS feedback_policies (
  policy_version INTEGER PRIMARY KEY,
  policy_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS weight_configurations (
  id TEXT PRIMARY KEY,
  weights_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  created_from TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('candidate', 'active', 'retired'))
);

CREATE TRIGGER IF NOT EXISTS trg_weight_configurations_no_delete
BEFORE DELETE ON weight_configurations
BEGIN
  SELECT RAISE(FAIL, 'weight_configurations is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_weight_configurations_immutable
BEFORE UPDATE OF id, weights_json, created_at, created_from ON weight_configurations
BEGIN
  SELECT RAISE(FAIL, 'weight_configurations rows are immutable except status');
END;

CREATE TABLE IF NOT EXISTS active_configuration (
  slot INTEGER PRIMARY KEY CHECK (slot = 1),
  configuration_id TEXT NOT NULL REFERENCES weight_configurations(id),
  cas_version INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS opportunity_snapshots (
  opportunity_id TEXT NOT NULL,
  snapshot_date TEXT NOT NULL,
  weight_configuration_id TEXT NOT NULL REFERENCES weight_configurations(id),
  composite_score REAL NOT NULL CHECK (composite_score BETWEEN 0.0 AND 1.0),
  component_scores_json TEXT NOT NULL,
  raw_inputs_json TEXT NOT NULL DEFAULT '{}',
  recorded_at TEXT NOT NULL,
  PRIMARY KEY (opportunity_id, snapshot_date)
);

CREATE TRIGGER IF NOT EXISTS trg_opportunity_snapshots_no_delete
BEFORE DELETE ON opportunity_snapshots
BEGIN
  SELECT RAISE(FAIL, 'opportunity_snapshots is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_snapshots_config_date
  ON opportunity_snapshots(weight_configuration_id, snapshot_date);

CREATE TABLE IF NOT EXISTS opportunity_outcomes (
  opportunity_id TEXT PRIMARY KEY,
  outcome TEXT NOT NULL CHECK (outcome IN ('won', 'lost', 'open')),
  resolved_date TEXT,
  final_value REAL NOT NULL DEFAULT 0.0,
  days_open INTEGER,
  created_date TEXT NOT NULL,
  data_quality_flag INTEGER NOT NULL DEFAULT 0 CHECK (data_quality_flag IN (0, 1)),
  corrected INTEGER NOT NULL DEFAULT 0 CHECK (corrected IN (0, 1)),
  updated_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_opportunity_outcomes_no_delete
BEFORE DELETE ON opportunity_outcomes
BEGIN
  SELECT RAISE(FAIL, 'opportunity_outcomes is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_outcomes_state
  ON opportunity_outcomes(outcome);

CREATE TABLE IF NOT EXISTS accuracy_reports (
  id TEXT PRIMARY KEY,
  weight_configuration_id TEXT NOT NULL REFERENCES weight_configurations(id),
  window_start TEXT NOT NULL,
  window_end TEXT NOT NULL,
  precision REAL NOT NULL,
  recall REAL NOT NULL,
  f1 REAL NOT NULL,
  sample_size INTEGER NOT NULL,
  pending_count INTEGER NOT NULL,
  low_confidence INTEGER NOT NULL CHECK (low_confidence IN (0, 1)),
  segment_json TEXT NOT NULL,
  generated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ab_test_runs (
  id TEXT PRIMARY KEY,
  incumbent_configuration_id TEXT NOT NULL REFERENCES weight_configurations(id),
  candidate_configuration_id TEXT NOT NULL REFERENCES weight_configurations(id),
  window_start TEXT NOT NULL,
  window_end TEXT NOT NULL,
  incumbent_report_id TEXT NOT NULL REFERENCES accuracy_reports(id),
  candidate_report_id TEXT NOT NULL REFERENCES accuracy_reports(id),
  decision TEXT NOT NULL CHECK (decision IN ('promote', 'reject', 'inconclusive')),
  executed_at TEXT NOT NULL
);
";

pub struct SqliteFeedbackStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
pub struct SkippedOpportunity {
    pub opportunity_id: String,
    pub reason: String,
}

/// Aggregate result of one reconciliation batch. Per-item failures land in
/// `skipped` instead of aborting the run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ReconcileSummary {
    pub contract_version: String,
    pub as_of: Date,
    pub examined: usize,
    pub resolved_won: usize,
    pub resolved_lost: usize,
    pub flagged_missing: usize,
    pub still_open: usize,
    pub updated: usize,
    pub skipped: Vec<SkippedOpportunity>,
}

impl ReconcileSummary {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct PromotionRecord {
    pub contract_version: String,
    pub promoted_configuration_id: Ulid,
    pub retired_configuration_id: Ulid,
    pub cas_version: i64,
    pub promoted_at: OffsetDateTime,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StoreStatus {
    pub contract_version: String,
    pub snapshot_count: usize,
    pub opportunity_count: usize,
    pub open_outcomes: usize,
    pub won_outcomes: usize,
    pub lost_outcomes: usize,
    pub flagged_outcomes: usize,
    pub candidate_configurations: usize,
    pub active_configurations: usize,
    pub retired_configurations: usize,
    pub active_configuration_id: Option<Ulid>,
    pub cas_version: Option<i64>,
    pub unresolved_with_snapshots: usize,
    pub report_count: usize,
    pub ab_run_count: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
pub struct StoreIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StoreCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub status: StoreStatus,
    pub issues: Vec<StoreIssue>,
}

/// The original production weight set; seeded as the first Active
/// configuration on a fresh database.
#[must_use]
pub fn default_seed_weights() -> BTreeMap<String, f64> {
    [
        ("speed", 0.15),
        ("deal_size", 0.20),
        ("product_mix", 0.15),
        ("upsell", 0.25),
        ("win_rate", 0.20),
        ("recency", 0.05),
    ]
    .into_iter()
    .map(|(factor, weight)| (factor.to_string(), weight))
    .collect()
}

impl SqliteFeedbackStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_FEEDBACK_V1)
            .context("failed to apply feedback schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![FEEDBACK_MIGRATION_VERSION, now],
            )
            .context("failed to register feedback schema migration")?;

        let policy = FeedbackPolicy::v1();
        let payload = serde_json::to_string(&policy).context("failed to serialize policy")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO feedback_policies(policy_version, policy_json, created_at)
                 VALUES (?1, ?2, ?3)",
                params![i64::from(policy.policy_version), payload, now],
            )
            .context("failed to seed policy v1")?;

        self.seed_default_configuration()?;

        Ok(())
    }

    fn seed_default_configuration(&mut self) -> Result<()> {
        let configured: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM weight_configurations", [], |row| {
                row.get(0)
            })
            .context("failed to count weight configurations")?;
        if configured > 0 {
            return Ok(());
        }

        let seed = self.insert_configuration(
            default_seed_weights(),
            ConfigProvenance::Manual,
            ConfigStatus::Active,
        )?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO active_configuration(slot, configuration_id, cas_version, updated_at)
                 VALUES (1, ?1, 1, ?2)",
                params![seed.id.to_string(), now],
            )
            .context("failed to initialize active configuration pointer")?;

        Ok(())
    }

    pub fn upsert_policy(&self, policy: &FeedbackPolicy) -> Result<()> {
        policy
            .validate()
            .map_err(|err| anyhow!("invalid feedback policy: {err}"))?;

        let payload = serde_json::to_string(policy).context("failed to serialize policy")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO feedback_policies(policy_version, policy_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(policy_version) DO UPDATE SET
                   policy_json = excluded.policy_json,
                   created_at = excluded.created_at",
                params![i64::from(policy.policy_version), payload, now],
            )
            .context("failed to upsert policy")?;

        Ok(())
    }

    pub fn get_policies(&self) -> Result<BTreeMap<u32, FeedbackPolicy>> {
        let mut stmt = self.conn.prepare(
            "SELECT policy_version, policy_json FROM feedback_policies ORDER BY policy_version ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();

        while let Some(row) = rows.next()? {
            let version_i64: i64 = row.get(0)?;
            let version = u32::try_from(version_i64)
                .with_context(|| format!("invalid policy_version: {version_i64}"))?;
            let json: String = row.get(1)?;
            let value: Value = serde_json::from_str(&json).context("invalid stored policy JSON")?;
            let policy = FeedbackPolicy::from_json(&value)
                .map_err(|err| anyhow!("failed to parse policy {version}: {err}"))?;
            map.insert(version, policy);
        }

        Ok(map)
    }

    /// Highest-versioned policy; jobs run under this unless told otherwise.
    pub fn latest_policy(&self) -> Result<FeedbackPolicy> {
        let policies = self.get_policies()?;
        policies
            .into_iter()
            .next_back()
            .map(|(_, policy)| policy)
            .ok_or_else(|| anyhow!("no feedback policy is configured"))
    }

    pub fn insert_configuration(
        &mut self,
        weights: BTreeMap<String, f64>,
        created_from: ConfigProvenance,
        status: ConfigStatus,
    ) -> Result<WeightConfiguration> {
        let configuration = WeightConfiguration {
            id: Ulid::new(),
            weights,
            created_at: now_utc(),
            created_from,
            status,
        };
        configuration
            .validate()
            .map_err(|err| anyhow!("invalid weight configuration: {err}"))?;

        let weights_json = serde_json::to_string(&configuration.weights)
            .context("failed to serialize weights")?;

        self.conn
            .execute(
                "INSERT INTO weight_configurations(id, weights_json, created_at, created_from, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    configuration.id.to_string(),
                    weights_json,
                    format_rfc3339(configuration.created_at)
                        .map_err(|err| anyhow!(err.to_string()))?,
                    configuration.created_from.as_string(),
                    configuration.status.as_str(),
                ],
            )
            .context("failed to insert weight configuration")?;

        Ok(configuration)
    }

    pub fn get_configuration(&self, id: Ulid) -> Result<Option<WeightConfiguration>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, weights_json, created_at, created_from, status
             FROM weight_configurations
             WHERE id = ?1",
        )?;

        let row = stmt
            .query_row(params![id.to_string()], parse_configuration_row)
            .optional()?;

        Ok(row)
    }

    pub fn list_configurations(&self) -> Result<Vec<WeightConfiguration>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, weights_json, created_at, created_from, status
             FROM weight_configurations
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([], parse_configuration_row)?;
        collect_rows(rows)
    }

    /// The single Active configuration plus the CAS version of the pointer.
    pub fn active_configuration(&self) -> Result<(WeightConfiguration, i64)> {
        let pointer = self
            .conn
            .query_row(
                "SELECT configuration_id, cas_version FROM active_configuration WHERE slot = 1",
                [],
                |row| {
                    let id_raw: String = row.get(0)?;
                    let cas_version: i64 = row.get(1)?;
                    Ok((id_raw, cas_version))
                },
            )
            .optional()
            .context("failed to read active configuration pointer")?;

        let Some((id_raw, cas_version)) = pointer else {
            return Err(anyhow!("active configuration pointer is missing"));
        };

        let id = Ulid::from_string(&id_raw)
            .map_err(|err| anyhow!("invalid active configuration id {id_raw}: {err}"))?;
        let configuration = self
            .get_configuration(id)?
            .ok_or_else(|| anyhow!("active pointer references unknown configuration {id}"))?;

        Ok((configuration, cas_version))
    }

    /// Records (or same-day overwrites) one scoring snapshot. Also ensures
    /// an Open outcome row exists for the opportunity.
    pub fn record_snapshot(&mut self, input: &SnapshotInput) -> Result<OpportunitySnapshot> {
        input.validate()?;

        let configuration = self
            .get_configuration(input.weight_configuration_id)?
            .ok_or_else(|| {
                FeedbackError::Validation(format!(
                    "unknown weight configuration {}",
                    input.weight_configuration_id
                ))
            })?;

        if configuration.status == ConfigStatus::Retired {
            return Err(FeedbackError::Validation(format!(
                "configuration {} is retired and cannot be assigned to new snapshots",
                configuration.id
            ))
            .into());
        }

        let composite = composite_score(&input.component_scores, &configuration.weights)?;
        let recorded_at = now_utc();
        let snapshot_date_raw =
            format_iso_date(input.snapshot_date).map_err(|err| anyhow!(err.to_string()))?;
        let recorded_at_raw =
            format_rfc3339(recorded_at).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start snapshot transaction")?;

        tx.execute(
            "INSERT INTO opportunity_outcomes(
                opportunity_id, outcome, final_value, created_date,
                data_quality_flag, corrected, updated_at
             ) VALUES (?1, 'open', 0.0, ?2, 0, 0, ?3)
             ON CONFLICT(opportunity_id) DO NOTHING",
            params![input.opportunity_id, snapshot_date_raw, recorded_at_raw],
        )
        .context("failed to ensure outcome row")?;

        tx.execute(
            "INSERT INTO opportunity_snapshots(
                opportunity_id, snapshot_date, weight_configuration_id,
                composite_score, component_scores_json, raw_inputs_json, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(opportunity_id, snapshot_date) DO UPDATE SET
                weight_configuration_id = excluded.weight_configuration_id,
                composite_score = excluded.composite_score,
                component_scores_json = excluded.component_scores_json,
                raw_inputs_json = excluded.raw_inputs_json,
                recorded_at = excluded.recorded_at",
            params![
                input.opportunity_id,
                snapshot_date_raw,
                input.weight_configuration_id.to_string(),
                composite,
                serde_json::to_string(&input.component_scores)
                    .context("failed to serialize component scores")?,
                serde_json::to_string(&input.raw_inputs)
                    .context("failed to serialize raw inputs")?,
                recorded_at_raw,
            ],
        )
        .context("failed to upsert snapshot")?;

        tx.commit().context("failed to commit snapshot transaction")?;

        Ok(OpportunitySnapshot {
            opportunity_id: input.opportunity_id.clone(),
            snapshot_date: input.snapshot_date,
            component_scores: input.component_scores.clone(),
            raw_inputs: input.raw_inputs.clone(),
            weight_configuration_id: input.weight_configuration_id,
            composite_score: composite,
            recorded_at,
        })
    }

    pub fn get_snapshots(&self, opportunity_id: &str) -> Result<Vec<OpportunitySnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT opportunity_id, snapshot_date, weight_configuration_id,
                    composite_score, component_scores_json, raw_inputs_json, recorded_at
             FROM opportunity_snapshots
             WHERE opportunity_id = ?1
             ORDER BY snapshot_date ASC",
        )?;

        let rows = stmt.query_map(params![opportunity_id], parse_snapshot_row)?;
        collect_rows(rows)
    }

    pub fn get_outcome(&self, opportunity_id: &str) -> Result<Option<OpportunityOutcome>> {
        let mut stmt = self.conn.prepare(
            "SELECT opportunity_id, outcome, resolved_date, final_value, days_open,
                    created_date, data_quality_flag, corrected, updated_at
             FROM opportunity_outcomes
             WHERE opportunity_id = ?1",
        )?;

        let row = stmt
            .query_row(params![opportunity_id], parse_outcome_row)
            .optional()?;

        Ok(row)
    }

    /// Reconciles every snapshotted opportunity without a terminal outcome
    /// against the upstream source. Best-effort per item: a failed lookup is
    /// retried with bounded backoff, then recorded as skipped.
    pub fn reconcile(&mut self, as_of: Date, source: &dyn CrmSource) -> Result<ReconcileSummary> {
        let policy = self.latest_policy()?;
        let pending = self.unresolved_opportunity_ids()?;

        let mut summary = ReconcileSummary {
            contract_version: "reconcile_summary.v1".to_string(),
            as_of,
            examined: pending.len(),
            resolved_won: 0,
            resolved_lost: 0,
            flagged_missing: 0,
            still_open: 0,
            updated: 0,
            skipped: Vec::new(),
        };

        for opportunity_id in pending {
            match fetch_with_retry(source, &opportunity_id, &policy) {
                Err(err) => {
                    summary.skipped.push(SkippedOpportunity {
                        opportunity_id,
                        reason: err.to_string(),
                    });
                }
                Ok(None) => {
                    // Vanished upstream: flagged Lost rather than forever Open.
                    self.apply_terminal_outcome(&opportunity_id, OutcomeState::Lost, as_of, 0.0, true, None)?;
                    summary.flagged_missing += 1;
                    summary.updated += 1;
                }
                Ok(Some(record)) => match CrmStage::parse(&record.stage) {
                    None => {
                        summary.skipped.push(SkippedOpportunity {
                            opportunity_id,
                            reason: format!("unrecognized stage: {}", record.stage),
                        });
                    }
                    Some(CrmStage::Open) => {
                        summary.still_open += 1;
                    }
                    Some(CrmStage::ClosedWon) => {
                        let resolved = record.close_date.unwrap_or(as_of);
                        let value = record.close_value.unwrap_or(0.0);
                        self.apply_terminal_outcome(
                            &opportunity_id,
                            OutcomeState::Won,
                            resolved,
                            value,
                            false,
                            Some(record.created_date),
                        )?;
                        summary.resolved_won += 1;
                        summary.updated += 1;
                    }
                    Some(CrmStage::ClosedLost) => {
                        let resolved = record.close_date.unwrap_or(as_of);
                        self.apply_terminal_outcome(
                            &opportunity_id,
                            OutcomeState::Lost,
                            resolved,
                            0.0,
                            false,
                            Some(record.created_date),
                        )?;
                        summary.resolved_lost += 1;
                        summary.updated += 1;
                    }
                },
            }
        }

        Ok(summary)
    }

    /// Explicit correction pass: the only path allowed to overwrite a
    /// terminal outcome. The row is flagged `corrected`, never silently
    /// replaced.
    pub fn record_correction(
        &mut self,
        opportunity_id: &str,
        outcome: OutcomeState,
        resolved_date: Option<Date>,
        final_value: f64,
    ) -> Result<OpportunityOutcome> {
        if outcome == OutcomeState::Open && resolved_date.is_some() {
            return Err(FeedbackError::Validation(
                "an Open correction cannot carry a resolved_date".to_string(),
            )
            .into());
        }
        if outcome.is_terminal() && resolved_date.is_none() {
            return Err(FeedbackError::Validation(
                "a terminal correction requires a resolved_date".to_string(),
            )
            .into());
        }

        let existing = self.get_outcome(opportunity_id)?.ok_or_else(|| {
            FeedbackError::Validation(format!("unknown opportunity {opportunity_id}"))
        })?;

        let days_open = resolved_date.map(|date| days_between(existing.created_date, date));
        let updated_at = now_utc();

        self.conn
            .execute(
                "UPDATE opportunity_outcomes
                 SET outcome = ?2, resolved_date = ?3, final_value = ?4, days_open = ?5,
                     corrected = 1, updated_at = ?6
                 WHERE opportunity_id = ?1",
                params![
                    opportunity_id,
                    outcome.as_str(),
                    resolved_date
                        .map(format_iso_date)
                        .transpose()
                        .map_err(|err| anyhow!(err.to_string()))?,
                    final_value,
                    days_open,
                    format_rfc3339(updated_at).map_err(|err| anyhow!(err.to_string()))?,
                ],
            )
            .context("failed to apply outcome correction")?;

        Ok(OpportunityOutcome {
            opportunity_id: opportunity_id.to_string(),
            outcome,
            resolved_date,
            final_value,
            days_open,
            created_date: existing.created_date,
            data_quality_flag: existing.data_quality_flag,
            corrected: true,
            updated_at,
        })
    }

    /// Latest snapshot per opportunity inside the window for the given
    /// configuration, joined to its outcome. Outcomes resolved after
    /// `window_end` count as pending for this window.
    pub fn matched_observations(
        &self,
        configuration_id: Ulid,
        window_start: Date,
        window_end: Date,
    ) -> Result<Vec<MatchedObservation>> {
        let start_raw = format_iso_date(window_start).map_err(|err| anyhow!(err.to_string()))?;
        let end_raw = format_iso_date(window_end).map_err(|err| anyhow!(err.to_string()))?;

        let mut stmt = self.conn.prepare(
            "SELECT latest.opportunity_id,
                    latest.snapshot_date,
                    snapshots.composite_score,
                    snapshots.component_scores_json,
                    CASE
                      WHEN outcomes.outcome IS NOT NULL
                       AND outcomes.outcome != 'open'
                       AND outcomes.resolved_date <= ?3
                      THEN outcomes.outcome
                      ELSE 'open'
                    END AS window_outcome
             FROM (
                SELECT opportunity_id, MAX(snapshot_date) AS snapshot_date
                FROM opportunity_snapshots
                WHERE weight_configuration_id = ?1
                  AND snapshot_date BETWEEN ?2 AND ?3
                GROUP BY opportunity_id
             ) latest
             JOIN opportunity_snapshots snapshots
               ON snapshots.opportunity_id = latest.opportunity_id
              AND snapshots.snapshot_date = latest.snapshot_date
             LEFT JOIN opportunity_outcomes outcomes
               ON outcomes.opportunity_id = latest.opportunity_id
             ORDER BY latest.opportunity_id ASC",
        )?;

        let rows = stmt.query_map(
            params![configuration_id.to_string(), start_raw, end_raw],
            |row| {
                let opportunity_id: String = row.get(0)?;
                let snapshot_date_raw: String = row.get(1)?;
                let composite: f64 = row.get(2)?;
                let components_json: String = row.get(3)?;
                let outcome_raw: String = row.get(4)?;

                let snapshot_date =
                    parse_iso_date(&snapshot_date_raw).map_err(to_sql_error)?;
                let component_scores: BTreeMap<String, f64> =
                    serde_json::from_str(&components_json).map_err(|err| {
                        to_sql_error(FeedbackError::Validation(format!(
                            "invalid component_scores_json: {err}"
                        )))
                    })?;
                let outcome = OutcomeState::parse(&outcome_raw).ok_or_else(|| {
                    to_sql_error(FeedbackError::Validation(format!(
                        "invalid outcome: {outcome_raw}"
                    )))
                })?;

                Ok(MatchedObservation {
                    opportunity_id,
                    snapshot_date,
                    composite_score: composite,
                    component_scores,
                    outcome,
                })
            },
        )?;

        collect_rows(rows)
    }

    /// Runs the accuracy analyzer for one configuration and window, persists
    /// the report, and returns it.
    pub fn analyze(
        &mut self,
        configuration_id: Ulid,
        window_start: Date,
        window_end: Date,
    ) -> Result<AccuracyReport> {
        let policy = self.latest_policy()?;

        if self.get_configuration(configuration_id)?.is_none() {
            return Err(FeedbackError::Validation(format!(
                "unknown weight configuration {configuration_id}"
            ))
            .into());
        }

        let observations = self.matched_observations(configuration_id, window_start, window_end)?;
        let report = analyze_observations(
            Ulid::new(),
            configuration_id,
            window_start,
            window_end,
            &observations,
            &policy,
            now_utc(),
        )?;

        self.insert_report(&report)?;
        Ok(report)
    }

    pub fn get_report(&self, id: Ulid) -> Result<Option<AccuracyReport>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, weight_configuration_id, window_start, window_end,
                    precision, recall, f1, sample_size, pending_count,
                    low_confidence, segment_json, generated_at
             FROM accuracy_reports
             WHERE id = ?1",
        )?;

        let row = stmt
            .query_row(params![id.to_string()], parse_report_row)
            .optional()?;

        Ok(row)
    }

    /// Runs the refinement engine: analyze the window, derive a Candidate
    /// configuration, persist both.
    pub fn propose_weights(
        &mut self,
        configuration_id: Ulid,
        window_start: Date,
        window_end: Date,
    ) -> Result<(AccuracyReport, WeightConfiguration)> {
        let policy = self.latest_policy()?;
        let current = self.get_configuration(configuration_id)?.ok_or_else(|| {
            FeedbackError::Validation(format!(
                "unknown weight configuration {configuration_id}"
            ))
        })?;

        let observations = self.matched_observations(configuration_id, window_start, window_end)?;
        let report = analyze_observations(
            Ulid::new(),
            configuration_id,
            window_start,
            window_end,
            &observations,
            &policy,
            now_utc(),
        )?;
        self.insert_report(&report)?;

        let candidate = propose_weights(
            &report,
            &observations,
            &current,
            &policy,
            Ulid::new(),
            now_utc(),
        )?;

        let weights_json =
            serde_json::to_string(&candidate.weights).context("failed to serialize weights")?;
        self.conn
            .execute(
                "INSERT INTO weight_configurations(id, weights_json, created_at, created_from, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    candidate.id.to_string(),
                    weights_json,
                    format_rfc3339(candidate.created_at).map_err(|err| anyhow!(err.to_string()))?,
                    candidate.created_from.as_string(),
                    candidate.status.as_str(),
                ],
            )
            .context("failed to insert candidate configuration")?;

        Ok((report, candidate))
    }

    /// Scores the same matched population under both configurations and
    /// applies the promotion decision rule. With `auto_promote`, a Promote
    /// decision flips the active pointer through the CAS path.
    pub fn run_ab_test(
        &mut self,
        incumbent_id: Ulid,
        candidate_id: Ulid,
        window_start: Date,
        window_end: Date,
        auto_promote: bool,
    ) -> Result<(AbTestRun, Option<PromotionRecord>)> {
        let policy = self.latest_policy()?;
        let candidate = self.get_configuration(candidate_id)?.ok_or_else(|| {
            FeedbackError::Validation(format!("unknown candidate configuration {candidate_id}"))
        })?;
        // Checked before the run row is written; promotion would otherwise
        // fail after the reports and run were already persisted.
        if auto_promote && candidate.status != ConfigStatus::Candidate {
            return Err(FeedbackError::Validation(format!(
                "configuration {candidate_id} has status {} and cannot be auto-promoted",
                candidate.status.as_str()
            ))
            .into());
        }
        if self.get_configuration(incumbent_id)?.is_none() {
            return Err(FeedbackError::Validation(format!(
                "unknown incumbent configuration {incumbent_id}"
            ))
            .into());
        }

        let incumbent_observations =
            self.matched_observations(incumbent_id, window_start, window_end)?;

        // Same sample scored twice: only the composite is re-derived under
        // the candidate weights.
        let mut candidate_observations = Vec::with_capacity(incumbent_observations.len());
        for observation in &incumbent_observations {
            let rescored = composite_score(&observation.component_scores, &candidate.weights)?;
            let mut rescored_observation = observation.clone();
            rescored_observation.composite_score = rescored;
            candidate_observations.push(rescored_observation);
        }

        let executed_at = now_utc();
        let incumbent_report = analyze_observations(
            Ulid::new(),
            incumbent_id,
            window_start,
            window_end,
            &incumbent_observations,
            &policy,
            executed_at,
        )?;
        let candidate_report = analyze_observations(
            Ulid::new(),
            candidate_id,
            window_start,
            window_end,
            &candidate_observations,
            &policy,
            executed_at,
        )?;

        self.insert_report(&incumbent_report)?;
        self.insert_report(&candidate_report)?;

        let decision = decide_promotion(&incumbent_report, &candidate_report, &policy);

        let run = AbTestRun {
            id: Ulid::new(),
            incumbent_configuration_id: incumbent_id,
            candidate_configuration_id: candidate_id,
            window_start,
            window_end,
            incumbent_report,
            candidate_report,
            decision,
            executed_at,
        };

        self.conn
            .execute(
                "INSERT INTO ab_test_runs(
                    id, incumbent_configuration_id, candidate_configuration_id,
                    window_start, window_end, incumbent_report_id, candidate_report_id,
                    decision, executed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.id.to_string(),
                    incumbent_id.to_string(),
                    candidate_id.to_string(),
                    format_iso_date(window_start).map_err(|err| anyhow!(err.to_string()))?,
                    format_iso_date(window_end).map_err(|err| anyhow!(err.to_string()))?,
                    run.incumbent_report.id.to_string(),
                    run.candidate_report.id.to_string(),
                    decision.as_str(),
                    format_rfc3339(executed_at).map_err(|err| anyhow!(err.to_string()))?,
                ],
            )
            .context("failed to insert ab test run")?;

        let promotion = if auto_promote && decision == AbDecision::Promote {
            Some(self.promote_configuration(candidate_id, None)?)
        } else {
            None
        };

        Ok((run, promotion))
    }

    /// Promotes a Candidate to Active, retiring the previous Active, in one
    /// transaction guarded by a compare-and-swap on the pointer version.
    pub fn promote_configuration(
        &mut self,
        candidate_id: Ulid,
        expected_version: Option<i64>,
    ) -> Result<PromotionRecord> {
        let promoted_at = now_utc();
        let promoted_at_raw =
            format_rfc3339(promoted_at).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start promotion transaction")?;

        let pointer = tx
            .query_row(
                "SELECT configuration_id, cas_version FROM active_configuration WHERE slot = 1",
                [],
                |row| {
                    let id_raw: String = row.get(0)?;
                    let cas_version: i64 = row.get(1)?;
                    Ok((id_raw, cas_version))
                },
            )
            .optional()
            .context("failed to read active configuration pointer")?;

        let Some((active_id_raw, cas_version)) = pointer else {
            return Err(anyhow!("active configuration pointer is missing"));
        };

        if let Some(expected) = expected_version {
            if expected != cas_version {
                return Err(FeedbackError::PromotionConflict(format!(
                    "expected active pointer version {expected}, found {cas_version}"
                ))
                .into());
            }
        }

        let candidate_status: Option<String> = tx
            .query_row(
                "SELECT status FROM weight_configurations WHERE id = ?1",
                params![candidate_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read candidate status")?;

        match candidate_status.as_deref() {
            None => {
                return Err(FeedbackError::Validation(format!(
                    "unknown candidate configuration {candidate_id}"
                ))
                .into());
            }
            Some("candidate") => {}
            Some("active") => {
                return Err(FeedbackError::Validation(format!(
                    "configuration {candidate_id} is already active"
                ))
                .into());
            }
            Some(other) => {
                return Err(FeedbackError::Validation(format!(
                    "configuration {candidate_id} has status {other} and cannot be promoted"
                ))
                .into());
            }
        }

        let swapped = tx
            .execute(
                "UPDATE active_configuration
                 SET configuration_id = ?1, cas_version = cas_version + 1, updated_at = ?2
                 WHERE slot = 1 AND cas_version = ?3",
                params![candidate_id.to_string(), promoted_at_raw, cas_version],
            )
            .context("failed to swap active configuration pointer")?;

        if swapped == 0 {
            return Err(FeedbackError::PromotionConflict(format!(
                "active pointer moved past version {cas_version} during promotion"
            ))
            .into());
        }

        tx.execute(
            "UPDATE weight_configurations SET status = 'retired' WHERE id = ?1",
            params![active_id_raw],
        )
        .context("failed to retire previous active configuration")?;

        tx.execute(
            "UPDATE weight_configurations SET status = 'active' WHERE id = ?1",
            params![candidate_id.to_string()],
        )
        .context("failed to activate candidate configuration")?;

        tx.commit().context("failed to commit promotion")?;

        let retired_id = Ulid::from_string(&active_id_raw)
            .map_err(|err| anyhow!("invalid retired configuration id {active_id_raw}: {err}"))?;

        Ok(PromotionRecord {
            contract_version: "promotion.v1".to_string(),
            promoted_configuration_id: candidate_id,
            retired_configuration_id: retired_id,
            cas_version: cas_version + 1,
            promoted_at,
        })
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let snapshot_count = self.count("SELECT COUNT(*) FROM opportunity_snapshots")?;
        let opportunity_count = self.count("SELECT COUNT(*) FROM opportunity_outcomes")?;
        let open_outcomes =
            self.count("SELECT COUNT(*) FROM opportunity_outcomes WHERE outcome = 'open'")?;
        let won_outcomes =
            self.count("SELECT COUNT(*) FROM opportunity_outcomes WHERE outcome = 'won'")?;
        let lost_outcomes =
            self.count("SELECT COUNT(*) FROM opportunity_outcomes WHERE outcome = 'lost'")?;
        let flagged_outcomes = self
            .count("SELECT COUNT(*) FROM opportunity_outcomes WHERE data_quality_flag = 1")?;
        let candidate_configurations = self
            .count("SELECT COUNT(*) FROM weight_configurations WHERE status = 'candidate'")?;
        let active_configurations =
            self.count("SELECT COUNT(*) FROM weight_configurations WHERE status = 'active'")?;
        let retired_configurations =
            self.count("SELECT COUNT(*) FROM weight_configurations WHERE status = 'retired'")?;
        let unresolved_with_snapshots = self.unresolved_opportunity_ids()?.len();
        let report_count = self.count("SELECT COUNT(*) FROM accuracy_reports")?;
        let ab_run_count = self.count("SELECT COUNT(*) FROM ab_test_runs")?;

        let pointer = self
            .conn
            .query_row(
                "SELECT configuration_id, cas_version FROM active_configuration WHERE slot = 1",
                [],
                |row| {
                    let id_raw: String = row.get(0)?;
                    let cas_version: i64 = row.get(1)?;
                    Ok((id_raw, cas_version))
                },
            )
            .optional()
            .context("failed to read active configuration pointer")?;

        let (active_configuration_id, cas_version) = match pointer {
            Some((id_raw, version)) => {
                let id = Ulid::from_string(&id_raw)
                    .map_err(|err| anyhow!("invalid active configuration id: {err}"))?;
                (Some(id), Some(version))
            }
            None => (None, None),
        };

        Ok(StoreStatus {
            contract_version: "feedback_status.v1".to_string(),
            snapshot_count,
            opportunity_count,
            open_outcomes,
            won_outcomes,
            lost_outcomes,
            flagged_outcomes,
            candidate_configurations,
            active_configurations,
            retired_configurations,
            active_configuration_id,
            cas_version,
            unresolved_with_snapshots,
            report_count,
            ab_run_count,
        })
    }

    pub fn check(&self) -> Result<StoreCheck> {
        let status = self.status()?;
        let mut issues = Vec::new();

        if status.active_configurations != 1 {
            issues.push(StoreIssue {
                code: "active_configuration_count".to_string(),
                severity: IssueSeverity::Error,
                message: format!(
                    "expected exactly one active configuration, found {}",
                    status.active_configurations
                ),
            });
        }

        match status.active_configuration_id {
            None => {
                issues.push(StoreIssue {
                    code: "active_pointer_missing".to_string(),
                    severity: IssueSeverity::Error,
                    message: "active configuration pointer row is missing".to_string(),
                });
            }
            Some(id) => {
                let pointer_target: Option<String> = self
                    .conn
                    .query_row(
                        "SELECT status FROM weight_configurations WHERE id = ?1",
                        params![id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()
                    .context("failed to read pointer target status")?;
                if pointer_target.as_deref() != Some("active") {
                    issues.push(StoreIssue {
                        code: "active_pointer_mismatch".to_string(),
                        severity: IssueSeverity::Error,
                        message: format!(
                            "active pointer references {id} with status {}",
                            pointer_target.unwrap_or_else(|| "missing".to_string())
                        ),
                    });
                }
            }
        }

        let unresolved_terminal = self.count(
            "SELECT COUNT(*) FROM opportunity_outcomes
             WHERE outcome != 'open' AND resolved_date IS NULL",
        )?;
        if unresolved_terminal > 0 {
            issues.push(StoreIssue {
                code: "terminal_without_resolved_date".to_string(),
                severity: IssueSeverity::Error,
                message: format!(
                    "{unresolved_terminal} terminal outcomes have no resolved_date"
                ),
            });
        }

        let orphan_snapshots = self.count(
            "SELECT COUNT(*) FROM opportunity_snapshots snapshots
             LEFT JOIN weight_configurations configs
               ON configs.id = snapshots.weight_configuration_id
             WHERE configs.id IS NULL",
        )?;
        if orphan_snapshots > 0 {
            issues.push(StoreIssue {
                code: "orphan_snapshots".to_string(),
                severity: IssueSeverity::Warning,
                message: format!(
                    "{orphan_snapshots} snapshots reference unknown configurations"
                ),
            });
        }

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == IssueSeverity::Error);

        Ok(StoreCheck {
            contract_version: "feedback_check.v1".to_string(),
            healthy,
            status,
            issues,
        })
    }

    fn unresolved_opportunity_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT snapshots.opportunity_id
             FROM opportunity_snapshots snapshots
             LEFT JOIN opportunity_outcomes outcomes
               ON outcomes.opportunity_id = snapshots.opportunity_id
             WHERE outcomes.opportunity_id IS NULL OR outcomes.outcome = 'open'
             ORDER BY snapshots.opportunity_id ASC",
        )?;

        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_rows(rows)
    }

    fn apply_terminal_outcome(
        &mut self,
        opportunity_id: &str,
        outcome: OutcomeState,
        resolved_date: Date,
        final_value: f64,
        data_quality_flag: bool,
        upstream_created: Option<Date>,
    ) -> Result<()> {
        let resolved_raw =
            format_iso_date(resolved_date).map_err(|err| anyhow!(err.to_string()))?;
        let updated_at_raw =
            format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let stored_created: Option<String> = self
            .conn
            .query_row(
                "SELECT created_date FROM opportunity_outcomes WHERE opportunity_id = ?1",
                params![opportunity_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read outcome created_date")?;

        let created_date = match (upstream_created, stored_created.as_deref()) {
            (Some(date), _) => date,
            (None, Some(raw)) => parse_iso_date(raw).map_err(|err| anyhow!(err.to_string()))?,
            (None, None) => resolved_date,
        };
        let days_open = days_between(created_date, resolved_date);
        let created_raw = format_iso_date(created_date).map_err(|err| anyhow!(err.to_string()))?;

        if stored_created.is_none() {
            self.conn
                .execute(
                    "INSERT INTO opportunity_outcomes(
                        opportunity_id, outcome, final_value, created_date,
                        data_quality_flag, corrected, updated_at
                     ) VALUES (?1, 'open', 0.0, ?2, 0, 0, ?3)",
                    params![opportunity_id, created_raw, updated_at_raw],
                )
                .context("failed to create outcome row")?;
        }

        // Terminal states are write-once here; corrections go through
        // record_correction.
        let updated = self
            .conn
            .execute(
                "UPDATE opportunity_outcomes
                 SET outcome = ?2, resolved_date = ?3, final_value = ?4, days_open = ?5,
                     created_date = ?6, data_quality_flag = ?7, updated_at = ?8
                 WHERE opportunity_id = ?1 AND outcome = 'open'",
                params![
                    opportunity_id,
                    outcome.as_str(),
                    resolved_raw,
                    final_value,
                    days_open,
                    created_raw,
                    i64::from(data_quality_flag),
                    updated_at_raw,
                ],
            )
            .context("failed to write terminal outcome")?;

        if updated == 0 {
            return Err(FeedbackError::Validation(format!(
                "outcome for {opportunity_id} is already terminal"
            ))
            .into());
        }

        Ok(())
    }

    fn insert_report(&self, report: &AccuracyReport) -> Result<()> {
        let segment_json = serde_json::to_string(&report.segment_breakdown)
            .context("failed to serialize segment breakdown")?;

        self.conn
            .execute(
                "INSERT INTO accuracy_reports(
                    id, weight_configuration_id, window_start, window_end,
                    precision, recall, f1, sample_size, pending_count,
                    low_confidence, segment_json, generated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    report.id.to_string(),
                    report.weight_configuration_id.to_string(),
                    format_iso_date(report.window_start)
                        .map_err(|err| anyhow!(err.to_string()))?,
                    format_iso_date(report.window_end).map_err(|err| anyhow!(err.to_string()))?,
                    report.precision,
                    report.recall,
                    report.f1,
                    i64::try_from(report.sample_size)
                        .with_context(|| format!("invalid sample_size {}", report.sample_size))?,
                    i64::try_from(report.pending_count).with_context(|| {
                        format!("invalid pending_count {}", report.pending_count)
                    })?,
                    i64::from(report.low_confidence),
                    segment_json,
                    format_rfc3339(report.generated_at)
                        .map_err(|err| anyhow!(err.to_string()))?,
                ],
            )
            .context("failed to insert accuracy report")?;

        Ok(())
    }

    fn count(&self, query: &str) -> Result<usize> {
        let count = self
            .conn
            .query_row(query, [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed count query: {query}"))?;
        usize::try_from(count).with_context(|| format!("invalid count: {count}"))
    }
}

fn fetch_with_retry(
    source: &dyn CrmSource,
    opportunity_id: &str,
    policy: &FeedbackPolicy,
) -> Result<Option<score_feedback_core::CrmOpportunity>, FeedbackError> {
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        match source.fetch_opportunity(opportunity_id) {
            Ok(value) => return Ok(value),
            Err(FeedbackError::Lookup(reason)) => {
                if attempt >= policy.lookup_max_attempts {
                    return Err(FeedbackError::Lookup(format!(
                        "{reason} (after {attempt} attempts)"
                    )));
                }
                let backoff = policy
                    .lookup_backoff_ms
                    .saturating_mul(1_u64 << (attempt - 1).min(16));
                if backoff > 0 {
                    std::thread::sleep(Duration::from_millis(backoff));
                }
            }
            Err(other) => return Err(other),
        }
    }
}

fn parse_configuration_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WeightConfiguration> {
    let id_raw: String = row.get(0)?;
    let weights_json: String = row.get(1)?;
    let created_at_raw: String = row.get(2)?;
    let created_from_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;

    let id = parse_ulid_column(&id_raw, 0)?;
    let weights: BTreeMap<String, f64> = serde_json::from_str(&weights_json).map_err(|err| {
        to_sql_error(FeedbackError::Configuration(format!(
            "invalid weights_json: {err}"
        )))
    })?;
    let created_from = ConfigProvenance::parse(&created_from_raw).ok_or_else(|| {
        to_sql_error(FeedbackError::Configuration(format!(
            "invalid created_from: {created_from_raw}"
        )))
    })?;
    let status = ConfigStatus::parse(&status_raw).ok_or_else(|| {
        to_sql_error(FeedbackError::Configuration(format!(
            "invalid status: {status_raw}"
        )))
    })?;

    Ok(WeightConfiguration {
        id,
        weights,
        created_at: parse_rfc3339_utc(&created_at_raw).map_err(to_sql_error)?,
        created_from,
        status,
    })
}

fn parse_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OpportunitySnapshot> {
    let snapshot_date_raw: String = row.get(1)?;
    let config_id_raw: String = row.get(2)?;
    let components_json: String = row.get(4)?;
    let raw_inputs_json: String = row.get(5)?;
    let recorded_at_raw: String = row.get(6)?;

    let component_scores: BTreeMap<String, f64> =
        serde_json::from_str(&components_json).map_err(|err| {
            to_sql_error(FeedbackError::Validation(format!(
                "invalid component_scores_json: {err}"
            )))
        })?;
    let raw_inputs: BTreeMap<String, f64> =
        serde_json::from_str(&raw_inputs_json).map_err(|err| {
            to_sql_error(FeedbackError::Validation(format!(
                "invalid raw_inputs_json: {err}"
            )))
        })?;

    Ok(OpportunitySnapshot {
        opportunity_id: row.get(0)?,
        snapshot_date: parse_iso_date(&snapshot_date_raw).map_err(to_sql_error)?,
        component_scores,
        raw_inputs,
        weight_configuration_id: parse_ulid_column(&config_id_raw, 2)?,
        composite_score: row.get(3)?,
        recorded_at: parse_rfc3339_utc(&recorded_at_raw).map_err(to_sql_error)?,
    })
}

fn parse_outcome_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OpportunityOutcome> {
    let outcome_raw: String = row.get(1)?;
    let resolved_raw: Option<String> = row.get(2)?;
    let created_raw: String = row.get(5)?;
    let updated_at_raw: String = row.get(8)?;

    let outcome = OutcomeState::parse(&outcome_raw).ok_or_else(|| {
        to_sql_error(FeedbackError::Validation(format!(
            "invalid outcome: {outcome_raw}"
        )))
    })?;
    let resolved_date = resolved_raw
        .as_deref()
        .map(|raw| parse_iso_date(raw).map_err(to_sql_error))
        .transpose()?;

    Ok(OpportunityOutcome {
        opportunity_id: row.get(0)?,
        outcome,
        resolved_date,
        final_value: row.get(3)?,
        days_open: row.get(4)?,
        created_date: parse_iso_date(&created_raw).map_err(to_sql_error)?,
        data_quality_flag: row.get::<_, i64>(6)? == 1,
        corrected: row.get::<_, i64>(7)? == 1,
        updated_at: parse_rfc3339_utc(&updated_at_raw).map_err(to_sql_error)?,
    })
}

fn parse_report_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccuracyReport> {
    let id_raw: String = row.get(0)?;
    let config_id_raw: String = row.get(1)?;
    let window_start_raw: String = row.get(2)?;
    let window_end_raw: String = row.get(3)?;
    let sample_size_i64: i64 = row.get(7)?;
    let pending_count_i64: i64 = row.get(8)?;
    let segment_json: String = row.get(10)?;
    let generated_at_raw: String = row.get(11)?;

    let sample_size = usize::try_from(sample_size_i64).map_err(|_| {
        to_sql_error(FeedbackError::Validation(format!(
            "invalid sample_size: {sample_size_i64}"
        )))
    })?;
    let pending_count = usize::try_from(pending_count_i64).map_err(|_| {
        to_sql_error(FeedbackError::Validation(format!(
            "invalid pending_count: {pending_count_i64}"
        )))
    })?;
    let segment_breakdown: BTreeMap<String, SegmentCounts> = serde_json::from_str(&segment_json)
        .map_err(|err| {
            to_sql_error(FeedbackError::Validation(format!(
                "invalid segment_json: {err}"
            )))
        })?;

    Ok(AccuracyReport {
        id: parse_ulid_column(&id_raw, 0)?,
        weight_configuration_id: parse_ulid_column(&config_id_raw, 1)?,
        window_start: parse_iso_date(&window_start_raw).map_err(to_sql_error)?,
        window_end: parse_iso_date(&window_end_raw).map_err(to_sql_error)?,
        precision: row.get(4)?,
        recall: row.get(5)?,
        f1: row.get(6)?,
        sample_size,
        pending_count,
        low_confidence: row.get::<_, i64>(9)? == 1,
        segment_breakdown,
        generated_at: parse_rfc3339_utc(&generated_at_raw).map_err(to_sql_error)?,
    })
}

fn parse_ulid_column(raw: &str, column: usize) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid ULID: {raw}"),
            )),
        )
    })
}

fn to_sql_error(err: FeedbackError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn must_err<T: std::fmt::Debug>(result: Result<T>) -> anyhow::Error {
        match result {
            Ok(value) => panic!("expected Err(..), got Ok({value:?})"),
            Err(err) => err,
        }
    }

    fn must_date(value: &str) -> Date {
        must_ok(parse_iso_date(value))
    }

    fn temp_store() -> (SqliteFeedbackStore, PathBuf) {
        let db_path = std::env::temp_dir().join(format!("score-feedback-{}.sqlite3", Ulid::new()));
        let mut store = must_ok(SqliteFeedbackStore::open(&db_path));
        must_ok(store.migrate());
        // Retry delays are pointless inside tests.
        let mut policy = FeedbackPolicy::v1();
        policy.policy_version = 2;
        policy.lookup_backoff_ms = 0;
        must_ok(store.upsert_policy(&policy));
        (store, db_path)
    }

    fn uniform_components(value: f64) -> BTreeMap<String, f64> {
        default_seed_weights()
            .into_keys()
            .map(|factor| (factor, value))
            .collect()
    }

    fn snapshot_input(
        opportunity_id: &str,
        date: &str,
        components: BTreeMap<String, f64>,
        configuration_id: Ulid,
    ) -> SnapshotInput {
        SnapshotInput {
            opportunity_id: opportunity_id.to_string(),
            snapshot_date: must_date(date),
            component_scores: components,
            raw_inputs: BTreeMap::new(),
            weight_configuration_id: configuration_id,
        }
    }

    struct MockCrm {
        records: BTreeMap<String, score_feedback_core::CrmOpportunity>,
        failing: BTreeSet<String>,
    }

    impl MockCrm {
        fn new() -> Self {
            Self {
                records: BTreeMap::new(),
                failing: BTreeSet::new(),
            }
        }

        fn with_record(
            mut self,
            opportunity_id: &str,
            stage: &str,
            close_date: Option<&str>,
            close_value: Option<f64>,
            created_date: &str,
        ) -> Self {
            self.records.insert(
                opportunity_id.to_string(),
                score_feedback_core::CrmOpportunity {
                    opportunity_id: opportunity_id.to_string(),
                    stage: stage.to_string(),
                    close_date: close_date.map(must_date),
                    close_value,
                    created_date: must_date(created_date),
                    last_modified: None,
                },
            );
            self
        }

        fn with_failure(mut self, opportunity_id: &str) -> Self {
            self.failing.insert(opportunity_id.to_string());
            self
        }
    }

    impl CrmSource for MockCrm {
        fn fetch_opportunity(
            &self,
            opportunity_id: &str,
        ) -> Result<Option<score_feedback_core::CrmOpportunity>, FeedbackError> {
            if self.failing.contains(opportunity_id) {
                return Err(FeedbackError::Lookup(format!(
                    "simulated upstream failure for {opportunity_id}"
                )));
            }
            Ok(self.records.get(opportunity_id).cloned())
        }
    }

    #[test]
    fn migrate_seeds_one_active_configuration() {
        let (store, _path) = temp_store();

        let (active, cas_version) = must_ok(store.active_configuration());
        assert_eq!(active.status, ConfigStatus::Active);
        assert_eq!(cas_version, 1);
        must_ok(active.validate());
        assert_eq!(active.weights, default_seed_weights());

        // Idempotent: a second migrate must not add configurations.
        let mut store = store;
        must_ok(store.migrate());
        assert_eq!(must_ok(store.list_configurations()).len(), 1);
    }

    #[test]
    fn same_day_snapshot_is_overwritten_not_duplicated() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());

        must_ok(store.record_snapshot(&snapshot_input(
            "opp_1",
            "2025-11-01",
            uniform_components(0.4),
            active.id,
        )));
        let second = must_ok(store.record_snapshot(&snapshot_input(
            "opp_1",
            "2025-11-01",
            uniform_components(0.85),
            active.id,
        )));

        let snapshots = must_ok(store.get_snapshots("opp_1"));
        assert_eq!(snapshots.len(), 1);
        assert!((snapshots[0].composite_score - second.composite_score).abs() < 1e-12);
        assert!((snapshots[0].composite_score - 0.85).abs() < 1e-9);

        let outcome = must_some(must_ok(store.get_outcome("opp_1")));
        assert_eq!(outcome.outcome, OutcomeState::Open);
    }

    #[test]
    fn snapshots_are_ordered_by_date_ascending() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());

        for date in ["2025-11-10", "2025-11-01", "2025-11-05"] {
            must_ok(store.record_snapshot(&snapshot_input(
                "opp_1",
                date,
                uniform_components(0.5),
                active.id,
            )));
        }

        let snapshots = must_ok(store.get_snapshots("opp_1"));
        let dates: Vec<Date> = snapshots.iter().map(|s| s.snapshot_date).collect();
        assert_eq!(
            dates,
            vec![
                must_date("2025-11-01"),
                must_date("2025-11-05"),
                must_date("2025-11-10")
            ]
        );
    }

    #[test]
    fn retired_configuration_rejects_new_snapshots() {
        let (mut store, _path) = temp_store();
        let (seed, _) = must_ok(store.active_configuration());

        let candidate = must_ok(store.insert_configuration(
            default_seed_weights(),
            ConfigProvenance::Manual,
            ConfigStatus::Candidate,
        ));
        must_ok(store.promote_configuration(candidate.id, None));

        let err = must_err(store.record_snapshot(&snapshot_input(
            "opp_1",
            "2025-11-01",
            uniform_components(0.5),
            seed.id,
        )));
        let domain = must_some(err.downcast_ref::<FeedbackError>().cloned());
        assert!(matches!(domain, FeedbackError::Validation(_)));

        // Historical reads of the retired configuration still work.
        let reread = must_some(must_ok(store.get_configuration(seed.id)));
        assert_eq!(reread.status, ConfigStatus::Retired);
    }

    #[test]
    fn reconcile_resolves_flags_and_leaves_open() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());

        for opportunity_id in ["opp_won", "opp_open", "opp_gone"] {
            must_ok(store.record_snapshot(&snapshot_input(
                opportunity_id,
                "2025-11-01",
                uniform_components(0.8),
                active.id,
            )));
        }

        let crm = MockCrm::new()
            .with_record(
                "opp_won",
                "Closed Won",
                Some("2025-11-20"),
                Some(120_000.0),
                "2025-09-01",
            )
            .with_record("opp_open", "Open", None, None, "2025-09-01");

        let summary = must_ok(store.reconcile(must_date("2025-11-30"), &crm));
        assert_eq!(summary.examined, 3);
        assert_eq!(summary.resolved_won, 1);
        assert_eq!(summary.resolved_lost, 0);
        assert_eq!(summary.flagged_missing, 1);
        assert_eq!(summary.still_open, 1);
        assert_eq!(summary.updated, 2);
        assert!(summary.skipped.is_empty());
        assert!(!summary.is_partial());

        let won = must_some(must_ok(store.get_outcome("opp_won")));
        assert_eq!(won.outcome, OutcomeState::Won);
        assert_eq!(won.resolved_date, Some(must_date("2025-11-20")));
        assert!((won.final_value - 120_000.0).abs() < 1e-9);
        assert_eq!(won.days_open, Some(80));
        assert!(!won.data_quality_flag);

        let gone = must_some(must_ok(store.get_outcome("opp_gone")));
        assert_eq!(gone.outcome, OutcomeState::Lost);
        assert!(gone.data_quality_flag);
        assert!((gone.final_value - 0.0).abs() < 1e-12);

        let open = must_some(must_ok(store.get_outcome("opp_open")));
        assert_eq!(open.outcome, OutcomeState::Open);

        // Terminal outcomes are not re-examined on the next run.
        let second = must_ok(store.reconcile(must_date("2025-12-01"), &crm));
        assert_eq!(second.examined, 1);
    }

    #[test]
    fn reconcile_skips_failed_lookups_without_aborting() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());

        for opportunity_id in ["opp_bad", "opp_good"] {
            must_ok(store.record_snapshot(&snapshot_input(
                opportunity_id,
                "2025-11-01",
                uniform_components(0.8),
                active.id,
            )));
        }

        let crm = MockCrm::new()
            .with_failure("opp_bad")
            .with_record(
                "opp_good",
                "Closed Lost",
                Some("2025-11-10"),
                None,
                "2025-10-01",
            );

        let summary = must_ok(store.reconcile(must_date("2025-11-30"), &crm));
        assert_eq!(summary.resolved_lost, 1);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].opportunity_id, "opp_bad");
        assert!(summary.is_partial());

        // The skipped opportunity stays open for the next run.
        let bad = must_some(must_ok(store.get_outcome("opp_bad")));
        assert_eq!(bad.outcome, OutcomeState::Open);
    }

    #[test]
    fn unrecognized_stage_is_skipped_with_reason() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());

        must_ok(store.record_snapshot(&snapshot_input(
            "opp_1",
            "2025-11-01",
            uniform_components(0.8),
            active.id,
        )));

        let crm = MockCrm::new().with_record("opp_1", "Negotiation", None, None, "2025-10-01");
        let summary = must_ok(store.reconcile(must_date("2025-11-30"), &crm));

        assert_eq!(summary.skipped.len(), 1);
        assert!(summary.skipped[0].reason.contains("Negotiation"));
    }

    #[test]
    fn correction_overwrites_terminal_with_flag() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());

        must_ok(store.record_snapshot(&snapshot_input(
            "opp_1",
            "2025-11-01",
            uniform_components(0.8),
            active.id,
        )));
        let crm = MockCrm::new().with_record(
            "opp_1",
            "Closed Won",
            Some("2025-11-20"),
            Some(50_000.0),
            "2025-10-01",
        );
        must_ok(store.reconcile(must_date("2025-11-30"), &crm));

        let corrected = must_ok(store.record_correction(
            "opp_1",
            OutcomeState::Lost,
            Some(must_date("2025-11-22")),
            0.0,
        ));
        assert_eq!(corrected.outcome, OutcomeState::Lost);
        assert!(corrected.corrected);

        let stored = must_some(must_ok(store.get_outcome("opp_1")));
        assert_eq!(stored.outcome, OutcomeState::Lost);
        assert!(stored.corrected);
    }

    fn seed_example_window(store: &mut SqliteFeedbackStore, configuration_id: Ulid) {
        // High-scored winner, low-scored loser, one still pending.
        must_ok(store.record_snapshot(&snapshot_input(
            "opp_1",
            "2025-11-01",
            uniform_components(0.85),
            configuration_id,
        )));
        must_ok(store.record_snapshot(&snapshot_input(
            "opp_2",
            "2025-11-05",
            uniform_components(0.30),
            configuration_id,
        )));
        must_ok(store.record_snapshot(&snapshot_input(
            "opp_3",
            "2025-11-08",
            uniform_components(0.75),
            configuration_id,
        )));

        let crm = MockCrm::new()
            .with_record(
                "opp_1",
                "Closed Won",
                Some("2025-11-20"),
                Some(80_000.0),
                "2025-09-01",
            )
            .with_record("opp_2", "Closed Lost", Some("2025-11-10"), None, "2025-09-15")
            .with_record("opp_3", "Open", None, None, "2025-10-01");
        must_ok(store.reconcile(must_date("2025-11-30"), &crm));
    }

    #[test]
    fn analyze_classifies_winners_losers_and_pending() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());
        seed_example_window(&mut store, active.id);

        let report = must_ok(store.analyze(
            active.id,
            must_date("2025-11-01"),
            must_date("2025-11-30"),
        ));

        assert!((report.precision - 1.0).abs() < 1e-12);
        assert!((report.recall - 1.0).abs() < 1e-12);
        assert!((report.f1 - 1.0).abs() < 1e-12);
        assert_eq!(report.sample_size, 2);
        assert_eq!(report.pending_count, 1);
        assert!(report.low_confidence);

        let low_bucket = must_some(report.segment_breakdown.get("0.2-0.4").copied());
        assert_eq!(low_bucket.lost_count, 1);
        let high_bucket = must_some(report.segment_breakdown.get("0.8-1.0").copied());
        assert_eq!(high_bucket.won_count, 1);

        let persisted = must_some(must_ok(store.get_report(report.id)));
        assert_eq!(persisted, report);
    }

    #[test]
    fn analyze_is_deterministic_across_runs() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());
        seed_example_window(&mut store, active.id);

        let first = must_ok(store.analyze(
            active.id,
            must_date("2025-11-01"),
            must_date("2025-11-30"),
        ));
        let second = must_ok(store.analyze(
            active.id,
            must_date("2025-11-01"),
            must_date("2025-11-30"),
        ));

        assert_eq!(first.precision.to_bits(), second.precision.to_bits());
        assert_eq!(first.recall.to_bits(), second.recall.to_bits());
        assert_eq!(first.f1.to_bits(), second.f1.to_bits());
        assert_eq!(first.sample_size, second.sample_size);
        assert_eq!(first.pending_count, second.pending_count);
        assert_eq!(first.segment_breakdown, second.segment_breakdown);
    }

    #[test]
    fn analyze_uses_latest_snapshot_in_window() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());

        must_ok(store.record_snapshot(&snapshot_input(
            "opp_1",
            "2025-11-02",
            uniform_components(0.2),
            active.id,
        )));
        must_ok(store.record_snapshot(&snapshot_input(
            "opp_1",
            "2025-11-18",
            uniform_components(0.9),
            active.id,
        )));
        let crm = MockCrm::new().with_record(
            "opp_1",
            "Closed Won",
            Some("2025-11-25"),
            Some(10_000.0),
            "2025-10-01",
        );
        must_ok(store.reconcile(must_date("2025-11-30"), &crm));

        let observations = must_ok(store.matched_observations(
            active.id,
            must_date("2025-11-01"),
            must_date("2025-11-30"),
        ));
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].snapshot_date, must_date("2025-11-18"));
        assert!((observations[0].composite_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn outcome_resolved_after_window_counts_as_pending() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());

        must_ok(store.record_snapshot(&snapshot_input(
            "opp_1",
            "2025-11-05",
            uniform_components(0.8),
            active.id,
        )));
        let crm = MockCrm::new().with_record(
            "opp_1",
            "Closed Won",
            Some("2025-12-05"),
            Some(10_000.0),
            "2025-10-01",
        );
        must_ok(store.reconcile(must_date("2025-12-10"), &crm));

        let report = must_ok(store.analyze(
            active.id,
            must_date("2025-11-01"),
            must_date("2025-11-30"),
        ));
        assert_eq!(report.sample_size, 0);
        assert_eq!(report.pending_count, 1);
    }

    fn seed_refinement_window(store: &mut SqliteFeedbackStore, configuration_id: Ulid) {
        // upsell separates winners from losers; the rest are flat.
        let mut crm = MockCrm::new();
        for index in 0..40 {
            let opportunity_id = format!("opp_{index:02}");
            let won = index % 2 == 0;
            let mut components = uniform_components(0.5);
            components.insert("upsell".to_string(), if won { 0.9 } else { 0.1 });
            must_ok(store.record_snapshot(&snapshot_input(
                &opportunity_id,
                "2025-11-03",
                components,
                configuration_id,
            )));
            crm = crm.with_record(
                &opportunity_id,
                if won { "Closed Won" } else { "Closed Lost" },
                Some("2025-11-21"),
                if won { Some(25_000.0) } else { None },
                "2025-09-01",
            );
        }
        must_ok(store.reconcile(must_date("2025-11-30"), &crm));
    }

    #[test]
    fn propose_weights_persists_a_candidate() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());
        seed_refinement_window(&mut store, active.id);

        let (report, candidate) = must_ok(store.propose_weights(
            active.id,
            must_date("2025-11-01"),
            must_date("2025-11-30"),
        ));

        assert!(!report.low_confidence);
        assert_eq!(candidate.status, ConfigStatus::Candidate);
        assert_eq!(candidate.created_from, ConfigProvenance::Report(report.id));

        let persisted = must_some(must_ok(store.get_configuration(candidate.id)));
        assert_eq!(persisted.status, ConfigStatus::Candidate);
        must_ok(persisted.validate());

        let upsell_before = must_some(active.weights.get("upsell").copied());
        let upsell_after = must_some(persisted.weights.get("upsell").copied());
        assert!(upsell_after > upsell_before);
    }

    #[test]
    fn propose_weights_refuses_small_windows() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());
        seed_example_window(&mut store, active.id);

        let err = must_err(store.propose_weights(
            active.id,
            must_date("2025-11-01"),
            must_date("2025-11-30"),
        ));
        let domain = must_some(err.downcast_ref::<FeedbackError>().cloned());
        assert!(matches!(domain, FeedbackError::InsufficientData(_)));

        // No candidate configuration was created.
        assert_eq!(must_ok(store.list_configurations()).len(), 1);
    }

    fn count_active(store: &SqliteFeedbackStore) -> usize {
        must_ok(store.status()).active_configurations
    }

    #[test]
    fn promotion_is_guarded_by_compare_and_swap() {
        let (mut store, _path) = temp_store();

        let first = must_ok(store.insert_configuration(
            default_seed_weights(),
            ConfigProvenance::Manual,
            ConfigStatus::Candidate,
        ));
        let second = must_ok(store.insert_configuration(
            default_seed_weights(),
            ConfigProvenance::Manual,
            ConfigStatus::Candidate,
        ));

        let promotion = must_ok(store.promote_configuration(first.id, Some(1)));
        assert_eq!(promotion.cas_version, 2);
        assert_eq!(count_active(&store), 1);

        // A second promoter still holding version 1 must lose the race.
        let err = must_err(store.promote_configuration(second.id, Some(1)));
        let domain = must_some(err.downcast_ref::<FeedbackError>().cloned());
        assert!(matches!(domain, FeedbackError::PromotionConflict(_)));
        assert_eq!(count_active(&store), 1);

        // Re-fetching the pointer version lets the caller retry.
        let (_, cas_version) = must_ok(store.active_configuration());
        let retried = must_ok(store.promote_configuration(second.id, Some(cas_version)));
        assert_eq!(retried.cas_version, 3);
        assert_eq!(count_active(&store), 1);

        let retired = must_some(must_ok(store.get_configuration(first.id)));
        assert_eq!(retired.status, ConfigStatus::Retired);
    }

    #[test]
    fn promoting_a_retired_configuration_fails() {
        let (mut store, _path) = temp_store();
        let candidate = must_ok(store.insert_configuration(
            default_seed_weights(),
            ConfigProvenance::Manual,
            ConfigStatus::Candidate,
        ));
        let (seed, _) = must_ok(store.active_configuration());
        must_ok(store.promote_configuration(candidate.id, None));

        let err = must_err(store.promote_configuration(seed.id, None));
        let domain = must_some(err.downcast_ref::<FeedbackError>().cloned());
        assert!(matches!(domain, FeedbackError::Validation(_)));
    }

    fn candidate_weights_favoring_upsell() -> BTreeMap<String, f64> {
        [
            ("speed", 0.10),
            ("deal_size", 0.10),
            ("product_mix", 0.10),
            ("upsell", 0.50),
            ("win_rate", 0.15),
            ("recency", 0.05),
        ]
        .into_iter()
        .map(|(factor, weight)| (factor.to_string(), weight))
        .collect()
    }

    #[test]
    fn ab_test_promotes_a_clearly_better_candidate() {
        let (mut store, _path) = temp_store();
        let (incumbent, _) = must_ok(store.active_configuration());

        // Winners carry a strong upsell signal the incumbent underweights.
        let mut crm = MockCrm::new();
        for index in 0..40 {
            let opportunity_id = format!("opp_{index:02}");
            let won = index % 2 == 0;
            let mut components = uniform_components(0.6);
            components.insert("upsell".to_string(), if won { 0.95 } else { 0.05 });
            must_ok(store.record_snapshot(&snapshot_input(
                &opportunity_id,
                "2025-11-03",
                components,
                incumbent.id,
            )));
            crm = crm.with_record(
                &opportunity_id,
                if won { "Closed Won" } else { "Closed Lost" },
                Some("2025-11-21"),
                if won { Some(40_000.0) } else { None },
                "2025-09-01",
            );
        }
        must_ok(store.reconcile(must_date("2025-11-30"), &crm));

        let candidate = must_ok(store.insert_configuration(
            candidate_weights_favoring_upsell(),
            ConfigProvenance::Manual,
            ConfigStatus::Candidate,
        ));

        let (run, promotion) = must_ok(store.run_ab_test(
            incumbent.id,
            candidate.id,
            must_date("2025-11-01"),
            must_date("2025-11-30"),
            true,
        ));

        assert_eq!(run.decision, AbDecision::Promote);
        assert!(run.candidate_report.f1 > run.incumbent_report.f1);
        assert_eq!(run.incumbent_report.sample_size, 40);
        assert_eq!(run.candidate_report.sample_size, 40);

        let promotion = must_some(promotion);
        assert_eq!(promotion.promoted_configuration_id, candidate.id);
        assert_eq!(promotion.retired_configuration_id, incumbent.id);
        assert_eq!(count_active(&store), 1);

        let now_active = must_some(must_ok(store.get_configuration(candidate.id)));
        assert_eq!(now_active.status, ConfigStatus::Active);
    }

    #[test]
    fn ab_test_without_auto_promote_leaves_statuses_alone() {
        let (mut store, _path) = temp_store();
        let (incumbent, _) = must_ok(store.active_configuration());
        seed_refinement_window(&mut store, incumbent.id);

        let candidate = must_ok(store.insert_configuration(
            candidate_weights_favoring_upsell(),
            ConfigProvenance::Manual,
            ConfigStatus::Candidate,
        ));

        let (run, promotion) = must_ok(store.run_ab_test(
            incumbent.id,
            candidate.id,
            must_date("2025-11-01"),
            must_date("2025-11-30"),
            false,
        ));

        assert!(promotion.is_none());
        assert_eq!(run.incumbent_configuration_id, incumbent.id);
        let unchanged = must_some(must_ok(store.get_configuration(candidate.id)));
        assert_eq!(unchanged.status, ConfigStatus::Candidate);
    }

    #[test]
    fn auto_promote_rejects_non_candidate_before_persisting_the_run() {
        let (mut store, _path) = temp_store();
        let (incumbent, _) = must_ok(store.active_configuration());
        seed_refinement_window(&mut store, incumbent.id);

        // The active configuration passed as its own candidate.
        let err = must_err(store.run_ab_test(
            incumbent.id,
            incumbent.id,
            must_date("2025-11-01"),
            must_date("2025-11-30"),
            true,
        ));
        let domain = must_some(err.downcast_ref::<FeedbackError>().cloned());
        assert!(matches!(domain, FeedbackError::Validation(_)));

        // Nothing was persisted for the aborted run.
        let status = must_ok(store.status());
        assert_eq!(status.ab_run_count, 0);
        assert_eq!(status.report_count, 0);
    }

    #[test]
    fn check_reports_healthy_store() {
        let (mut store, _path) = temp_store();
        let (active, _) = must_ok(store.active_configuration());
        seed_example_window(&mut store, active.id);

        let check = must_ok(store.check());
        assert!(check.healthy, "issues: {:?}", check.issues);
        assert_eq!(check.status.active_configurations, 1);
        assert_eq!(check.status.won_outcomes, 1);
        assert_eq!(check.status.lost_outcomes, 1);
        assert_eq!(check.status.open_outcomes, 1);
        assert_eq!(check.status.unresolved_with_snapshots, 1);
    }
}
