use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

const DATE_FORMAT: &[BorrowedFormatItem<'_>] = format_description!("[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FeedbackError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("lookup failure: {0}")]
    Lookup(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("promotion conflict: {0}")]
    PromotionConflict(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeState {
    Won,
    Lost,
    Open,
}

impl OutcomeState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Open => "open",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "won" => Some(Self::Won),
            "lost" => Some(Self::Lost),
            "open" => Some(Self::Open),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Won | Self::Lost)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStatus {
    Candidate,
    Active,
    Retired,
}

impl ConfigStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "candidate" => Some(Self::Candidate),
            "active" => Some(Self::Active),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AbDecision {
    Promote,
    Reject,
    Inconclusive,
}

impl AbDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Reject => "reject",
            Self::Inconclusive => "inconclusive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "promote" => Some(Self::Promote),
            "reject" => Some(Self::Reject),
            "inconclusive" => Some(Self::Inconclusive),
            _ => None,
        }
    }
}

/// Provenance of a weight configuration: entered by hand or derived from a
/// specific accuracy report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "report_id")]
pub enum ConfigProvenance {
    Manual,
    Report(Ulid),
}

impl ConfigProvenance {
    #[must_use]
    pub fn as_string(self) -> String {
        match self {
            Self::Manual => "manual".to_string(),
            Self::Report(report_id) => format!("report:{report_id}"),
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value == "manual" {
            return Some(Self::Manual);
        }

        let report_id = value.strip_prefix("report:")?;
        Ulid::from_string(report_id).ok().map(Self::Report)
    }
}

/// Tunables for the feedback loop, versioned so historical runs remain
/// reproducible after a policy change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackPolicy {
    pub policy_version: u32,
    pub high_score_threshold: f64,
    pub min_sample_size: usize,
    pub max_weight_step: f64,
    pub promotion_margin: f64,
    pub lookup_max_attempts: u32,
    pub lookup_backoff_ms: u64,
}

impl FeedbackPolicy {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            policy_version: 1,
            high_score_threshold: 0.7,
            min_sample_size: 30,
            max_weight_step: 0.05,
            promotion_margin: 0.03,
            lookup_max_attempts: 3,
            lookup_backoff_ms: 250,
        }
    }

    /// Validates policy numeric bounds.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), FeedbackError> {
        if self.policy_version == 0 {
            return Err(FeedbackError::Configuration(
                "policy_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("high_score_threshold", self.high_score_threshold),
            ("promotion_margin", self.promotion_margin),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FeedbackError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if !(self.max_weight_step > 0.0 && self.max_weight_step <= 1.0) {
            return Err(FeedbackError::Configuration(
                "max_weight_step MUST be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.min_sample_size == 0 {
            return Err(FeedbackError::Configuration(
                "min_sample_size MUST be >= 1".to_string(),
            ));
        }

        if self.lookup_max_attempts == 0 {
            return Err(FeedbackError::Configuration(
                "lookup_max_attempts MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Configuration`] when JSON decoding fails or
    /// decoded values violate policy constraints.
    pub fn from_json(value: &Value) -> Result<Self, FeedbackError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            FeedbackError::Configuration(format!("invalid policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }
}

/// A named, versioned set of factor weights. Immutable once created; only
/// the status transitions (Candidate -> Active -> Retired).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightConfiguration {
    pub id: Ulid,
    pub weights: BTreeMap<String, f64>,
    pub created_at: OffsetDateTime,
    pub created_from: ConfigProvenance,
    pub status: ConfigStatus,
}

impl WeightConfiguration {
    /// Validates the weight vector: non-empty, every weight in [0,1], sum
    /// within [`WEIGHT_SUM_TOLERANCE`] of 1.0.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Configuration`] when a constraint is violated.
    pub fn validate(&self) -> Result<(), FeedbackError> {
        if self.weights.is_empty() {
            return Err(FeedbackError::Configuration(
                "weights MUST contain at least one factor".to_string(),
            ));
        }

        for (factor, weight) in &self.weights {
            if factor.trim().is_empty() {
                return Err(FeedbackError::Configuration(
                    "factor names MUST be non-empty".to_string(),
                ));
            }
            if !(0.0..=1.0).contains(weight) {
                return Err(FeedbackError::Configuration(format!(
                    "weight for {factor} MUST be in [0.0, 1.0]"
                )));
            }
        }

        let sum: f64 = self.weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(FeedbackError::Configuration(format!(
                "weights MUST sum to 1.0 (got {sum})"
            )));
        }

        Ok(())
    }
}

/// Input for recording one dated scoring result. The composite score is
/// derived from the referenced configuration, never supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotInput {
    pub opportunity_id: String,
    pub snapshot_date: Date,
    pub component_scores: BTreeMap<String, f64>,
    pub raw_inputs: BTreeMap<String, f64>,
    pub weight_configuration_id: Ulid,
}

impl SnapshotInput {
    /// Validates a snapshot payload before persistence.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Validation`] when the opportunity id is
    /// blank, the component map is empty, or a component score is outside
    /// [0,1].
    pub fn validate(&self) -> Result<(), FeedbackError> {
        if self.opportunity_id.trim().is_empty() {
            return Err(FeedbackError::Validation(
                "opportunity_id MUST be non-empty".to_string(),
            ));
        }

        if self.component_scores.is_empty() {
            return Err(FeedbackError::Validation(
                "component_scores MUST contain at least one factor".to_string(),
            ));
        }

        for (factor, score) in &self.component_scores {
            if factor.trim().is_empty() {
                return Err(FeedbackError::Validation(
                    "component factor names MUST be non-empty".to_string(),
                ));
            }
            if !(0.0..=1.0).contains(score) {
                return Err(FeedbackError::Validation(format!(
                    "component score for {factor} MUST be in [0.0, 1.0]"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpportunitySnapshot {
    pub opportunity_id: String,
    pub snapshot_date: Date,
    pub component_scores: BTreeMap<String, f64>,
    pub raw_inputs: BTreeMap<String, f64>,
    pub weight_configuration_id: Ulid,
    pub composite_score: f64,
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpportunityOutcome {
    pub opportunity_id: String,
    pub outcome: OutcomeState,
    pub resolved_date: Option<Date>,
    pub final_value: f64,
    pub days_open: Option<i64>,
    pub created_date: Date,
    pub data_quality_flag: bool,
    pub corrected: bool,
    pub updated_at: OffsetDateTime,
}

/// One joined (snapshot, outcome) row: the latest snapshot for an
/// opportunity inside an analysis window plus its current outcome state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchedObservation {
    pub opportunity_id: String,
    pub snapshot_date: Date,
    pub composite_score: f64,
    pub component_scores: BTreeMap<String, f64>,
    pub outcome: OutcomeState,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SegmentCounts {
    pub won_count: usize,
    pub lost_count: usize,
    pub open_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccuracyReport {
    pub id: Ulid,
    pub weight_configuration_id: Ulid,
    pub window_start: Date,
    pub window_end: Date,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub sample_size: usize,
    pub pending_count: usize,
    pub low_confidence: bool,
    pub segment_breakdown: BTreeMap<String, SegmentCounts>,
    pub generated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbTestRun {
    pub id: Ulid,
    pub incumbent_configuration_id: Ulid,
    pub candidate_configuration_id: Ulid,
    pub window_start: Date,
    pub window_end: Date,
    pub incumbent_report: AccuracyReport,
    pub candidate_report: AccuracyReport,
    pub decision: AbDecision,
    pub executed_at: OffsetDateTime,
}

/// Upstream stage vocabulary recognized by the outcome tracker. Anything
/// else is logged and skipped.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CrmStage {
    Open,
    ClosedWon,
    ClosedLost,
}

impl CrmStage {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();

        match normalized.as_str() {
            "open" => Some(Self::Open),
            "closed_won" => Some(Self::ClosedWon),
            "closed_lost" => Some(Self::ClosedLost),
            _ => None,
        }
    }
}

/// Upstream record shape for one opportunity, as supplied by the CRM
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrmOpportunity {
    pub opportunity_id: String,
    pub stage: String,
    #[serde(default)]
    pub close_date: Option<Date>,
    #[serde(default)]
    pub close_value: Option<f64>,
    pub created_date: Date,
    #[serde(default)]
    pub last_modified: Option<OffsetDateTime>,
}

/// Seam to the upstream CRM data source. `Ok(None)` means the opportunity
/// no longer exists upstream (deleted or merged).
pub trait CrmSource {
    /// Fetches the current upstream record for one opportunity.
    ///
    /// # Errors
    /// Returns [`FeedbackError::Lookup`] on a transient fetch failure.
    fn fetch_opportunity(&self, opportunity_id: &str)
        -> Result<Option<CrmOpportunity>, FeedbackError>;
}

/// Computes the weighted composite score for one snapshot.
///
/// The component factor set must match the configuration's factor set
/// exactly; a partial overlap would silently shift the score scale.
///
/// # Errors
/// Returns [`FeedbackError::Validation`] when the factor sets differ or the
/// result falls outside [0,1].
pub fn composite_score(
    component_scores: &BTreeMap<String, f64>,
    weights: &BTreeMap<String, f64>,
) -> Result<f64, FeedbackError> {
    for factor in weights.keys() {
        if !component_scores.contains_key(factor) {
            return Err(FeedbackError::Validation(format!(
                "missing component score for factor {factor}"
            )));
        }
    }

    for factor in component_scores.keys() {
        if !weights.contains_key(factor) {
            return Err(FeedbackError::Validation(format!(
                "component factor {factor} is not present in the weight configuration"
            )));
        }
    }

    let mut total = 0.0;
    for (factor, weight) in weights {
        let score = component_scores.get(factor).copied().unwrap_or(0.0);
        total += weight * score;
    }

    if !(-WEIGHT_SUM_TOLERANCE..=1.0 + WEIGHT_SUM_TOLERANCE).contains(&total) {
        return Err(FeedbackError::Validation(format!(
            "composite score {total} is outside [0.0, 1.0]"
        )));
    }

    Ok(total.clamp(0.0, 1.0))
}

pub const SCORE_BUCKETS: [&str; 5] = ["0.0-0.2", "0.2-0.4", "0.4-0.6", "0.6-0.8", "0.8-1.0"];

#[must_use]
pub fn score_bucket(score: f64) -> &'static str {
    if score < 0.2 {
        SCORE_BUCKETS[0]
    } else if score < 0.4 {
        SCORE_BUCKETS[1]
    } else if score < 0.6 {
        SCORE_BUCKETS[2]
    } else if score < 0.8 {
        SCORE_BUCKETS[3]
    } else {
        SCORE_BUCKETS[4]
    }
}

/// Computes predictive-quality metrics over matched observations.
///
/// Only terminal outcomes enter the precision/recall denominators; Open
/// observations are tallied into `pending_count` and the segment breakdown.
///
/// # Errors
/// Returns [`FeedbackError::Validation`] when the window is inverted.
#[allow(clippy::cast_precision_loss)]
pub fn analyze_observations(
    report_id: Ulid,
    weight_configuration_id: Ulid,
    window_start: Date,
    window_end: Date,
    observations: &[MatchedObservation],
    policy: &FeedbackPolicy,
    generated_at: OffsetDateTime,
) -> Result<AccuracyReport, FeedbackError> {
    if window_start > window_end {
        return Err(FeedbackError::Validation(format!(
            "window_start {window_start} is after window_end {window_end}"
        )));
    }

    let mut segment_breakdown: BTreeMap<String, SegmentCounts> = SCORE_BUCKETS
        .iter()
        .map(|bucket| ((*bucket).to_string(), SegmentCounts::default()))
        .collect();

    let mut sample_size = 0_usize;
    let mut pending_count = 0_usize;
    let mut high_scored = 0_usize;
    let mut true_positives = 0_usize;
    let mut won_total = 0_usize;

    for observation in observations {
        let counts = segment_breakdown
            .entry(score_bucket(observation.composite_score).to_string())
            .or_default();

        match observation.outcome {
            OutcomeState::Open => {
                counts.open_count += 1;
                pending_count += 1;
                continue;
            }
            OutcomeState::Won => {
                counts.won_count += 1;
                won_total += 1;
            }
            OutcomeState::Lost => {
                counts.lost_count += 1;
            }
        }

        sample_size += 1;
        if observation.composite_score >= policy.high_score_threshold {
            high_scored += 1;
            if observation.outcome == OutcomeState::Won {
                true_positives += 1;
            }
        }
    }

    let precision = if high_scored == 0 {
        0.0
    } else {
        true_positives as f64 / high_scored as f64
    };
    let recall = if won_total == 0 {
        0.0
    } else {
        true_positives as f64 / won_total as f64
    };
    let f1 = if precision + recall <= 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };

    Ok(AccuracyReport {
        id: report_id,
        weight_configuration_id,
        window_start,
        window_end,
        precision,
        recall,
        f1,
        sample_size,
        pending_count,
        low_confidence: sample_size < policy.min_sample_size,
        segment_breakdown,
        generated_at,
    })
}

/// Per-factor predictive strength in [0,1].
///
/// Point-biserial correlation between the factor's component score and the
/// Won/Lost label, mapped from [-1,1] to [0,1]. Returns the neutral value
/// 0.5 when the factor carries no signal (missing values, one-class sample,
/// or zero variance).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn predictive_strength(observations: &[MatchedObservation], factor: &str) -> f64 {
    let mut values = Vec::new();
    let mut labels = Vec::new();

    for observation in observations {
        if !observation.outcome.is_terminal() {
            continue;
        }
        if let Some(value) = observation.component_scores.get(factor) {
            values.push(*value);
            labels.push(observation.outcome == OutcomeState::Won);
        }
    }

    let n = values.len();
    if n < 2 {
        return 0.5;
    }

    let won_count = labels.iter().filter(|won| **won).count();
    let lost_count = n - won_count;
    if won_count == 0 || lost_count == 0 {
        return 0.5;
    }

    let n_f = n as f64;
    let mean_all = values.iter().sum::<f64>() / n_f;
    let variance = values
        .iter()
        .map(|value| (value - mean_all).powi(2))
        .sum::<f64>()
        / n_f;
    let std_dev = variance.sqrt();
    if std_dev < 1e-12 {
        return 0.5;
    }

    let mean_won = values
        .iter()
        .zip(&labels)
        .filter(|(_, won)| **won)
        .map(|(value, _)| *value)
        .sum::<f64>()
        / won_count as f64;
    let mean_lost = values
        .iter()
        .zip(&labels)
        .filter(|(_, won)| !**won)
        .map(|(value, _)| *value)
        .sum::<f64>()
        / lost_count as f64;

    let proportion_term = ((won_count as f64 * lost_count as f64) / (n_f * n_f)).sqrt();
    let correlation = ((mean_won - mean_lost) / std_dev * proportion_term).clamp(-1.0, 1.0);

    (correlation + 1.0) / 2.0
}

/// Derives a Candidate configuration from an accuracy report.
///
/// New raw weight = current weight x predictive strength, renormalized to
/// sum 1.0, with per-factor movement clamped to `max_weight_step`. Residual
/// mass from clamping is redistributed proportionally among factors with
/// remaining headroom.
///
/// # Errors
/// Returns [`FeedbackError::InsufficientData`] for a low-confidence report,
/// [`FeedbackError::Validation`] when the report does not belong to the
/// current configuration, and [`FeedbackError::Configuration`] when the
/// step-bounded vector cannot be renormalized.
pub fn propose_weights(
    report: &AccuracyReport,
    observations: &[MatchedObservation],
    current: &WeightConfiguration,
    policy: &FeedbackPolicy,
    candidate_id: Ulid,
    created_at: OffsetDateTime,
) -> Result<WeightConfiguration, FeedbackError> {
    if report.low_confidence {
        return Err(FeedbackError::InsufficientData(format!(
            "refinement requires sample_size >= {} (report has {})",
            policy.min_sample_size, report.sample_size
        )));
    }

    if report.weight_configuration_id != current.id {
        return Err(FeedbackError::Validation(format!(
            "report belongs to configuration {}, not {}",
            report.weight_configuration_id, current.id
        )));
    }

    current.validate()?;
    policy.validate()?;

    let mut raw: BTreeMap<&str, f64> = BTreeMap::new();
    for (factor, weight) in &current.weights {
        let strength = predictive_strength(observations, factor);
        raw.insert(factor.as_str(), weight * strength);
    }

    let raw_sum: f64 = raw.values().sum();
    let mut bounded: BTreeMap<String, f64> = BTreeMap::new();
    for (factor, weight) in &current.weights {
        let target = if raw_sum < 1e-12 {
            *weight
        } else {
            raw.get(factor.as_str()).copied().unwrap_or(0.0) / raw_sum
        };
        let low = (weight - policy.max_weight_step).max(0.0);
        let high = (weight + policy.max_weight_step).min(1.0);
        bounded.insert(factor.clone(), target.clamp(low, high));
    }

    redistribute_residual(&mut bounded, &current.weights, policy.max_weight_step)?;

    let candidate = WeightConfiguration {
        id: candidate_id,
        weights: bounded,
        created_at,
        created_from: ConfigProvenance::Report(report.id),
        status: ConfigStatus::Candidate,
    };
    candidate.validate()?;

    Ok(candidate)
}

/// Applies the A/B promotion rule to two reports over the same window.
///
/// Strict boundary: a candidate improvement equal to the margin is
/// inconclusive, not a promotion. The comparison carries a small tolerance
/// so rounding in the F1 subtraction cannot flip an at-the-margin result.
#[must_use]
pub fn decide_promotion(
    incumbent: &AccuracyReport,
    candidate: &AccuracyReport,
    policy: &FeedbackPolicy,
) -> AbDecision {
    if candidate.f1 < incumbent.f1 {
        return AbDecision::Reject;
    }

    let improvement = candidate.f1 - incumbent.f1;
    if improvement > policy.promotion_margin + WEIGHT_SUM_TOLERANCE
        && incumbent.sample_size >= policy.min_sample_size
        && candidate.sample_size >= policy.min_sample_size
    {
        return AbDecision::Promote;
    }

    AbDecision::Inconclusive
}

fn redistribute_residual(
    bounded: &mut BTreeMap<String, f64>,
    current: &BTreeMap<String, f64>,
    max_step: f64,
) -> Result<(), FeedbackError> {
    for _ in 0..32 {
        let residual = 1.0 - bounded.values().sum::<f64>();
        if residual.abs() <= 1e-9 {
            return Ok(());
        }

        let room: BTreeMap<String, f64> = bounded
            .iter()
            .map(|(factor, value)| {
                let base = current.get(factor).copied().unwrap_or(*value);
                let room = if residual > 0.0 {
                    ((base + max_step).min(1.0) - value).max(0.0)
                } else {
                    (value - (base - max_step).max(0.0)).max(0.0)
                };
                (factor.clone(), room)
            })
            .collect();

        let total_room: f64 = room.values().sum();
        if total_room < 1e-12 {
            return Err(FeedbackError::Configuration(
                "max_weight_step leaves no room to renormalize the weight vector".to_string(),
            ));
        }

        for (factor, value) in bounded.iter_mut() {
            let share = residual * room.get(factor).copied().unwrap_or(0.0) / total_room;
            let capped = if residual > 0.0 {
                share.min(room.get(factor).copied().unwrap_or(0.0))
            } else {
                share.max(-room.get(factor).copied().unwrap_or(0.0))
            };
            *value += capped;
        }
    }

    let residual = 1.0 - bounded.values().sum::<f64>();
    if residual.abs() <= WEIGHT_SUM_TOLERANCE {
        Ok(())
    } else {
        Err(FeedbackError::Configuration(format!(
            "failed to renormalize step-bounded weights (residual {residual})"
        )))
    }
}

/// Parses an ISO `YYYY-MM-DD` date.
///
/// # Errors
/// Returns [`FeedbackError::Validation`] when parsing fails.
pub fn parse_iso_date(value: &str) -> Result<Date, FeedbackError> {
    Date::parse(value, DATE_FORMAT)
        .map_err(|err| FeedbackError::Validation(format!("invalid date {value}: {err}")))
}

/// Formats a date as ISO `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`FeedbackError::Validation`] when formatting fails.
pub fn format_iso_date(value: Date) -> Result<String, FeedbackError> {
    value
        .format(DATE_FORMAT)
        .map_err(|err| FeedbackError::Validation(format!("failed to format date: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`FeedbackError::Validation`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, FeedbackError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| FeedbackError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(FeedbackError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`FeedbackError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, FeedbackError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            FeedbackError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn days_between(earlier: Date, later: Date) -> i64 {
    (later - earlier).whole_days()
}
