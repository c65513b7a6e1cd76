//! Declarative experiment description: conditions, procedures and session timing.
//!
//! Procedures come in two layers. [`ProcedureSpec`] is what an experiment file
//! holds: only the level bounds (or level table) are required and any other field
//! may be left out. [`ProcedureSpec::resolve`] fills each missing field with its
//! documented default and validates the result into a [`ProcedureConfig`], which is
//! what measurements are built from. A configuration that resolves is guaranteed
//! not to fail mid-session.

use crate::error::ConfigError;
use hashbrown::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════
// Conditions
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Named parameters describing what a condition measures (target size, session id, ...).
///
/// The engine never interprets these; they travel with the condition so trial
/// records and the condition table can say where a trial came from.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ExperimentalCondition {
    params: HashMap<String, ParamValue>,
}

impl ExperimentalCondition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.params.get(name) {
            Some(ParamValue::Number(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.params.get(name) {
            Some(ParamValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameters in name order, so logs and tables are stable across runs.
    pub fn sorted(&self) -> Vec<(&str, &ParamValue)> {
        let mut out: Vec<(&str, &ParamValue)> =
            self.params.iter().map(|(k, v)| (k.as_str(), v)).collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Resolved procedures
// ═══════════════════════════════════════════════════════════════════════════

/// Continuous up/down staircase.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StaircaseConfig {
    pub init_level: f32,
    pub init_level_random_range: f32,
    pub min_level: f32,
    pub max_level: f32,
    pub init_step_size: f32,
    pub min_step_size: f32,
    pub num_up: u32,
    pub num_down: u32,
    pub max_reversals: u32,
    pub max_total_trials: u32,
    pub max_limit_hits: u32,
}

impl StaircaseConfig {
    /// Classic 2-down/1-up staircase starting at the easiest level.
    pub fn with_defaults(min_level: f32, max_level: f32, min_step_size: f32) -> Self {
        Self {
            init_level: max_level,
            init_level_random_range: 0.0,
            min_level,
            max_level,
            init_step_size: 4.0 * min_step_size,
            min_step_size,
            num_up: 1,
            num_down: 2,
            max_reversals: 50,
            max_total_trials: 150,
            max_limit_hits: 2,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("min_level", self.min_level),
            ("max_level", self.max_level),
            ("init_level", self.init_level),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidValue { field, value });
            }
        }
        non_negative("init_level_random_range", self.init_level_random_range)?;
        non_negative("init_step_size", self.init_step_size)?;
        non_negative("min_step_size", self.min_step_size)?;
        if self.min_level > self.max_level {
            return Err(ConfigError::InvertedRange {
                min: self.min_level,
                max: self.max_level,
            });
        }
        if self.init_level < self.min_level || self.init_level > self.max_level {
            return Err(ConfigError::OutOfRange {
                field: "init_level",
                value: self.init_level,
                min: self.min_level,
                max: self.max_level,
            });
        }
        positive_counts(
            self.num_up,
            self.num_down,
            self.max_reversals,
            self.max_total_trials,
            self.max_limit_hits,
        )
    }
}

/// Staircase over a fixed, ordered level table (last entry = easiest by default).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndexedStaircaseConfig {
    pub levels: Vec<f32>,
    pub init_index: usize,
    pub init_index_random_range: u32,
    pub init_index_step_size: u32,
    pub num_up: u32,
    pub num_down: u32,
    pub max_reversals: u32,
    pub max_total_trials: u32,
    pub max_limit_hits: u32,
}

impl IndexedStaircaseConfig {
    pub fn with_defaults(levels: Vec<f32>) -> Self {
        let init_index = levels.len().saturating_sub(1);
        Self {
            levels,
            init_index,
            init_index_random_range: 0,
            init_index_step_size: 4,
            num_up: 1,
            num_down: 2,
            max_reversals: 15,
            max_total_trials: 50,
            max_limit_hits: 2,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_levels(&self.levels)?;
        if self.init_index >= self.levels.len() {
            return Err(ConfigError::IndexOutOfRange {
                index: self.init_index,
                len: self.levels.len(),
            });
        }
        if self.init_index_step_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "init_index_step_size",
            });
        }
        positive_counts(
            self.num_up,
            self.num_down,
            self.max_reversals,
            self.max_total_trials,
            self.max_limit_hits,
        )
    }
}

/// Method of constant stimuli: every level presented a fixed number of times.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstantStimuliConfig {
    pub levels: Vec<f32>,
    pub trials_per_level: Vec<u32>,
}

impl ConstantStimuliConfig {
    /// Roughly 200 trials split evenly across the table.
    pub fn with_defaults(levels: Vec<f32>) -> Self {
        let per_level = (DEFAULT_MCS_TOTAL_TRIALS / levels.len().max(1) as u32).max(1);
        let trials_per_level = vec![per_level; levels.len()];
        Self {
            levels,
            trials_per_level,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_levels(&self.levels)?;
        if self.levels.len() != self.trials_per_level.len() {
            return Err(ConfigError::BudgetLengthMismatch {
                levels: self.levels.len(),
                budgets: self.trials_per_level.len(),
            });
        }
        if let Some(index) = self.trials_per_level.iter().position(|&b| b == 0) {
            return Err(ConfigError::ZeroLevelBudget { index });
        }
        Ok(())
    }

    pub fn total_trials(&self) -> u64 {
        self.trials_per_level.iter().map(|&b| b as u64).sum()
    }
}

const DEFAULT_MCS_TOTAL_TRIALS: u32 = 200;

/// A validated procedure, one variant per strategy.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "method", rename_all = "snake_case"))]
pub enum ProcedureConfig {
    Staircase(StaircaseConfig),
    IndexedStaircase(IndexedStaircaseConfig),
    ConstantStimuli(ConstantStimuliConfig),
}

impl ProcedureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ProcedureConfig::Staircase(c) => c.validate(),
            ProcedureConfig::IndexedStaircase(c) => c.validate(),
            ProcedureConfig::ConstantStimuli(c) => c.validate(),
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            ProcedureConfig::Staircase(_) => "staircase",
            ProcedureConfig::IndexedStaircase(_) => "indexed_staircase",
            ProcedureConfig::ConstantStimuli(_) => "constant_stimuli",
        }
    }
}

fn non_negative(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue { field, value })
    }
}

fn positive_counts(
    num_up: u32,
    num_down: u32,
    max_reversals: u32,
    max_total_trials: u32,
    max_limit_hits: u32,
) -> Result<(), ConfigError> {
    for (field, value) in [
        ("num_up", num_up),
        ("num_down", num_down),
        ("max_reversals", max_reversals),
        ("max_total_trials", max_total_trials),
        ("max_limit_hits", max_limit_hits),
    ] {
        if value == 0 {
            return Err(ConfigError::NonPositive { field });
        }
    }
    Ok(())
}

fn validate_levels(levels: &[f32]) -> Result<(), ConfigError> {
    if levels.is_empty() {
        return Err(ConfigError::EmptyLevelTable);
    }
    if let Some(&value) = levels.iter().find(|v| !v.is_finite()) {
        return Err(ConfigError::InvalidValue {
            field: "levels",
            value,
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Declarative procedures (experiment files)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StaircaseSpec {
    pub min_level: f32,
    pub max_level: f32,
    pub min_step_size: f32,
    pub init_level: Option<f32>,
    pub init_level_random_range: Option<f32>,
    pub init_step_size: Option<f32>,
    pub num_up: Option<u32>,
    pub num_down: Option<u32>,
    pub max_reversals: Option<u32>,
    pub max_total_trials: Option<u32>,
    pub max_limit_hits: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IndexedStaircaseSpec {
    pub levels: Vec<f32>,
    pub init_index: Option<usize>,
    pub init_index_random_range: Option<u32>,
    pub init_index_step_size: Option<u32>,
    pub num_up: Option<u32>,
    pub num_down: Option<u32>,
    pub max_reversals: Option<u32>,
    pub max_total_trials: Option<u32>,
    pub max_limit_hits: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConstantStimuliSpec {
    pub levels: Vec<f32>,
    pub trials_per_level: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "method", rename_all = "snake_case"))]
pub enum ProcedureSpec {
    Staircase(StaircaseSpec),
    IndexedStaircase(IndexedStaircaseSpec),
    ConstantStimuli(ConstantStimuliSpec),
}

impl ProcedureSpec {
    /// Fill omitted fields with defaults, then validate.
    pub fn resolve(&self) -> Result<ProcedureConfig, ConfigError> {
        let resolved = match self {
            ProcedureSpec::Staircase(s) => {
                let d = StaircaseConfig::with_defaults(s.min_level, s.max_level, s.min_step_size);
                ProcedureConfig::Staircase(StaircaseConfig {
                    init_level: s.init_level.unwrap_or(d.init_level),
                    init_level_random_range: s
                        .init_level_random_range
                        .unwrap_or(d.init_level_random_range),
                    init_step_size: s.init_step_size.unwrap_or(d.init_step_size),
                    num_up: s.num_up.unwrap_or(d.num_up),
                    num_down: s.num_down.unwrap_or(d.num_down),
                    max_reversals: s.max_reversals.unwrap_or(d.max_reversals),
                    max_total_trials: s.max_total_trials.unwrap_or(d.max_total_trials),
                    max_limit_hits: s.max_limit_hits.unwrap_or(d.max_limit_hits),
                    ..d
                })
            }
            ProcedureSpec::IndexedStaircase(s) => {
                let d = IndexedStaircaseConfig::with_defaults(s.levels.clone());
                ProcedureConfig::IndexedStaircase(IndexedStaircaseConfig {
                    init_index: s.init_index.unwrap_or(d.init_index),
                    init_index_random_range: s
                        .init_index_random_range
                        .unwrap_or(d.init_index_random_range),
                    init_index_step_size: s.init_index_step_size.unwrap_or(d.init_index_step_size),
                    num_up: s.num_up.unwrap_or(d.num_up),
                    num_down: s.num_down.unwrap_or(d.num_down),
                    max_reversals: s.max_reversals.unwrap_or(d.max_reversals),
                    max_total_trials: s.max_total_trials.unwrap_or(d.max_total_trials),
                    max_limit_hits: s.max_limit_hits.unwrap_or(d.max_limit_hits),
                    ..d
                })
            }
            ProcedureSpec::ConstantStimuli(s) => {
                let d = ConstantStimuliConfig::with_defaults(s.levels.clone());
                ProcedureConfig::ConstantStimuli(ConstantStimuliConfig {
                    trials_per_level: s
                        .trials_per_level
                        .clone()
                        .unwrap_or(d.trials_per_level.clone()),
                    ..d
                })
            }
        };
        resolved.validate()?;
        Ok(resolved)
    }
}

impl From<ProcedureConfig> for ProcedureSpec {
    fn from(config: ProcedureConfig) -> Self {
        match config {
            ProcedureConfig::Staircase(c) => ProcedureSpec::Staircase(StaircaseSpec {
                min_level: c.min_level,
                max_level: c.max_level,
                min_step_size: c.min_step_size,
                init_level: Some(c.init_level),
                init_level_random_range: Some(c.init_level_random_range),
                init_step_size: Some(c.init_step_size),
                num_up: Some(c.num_up),
                num_down: Some(c.num_down),
                max_reversals: Some(c.max_reversals),
                max_total_trials: Some(c.max_total_trials),
                max_limit_hits: Some(c.max_limit_hits),
            }),
            ProcedureConfig::IndexedStaircase(c) => {
                ProcedureSpec::IndexedStaircase(IndexedStaircaseSpec {
                    levels: c.levels,
                    init_index: Some(c.init_index),
                    init_index_random_range: Some(c.init_index_random_range),
                    init_index_step_size: Some(c.init_index_step_size),
                    num_up: Some(c.num_up),
                    num_down: Some(c.num_down),
                    max_reversals: Some(c.max_reversals),
                    max_total_trials: Some(c.max_total_trials),
                    max_limit_hits: Some(c.max_limit_hits),
                })
            }
            ProcedureConfig::ConstantStimuli(c) => {
                ProcedureSpec::ConstantStimuli(ConstantStimuliSpec {
                    levels: c.levels,
                    trials_per_level: Some(c.trials_per_level),
                })
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════════

/// Presentation timing for one session. Durations are in seconds.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TimingConfig {
    /// Fixed pretrial duration, or the mean when `pretrial_duration_range` is set.
    pub pretrial_duration: f32,
    /// `[min, max]` of a truncated exponential pretrial duration.
    pub pretrial_duration_range: Option<[f32; 2]>,
    pub max_trial_duration: f32,
    pub feedback_duration: f32,
    pub session_feedback_duration: f32,
    /// Wait for a start input before the first trial (and after each block).
    pub click_to_start: bool,
    /// Wait for an input before leaving the session feedback screen.
    pub session_feedback_requires_click: bool,
    /// Number of response inputs allowed per trial (`None` = unlimited).
    pub max_response_inputs: Option<u32>,
    /// Trials per block (`None` = one block for the whole session).
    pub trials_per_block: Option<u32>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pretrial_duration: 0.5,
            pretrial_duration_range: None,
            max_trial_duration: 100.0,
            feedback_duration: 1.0,
            session_feedback_duration: 2.0,
            click_to_start: true,
            session_feedback_requires_click: false,
            max_response_inputs: None,
            trials_per_block: None,
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_negative("pretrial_duration", self.pretrial_duration)?;
        non_negative("max_trial_duration", self.max_trial_duration)?;
        non_negative("feedback_duration", self.feedback_duration)?;
        non_negative("session_feedback_duration", self.session_feedback_duration)?;
        if let Some([min, max]) = self.pretrial_duration_range {
            let ordered = min.is_finite() && max.is_finite() && min >= 0.0 && min <= max;
            if !ordered {
                return Err(ConfigError::InvalidPretrialRange { min, max });
            }
            if self.pretrial_duration < min || self.pretrial_duration > max {
                return Err(ConfigError::OutOfRange {
                    field: "pretrial_duration",
                    value: self.pretrial_duration,
                    min,
                    max,
                });
            }
        }
        if self.max_response_inputs == Some(0) {
            return Err(ConfigError::NonPositive {
                field: "max_response_inputs",
            });
        }
        if self.trials_per_block == Some(0) {
            return Err(ConfigError::NonPositive {
                field: "trials_per_block",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConditionConfig {
    #[cfg_attr(feature = "serde", serde(default))]
    pub params: ExperimentalCondition,
    pub procedure: ProcedureSpec,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SessionConfig {
    pub id: String,
    /// Free-form label; `"training"` sessions get per-trial feedback text.
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub timing: TimingConfig,
    #[cfg_attr(feature = "serde", serde(default = "default_stimuli_per_trial"))]
    pub stimuli_per_trial: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub conditions: Vec<ConditionConfig>,
}

#[cfg(feature = "serde")]
fn default_stimuli_per_trial() -> u32 {
    1
}

impl SessionConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            description: String::new(),
            timing: TimingConfig::default(),
            stimuli_per_trial: 1,
            conditions: Vec::new(),
        }
    }

    pub fn with_condition(
        mut self,
        params: ExperimentalCondition,
        procedure: ProcedureSpec,
    ) -> Self {
        self.conditions.push(ConditionConfig { params, procedure });
        self
    }

    pub fn is_training(&self) -> bool {
        self.description == "training"
    }

    /// Resolve every condition's procedure. Empty sessions are allowed here; the
    /// trial machine reports them as "no session" instead of running trials.
    pub fn resolve_conditions(
        &self,
    ) -> Result<Vec<(ExperimentalCondition, ProcedureConfig)>, ConfigError> {
        self.timing.validate()?;
        if self.stimuli_per_trial == 0 {
            return Err(ConfigError::NonPositive {
                field: "stimuli_per_trial",
            });
        }
        self.conditions
            .iter()
            .map(|c| Ok((c.params.clone(), c.procedure.resolve()?)))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExperimentConfig {
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: String,
    /// RNG seed; `None` seeds from the clock.
    #[cfg_attr(feature = "serde", serde(default))]
    pub seed: Option<u64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub sessions: Vec<SessionConfig>,
}

impl ExperimentConfig {
    /// Check every session up front so nothing fails after the first trial.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, s) in self.sessions.iter().enumerate() {
            if self.sessions[..i].iter().any(|o| o.id == s.id) {
                return Err(ConfigError::DuplicateSession(s.id.clone()));
            }
            s.resolve_conditions()?;
        }
        Ok(())
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[cfg(all(feature = "serde", feature = "std"))]
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    #[cfg(feature = "serde")]
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Small two-session experiment used by the demo binary and the daemon's first run.
    pub fn builtin_demo() -> Self {
        let mut training = SessionConfig::new("training");
        training.description = "training".to_string();
        training.timing.click_to_start = false;
        training = training.with_condition(
            ExperimentalCondition::new()
                .with("target_size", 0.05)
                .with("label", "mcs"),
            ProcedureSpec::ConstantStimuli(ConstantStimuliSpec {
                levels: vec![0.2, 0.4, 0.6],
                trials_per_level: Some(vec![3, 3, 3]),
            }),
        );

        let mut threshold = SessionConfig::new("threshold");
        threshold.description = "real".to_string();
        threshold.timing = TimingConfig {
            pretrial_duration: 0.6,
            pretrial_duration_range: Some([0.3, 1.5]),
            max_trial_duration: 3.0,
            feedback_duration: 0.5,
            session_feedback_duration: 2.0,
            click_to_start: false,
            session_feedback_requires_click: false,
            max_response_inputs: Some(3),
            trials_per_block: Some(40),
        };
        threshold = threshold
            .with_condition(
                ExperimentalCondition::new()
                    .with("target_size", 0.02)
                    .with("label", "small"),
                ProcedureSpec::Staircase(StaircaseSpec {
                    min_level: 0.0,
                    max_level: 1.0,
                    min_step_size: 0.02,
                    max_reversals: Some(8),
                    max_total_trials: Some(60),
                    ..StaircaseSpec::default()
                }),
            )
            .with_condition(
                ExperimentalCondition::new()
                    .with("target_size", 0.08)
                    .with("label", "large"),
                ProcedureSpec::IndexedStaircase(IndexedStaircaseSpec {
                    levels: vec![0.05, 0.1, 0.15, 0.2, 0.3, 0.4, 0.5, 0.7, 1.0],
                    max_reversals: Some(8),
                    ..IndexedStaircaseSpec::default()
                }),
            );

        Self {
            name: "demo".to_string(),
            seed: Some(0x5EED),
            sessions: vec![training, threshold],
        }
    }
}
