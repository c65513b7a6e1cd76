//! Trial records handed to the persistence layer.
//!
//! Recording is fire-and-forget: the engine calls the recorder synchronously and
//! never waits on or inspects the outcome.

use crate::scheduler::ConditionRecord;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One completed trial. Times are seconds on the session clock.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrialRecord {
    pub condition_index: usize,
    pub session_id: String,
    pub session_description: String,
    pub block_index: u32,
    pub start_time: f64,
    pub end_time: f64,
    pub execution_duration: f64,
    pub level: f32,
    pub correct: bool,
    /// True when the trial ended without an explicit response.
    pub timed_out: bool,
}

pub trait TrialRecorder {
    /// Called once per scheduler construction.
    fn record_conditions(&mut self, session_id: &str, table: &[ConditionRecord]);
    /// Called once per trial, before the response reaches the scheduler.
    fn record_trial(&mut self, record: &TrialRecord);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl TrialRecorder for NullRecorder {
    fn record_conditions(&mut self, _session_id: &str, _table: &[ConditionRecord]) {}
    fn record_trial(&mut self, _record: &TrialRecord) {}
}

/// Keeps records in memory (tests, summaries).
#[derive(Debug, Default, Clone)]
pub struct MemoryRecorder {
    pub conditions: Vec<(String, Vec<ConditionRecord>)>,
    pub trials: Vec<TrialRecord>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accuracy(&self) -> f32 {
        if self.trials.is_empty() {
            return 0.5;
        }
        let correct = self.trials.iter().filter(|t| t.correct).count();
        correct as f32 / self.trials.len() as f32
    }
}

impl TrialRecorder for MemoryRecorder {
    fn record_conditions(&mut self, session_id: &str, table: &[ConditionRecord]) {
        self.conditions.push((session_id.to_string(), table.to_vec()));
    }

    fn record_trial(&mut self, record: &TrialRecord) {
        self.trials.push(record.clone());
    }
}

impl<T: TrialRecorder + ?Sized> TrialRecorder for &mut T {
    fn record_conditions(&mut self, session_id: &str, table: &[ConditionRecord]) {
        (**self).record_conditions(session_id, table);
    }

    fn record_trial(&mut self, record: &TrialRecord) {
        (**self).record_trial(record);
    }
}
