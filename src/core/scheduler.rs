use tracing::{debug, error, warn};

use crate::config::{ExperimentalCondition, ProcedureConfig};
use crate::error::{ConfigError, ResponseError, ScheduleError};
use crate::measurement::{Measurement, Progress};
use crate::prng::{Prng, RandomSource};

/// One row of the condition table handed to the recorder when a session starts.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConditionRecord {
    pub index: usize,
    pub method: String,
    pub params: ExperimentalCondition,
}

/// Interleaves several measurements, always giving the next trial to whichever
/// condition is furthest behind.
#[derive(Debug, Clone)]
pub struct ConditionScheduler<R: RandomSource = Prng> {
    measurements: Vec<Measurement>,
    active: usize,
    total_trials_run: u64,
    started: bool,
    rng: R,
}

impl<R: RandomSource> ConditionScheduler<R> {
    pub fn new(rng: R) -> Self {
        Self {
            measurements: Vec::new(),
            active: 0,
            total_trials_run: 0,
            started: false,
            rng,
        }
    }

    /// Build from resolved conditions and pick the first active one.
    pub fn from_conditions(
        conditions: impl IntoIterator<Item = (ExperimentalCondition, ProcedureConfig)>,
        rng: R,
    ) -> Result<Self, ConfigError> {
        let mut sched = Self::new(rng);
        for (condition, config) in conditions {
            let m = Measurement::new(condition, config, &mut sched.rng)?;
            sched.measurements.push(m);
        }
        if !sched.measurements.is_empty() {
            sched.choose_next_condition();
        }
        Ok(sched)
    }

    /// Append a condition. Only allowed before scheduling starts.
    pub fn add_condition(
        &mut self,
        condition: ExperimentalCondition,
        config: ProcedureConfig,
    ) -> Result<(), AddConditionError> {
        if self.started {
            return Err(AddConditionError::Schedule(ScheduleError::AlreadyStarted));
        }
        let m = Measurement::new(condition, config, &mut self.rng)
            .map_err(AddConditionError::Config)?;
        self.measurements.push(m);
        Ok(())
    }

    /// Pick uniformly among the measurements with the lowest progress.
    ///
    /// While any measurement is incomplete only incomplete ones are candidates, so
    /// the active index never points at a finished condition mid-session.
    pub fn choose_next_condition(&mut self) -> Option<usize> {
        let chosen = self.select_least_progressed()?;
        self.check_active();
        Some(chosen)
    }

    fn select_least_progressed(&mut self) -> Option<usize> {
        if self.measurements.is_empty() {
            return None;
        }
        self.started = true;

        let any_incomplete = self.measurements.iter().any(|m| !m.is_complete());
        let candidates = |m: &Measurement| !any_incomplete || !m.is_complete();

        let lowest: Progress = self
            .measurements
            .iter()
            .filter(|m| candidates(*m))
            .map(Measurement::progress)
            .min()?;
        let tied: Vec<usize> = self
            .measurements
            .iter()
            .enumerate()
            .filter(|(_, m)| candidates(*m) && m.progress() == lowest)
            .map(|(i, _)| i)
            .collect();

        let chosen = self.rng.choose(&tied)?;
        self.active = chosen;
        debug!(
            "next condition {} (progress {:.3}, {} tied)",
            chosen,
            lowest.ratio(),
            tied.len()
        );
        Some(chosen)
    }

    fn check_active(&mut self) {
        if self.is_complete() {
            return;
        }
        let ok = !self.measurements[self.active].is_complete();
        debug_assert!(ok, "active condition {} is already complete", self.active);
        if !ok {
            self.recover_active();
        }
    }

    fn recover_active(&mut self) {
        error!(
            "active condition {} is already complete; reselecting",
            self.active
        );
        self.select_least_progressed();
    }

    /// Route a response to the active measurement.
    pub fn process_response(&mut self, correct: bool) -> Result<(), ResponseError> {
        if self.measurements.is_empty() {
            warn!("response received but no conditions are scheduled");
            return Err(ResponseError::NoConditions);
        }
        if self.is_complete() {
            warn!("response received after every condition completed");
            return Err(ResponseError::SessionComplete);
        }
        self.started = true;
        self.check_active();
        self.measurements[self.active].process_response(correct, &mut self.rng)?;
        self.total_trials_run += 1;
        Ok(())
    }

    /// True once every measurement is complete. An empty scheduler is never complete.
    pub fn is_complete(&self) -> bool {
        !self.measurements.is_empty() && self.measurements.iter().all(Measurement::is_complete)
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn active_index(&self) -> Option<usize> {
        if self.measurements.is_empty() {
            None
        } else {
            Some(self.active)
        }
    }

    pub fn active(&self) -> Option<&Measurement> {
        self.measurements.get(self.active)
    }

    pub fn stimulus_level(&self) -> Option<f32> {
        self.active().map(Measurement::level)
    }

    pub fn condition(&self) -> Option<&ExperimentalCondition> {
        self.active().map(Measurement::condition)
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn total_trials_run(&self) -> u64 {
        self.total_trials_run
    }

    /// Mean progress over all conditions, for progress bars.
    pub fn overall_progress(&self) -> f32 {
        if self.measurements.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.measurements.iter().map(Measurement::progress_ratio).sum();
        sum / self.measurements.len() as f32
    }

    pub fn condition_table(&self) -> Vec<ConditionRecord> {
        self.measurements
            .iter()
            .enumerate()
            .map(|(index, m)| ConditionRecord {
                index,
                method: m.method_name().to_string(),
                params: m.condition().clone(),
            })
            .collect()
    }

    pub fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AddConditionError {
    #[error(transparent)]
    Config(ConfigError),
    #[error(transparent)]
    Schedule(ScheduleError),
}
