//! Single-condition adaptive procedures.
//!
//! A [`Measurement`] binds one [`ExperimentalCondition`] to one procedure and owns
//! its level state and response history. Three procedures are available:
//!
//! - continuous up/down staircase over `[min_level, max_level]`
//! - indexed staircase over a fixed level table
//! - method of constant stimuli (balanced sampling of a fixed table)
//!
//! Responses are `correct: bool`. A correct response means the stimulus was
//! "too strong" (the staircase moves toward harder levels); an incorrect response
//! means it was "too weak" (the staircase moves toward easier levels).

use core::cmp::Ordering;

use tracing::{debug, error};

use crate::config::{
    ConstantStimuliConfig, ExperimentalCondition, IndexedStaircaseConfig, ProcedureConfig,
    StaircaseConfig,
};
use crate::error::{ConfigError, ResponseError};
use crate::prng::RandomSource;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResponseRecord {
    pub level: f32,
    pub correct: bool,
    /// Reversal count before this response was processed (staircases only).
    pub reversals: u32,
}

/// Last direction of travel of a staircase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Down,
    Still,
    Up,
}

impl Direction {
    pub fn sign(self) -> i32 {
        match self {
            Direction::Down => -1,
            Direction::Still => 0,
            Direction::Up => 1,
        }
    }
}

/// Completion fraction kept as an exact ratio so ties compare exactly.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(done: u64, total: u64) -> Self {
        let total = total.max(1);
        Self {
            done: done.min(total),
            total,
        }
    }

    pub fn finished() -> Self {
        Self { done: 1, total: 1 }
    }

    pub fn ratio(&self) -> f32 {
        self.done as f32 / self.total as f32
    }

    pub fn is_finished(&self) -> bool {
        self.done >= self.total
    }
}

impl PartialEq for Progress {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Progress {}

impl PartialOrd for Progress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Progress {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.done as u128 * other.total as u128;
        let rhs = other.done as u128 * self.total as u128;
        lhs.cmp(&rhs)
    }
}

// ─────────────────────────────────────────────────────────────────────────
// N-up/M-down bookkeeping shared by both staircases
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Step {
    direction: Direction,
    reversal: bool,
}

#[derive(Debug, Clone)]
struct UpDownRule {
    num_up: u32,
    num_down: u32,
    max_limit_hits: u32,
    up_count: u32,
    down_count: u32,
    direction: Direction,
    reversals: u32,
    limit_hits: u32,
}

impl UpDownRule {
    fn new(num_up: u32, num_down: u32, max_limit_hits: u32) -> Self {
        Self {
            num_up,
            num_down,
            max_limit_hits,
            up_count: 0,
            down_count: 0,
            direction: Direction::Still,
            reversals: 0,
            limit_hits: 0,
        }
    }

    /// Count a response; returns the step to take once a run is long enough.
    fn register(&mut self, correct: bool) -> Option<Step> {
        let direction = if correct {
            self.down_count += 1;
            self.up_count = 0;
            if self.down_count < self.num_down {
                return None;
            }
            self.down_count = 0;
            Direction::Down
        } else {
            self.up_count += 1;
            self.down_count = 0;
            if self.up_count < self.num_up {
                return None;
            }
            self.up_count = 0;
            Direction::Up
        };

        let reversal = matches!(
            (self.direction, direction),
            (Direction::Up, Direction::Down) | (Direction::Down, Direction::Up)
        );
        if reversal {
            self.reversals += 1;
        }
        self.direction = direction;
        Some(Step {
            direction,
            reversal,
        })
    }

    /// Record whether the last move was clipped at a bound. Repeated clipping
    /// counts as a reversal so a staircase pinned at a bound still terminates.
    fn settle(&mut self, clipped: bool) {
        if clipped {
            self.limit_hits += 1;
            if self.limit_hits >= self.max_limit_hits {
                self.reversals += 1;
                self.limit_hits = 0;
            }
        } else {
            self.limit_hits = 0;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Procedures
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ContinuousStaircase {
    config: StaircaseConfig,
    level: f32,
    step_size: f32,
    rule: UpDownRule,
}

impl ContinuousStaircase {
    fn new(config: StaircaseConfig, rng: &mut impl RandomSource) -> Self {
        // Jitter the start by whole multiples of the minimum step.
        let perturbation = if config.min_step_size == 0.0 {
            0.0
        } else {
            let n = (config.init_level_random_range / config.min_step_size).floor();
            let n = n.clamp(0.0, u32::MAX as f32) as u32;
            rng.gen_symmetric_i64(n) as f32 * config.min_step_size
        };
        let level = (config.init_level + perturbation).clamp(config.min_level, config.max_level);
        let rule = UpDownRule::new(config.num_up, config.num_down, config.max_limit_hits);
        Self {
            step_size: config.init_step_size,
            level,
            rule,
            config,
        }
    }

    fn apply(&mut self, correct: bool) {
        let Some(step) = self.rule.register(correct) else {
            return;
        };
        if step.reversal {
            self.step_size = (self.step_size / 2.0).max(self.config.min_step_size);
        }
        let target = self.level + step.direction.sign() as f32 * self.step_size;
        let clipped = target > self.config.max_level || target < self.config.min_level;
        self.level = target.clamp(self.config.min_level, self.config.max_level);
        self.rule.settle(clipped);
    }

    pub fn config(&self) -> &StaircaseConfig {
        &self.config
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn step_size(&self) -> f32 {
        self.step_size
    }

    pub fn direction(&self) -> Direction {
        self.rule.direction
    }

    pub fn limit_hits(&self) -> u32 {
        self.rule.limit_hits
    }
}

#[derive(Debug, Clone)]
pub struct IndexedStaircase {
    config: IndexedStaircaseConfig,
    index: usize,
    step: u32,
    rule: UpDownRule,
}

impl IndexedStaircase {
    fn new(config: IndexedStaircaseConfig, rng: &mut impl RandomSource) -> Self {
        let last = config.levels.len() as i64 - 1;
        let jitter = rng.gen_symmetric_i64(config.init_index_random_range);
        let index = (config.init_index as i64 + jitter).clamp(0, last) as usize;
        let rule = UpDownRule::new(config.num_up, config.num_down, config.max_limit_hits);
        Self {
            step: config.init_index_step_size,
            index,
            rule,
            config,
        }
    }

    fn apply(&mut self, correct: bool) {
        let Some(step) = self.rule.register(correct) else {
            return;
        };
        if step.reversal {
            self.step = (self.step / 2).max(1);
        }
        let last = self.config.levels.len() as i64 - 1;
        let target = self.index as i64 + step.direction.sign() as i64 * self.step as i64;
        let clipped = target > last || target < 0;
        self.index = target.clamp(0, last) as usize;
        self.rule.settle(clipped);
    }

    pub fn config(&self) -> &IndexedStaircaseConfig {
        &self.config
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn level(&self) -> f32 {
        self.config.levels[self.index]
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn direction(&self) -> Direction {
        self.rule.direction
    }
}

#[derive(Debug, Clone)]
pub struct ConstantStimuli {
    config: ConstantStimuliConfig,
    index: usize,
    counts: Vec<u32>,
}

impl ConstantStimuli {
    fn new(config: ConstantStimuliConfig, rng: &mut impl RandomSource) -> Self {
        let index = rng.gen_range_usize(0, config.levels.len());
        let counts = vec![0; config.levels.len()];
        Self {
            config,
            index,
            counts,
        }
    }

    fn level_progress(&self, i: usize) -> Progress {
        Progress::new(
            self.counts[i] as u64,
            self.config.trials_per_level[i] as u64,
        )
    }

    fn apply(&mut self, rng: &mut impl RandomSource) {
        self.counts[self.index] += 1;

        // Move to a level that is furthest behind its budget.
        let Some(lowest) = (0..self.counts.len()).map(|i| self.level_progress(i)).min() else {
            return;
        };
        let tied: Vec<usize> = (0..self.counts.len())
            .filter(|&i| self.level_progress(i) == lowest)
            .collect();
        if let Some(next) = rng.choose(&tied) {
            self.index = next;
        }
    }

    pub fn config(&self) -> &ConstantStimuliConfig {
        &self.config
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn level(&self) -> f32 {
        self.config.levels[self.index]
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    pub fn total_count(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }
}

#[derive(Debug, Clone)]
pub enum Procedure {
    Staircase(ContinuousStaircase),
    IndexedStaircase(IndexedStaircase),
    ConstantStimuli(ConstantStimuli),
}

// ─────────────────────────────────────────────────────────────────────────
// Measurement
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Measurement {
    condition: ExperimentalCondition,
    procedure: Procedure,
    history: Vec<ResponseRecord>,
}

impl Measurement {
    pub fn new(
        condition: ExperimentalCondition,
        config: ProcedureConfig,
        rng: &mut impl RandomSource,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let procedure = match config {
            ProcedureConfig::Staircase(c) => Procedure::Staircase(ContinuousStaircase::new(c, rng)),
            ProcedureConfig::IndexedStaircase(c) => {
                Procedure::IndexedStaircase(IndexedStaircase::new(c, rng))
            }
            ProcedureConfig::ConstantStimuli(c) => {
                Procedure::ConstantStimuli(ConstantStimuli::new(c, rng))
            }
        };
        Ok(Self {
            condition,
            procedure,
            history: Vec::new(),
        })
    }

    pub fn condition(&self) -> &ExperimentalCondition {
        &self.condition
    }

    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }

    pub fn history(&self) -> &[ResponseRecord] {
        &self.history
    }

    pub fn method_name(&self) -> &'static str {
        match &self.procedure {
            Procedure::Staircase(_) => "staircase",
            Procedure::IndexedStaircase(_) => "indexed_staircase",
            Procedure::ConstantStimuli(_) => "constant_stimuli",
        }
    }

    /// Stimulus level to present on the next trial.
    pub fn level(&self) -> f32 {
        match &self.procedure {
            Procedure::Staircase(s) => s.level(),
            Procedure::IndexedStaircase(s) => s.level(),
            Procedure::ConstantStimuli(m) => m.level(),
        }
    }

    /// Index into the level table (indexed staircase and constant stimuli only).
    pub fn index(&self) -> Option<usize> {
        match &self.procedure {
            Procedure::Staircase(_) => None,
            Procedure::IndexedStaircase(s) => Some(s.index()),
            Procedure::ConstantStimuli(m) => Some(m.index()),
        }
    }

    pub fn reversals(&self) -> u32 {
        match &self.procedure {
            Procedure::Staircase(s) => s.rule.reversals,
            Procedure::IndexedStaircase(s) => s.rule.reversals,
            Procedure::ConstantStimuli(_) => 0,
        }
    }

    pub fn trial_count(&self) -> usize {
        self.history.len()
    }

    pub fn progress(&self) -> Progress {
        let trials = self.history.len() as u64;
        match &self.procedure {
            Procedure::Staircase(s) => staircase_progress(
                trials,
                s.rule.reversals,
                s.config.max_total_trials,
                s.config.max_reversals,
            ),
            Procedure::IndexedStaircase(s) => staircase_progress(
                trials,
                s.rule.reversals,
                s.config.max_total_trials,
                s.config.max_reversals,
            ),
            Procedure::ConstantStimuli(m) => {
                Progress::new(m.total_count(), m.config.total_trials())
            }
        }
    }

    pub fn progress_ratio(&self) -> f32 {
        self.progress().ratio()
    }

    pub fn is_complete(&self) -> bool {
        let trials = self.history.len() as u64;
        match &self.procedure {
            Procedure::Staircase(s) => {
                s.rule.reversals >= s.config.max_reversals
                    || trials >= s.config.max_total_trials as u64
            }
            Procedure::IndexedStaircase(s) => {
                s.rule.reversals >= s.config.max_reversals
                    || trials >= s.config.max_total_trials as u64
            }
            Procedure::ConstantStimuli(m) => m.total_count() == m.config.total_trials(),
        }
    }

    /// Upper bound on the trials this measurement can still take.
    pub fn remaining_trials(&self) -> u64 {
        let trials = self.history.len() as u64;
        match &self.procedure {
            Procedure::Staircase(s) => (s.config.max_total_trials as u64).saturating_sub(trials),
            Procedure::IndexedStaircase(s) => {
                (s.config.max_total_trials as u64).saturating_sub(trials)
            }
            Procedure::ConstantStimuli(m) => {
                m.config.total_trials().saturating_sub(m.total_count())
            }
        }
    }

    /// Record a response at the current level and choose the next level.
    ///
    /// A measurement that is already complete refuses further responses and is
    /// left unchanged.
    pub fn process_response(
        &mut self,
        correct: bool,
        rng: &mut impl RandomSource,
    ) -> Result<(), ResponseError> {
        if self.is_complete() {
            return Err(ResponseError::MeasurementComplete);
        }

        self.history.push(ResponseRecord {
            level: self.level(),
            correct,
            reversals: self.reversals(),
        });

        match &mut self.procedure {
            Procedure::Staircase(s) => s.apply(correct),
            Procedure::IndexedStaircase(s) => s.apply(correct),
            Procedure::ConstantStimuli(m) => m.apply(rng),
        }
        self.enforce_range();

        debug!(
            "{} response {} -> next level {} (reversals {}, trials {})",
            self.method_name(),
            if correct { "correct" } else { "incorrect" },
            self.level(),
            self.reversals(),
            self.history.len()
        );
        Ok(())
    }

    /// Level/index must stay inside the configured range. Fails loudly in debug
    /// builds; release builds clamp and keep the session running.
    fn enforce_range(&mut self) {
        match &mut self.procedure {
            Procedure::Staircase(s) => {
                let (min, max) = (s.config.min_level, s.config.max_level);
                let in_range = s.level >= min && s.level <= max;
                debug_assert!(in_range, "staircase level {} left [{}, {}]", s.level, min, max);
                if !in_range {
                    error!("staircase level {} left [{}, {}]; clamping", s.level, min, max);
                    s.level = if s.level.is_nan() { max } else { s.level.clamp(min, max) };
                }
            }
            Procedure::IndexedStaircase(s) => {
                let len = s.config.levels.len();
                debug_assert!(
                    s.index < len,
                    "staircase index {} outside table of {}",
                    s.index,
                    len
                );
                if s.index >= len {
                    error!("staircase index {} outside table of {}; clamping", s.index, len);
                    s.index = len - 1;
                }
            }
            Procedure::ConstantStimuli(m) => {
                let len = m.config.levels.len();
                debug_assert!(m.index < len, "level index {} outside table of {}", m.index, len);
                if m.index >= len {
                    error!("level index {} outside table of {}; clamping", m.index, len);
                    m.index = len - 1;
                }
            }
        }
    }
}

fn staircase_progress(
    trials: u64,
    reversals: u32,
    max_trials: u32,
    max_reversals: u32,
) -> Progress {
    if trials >= max_trials as u64 {
        Progress::finished()
    } else {
        Progress::new(reversals as u64, max_reversals as u64)
    }
}
