//! Simulated observer used by the demo binary and the daemon.
//!
//! Responds according to a logistic psychometric function of the stimulus level:
//! higher levels are easier. A condition may carry its own `threshold` parameter.

use crate::config::ExperimentalCondition;
use crate::presentation::StimulusPresenter;
use crate::prng::{Prng, RandomSource};
use crate::trial::{TickInput, TrialPhase, TrialStateMachine};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SubjectConfig {
    pub threshold: f32,
    pub slope: f32,
    /// Chance performance (0.5 for two-alternative tasks).
    pub guess_rate: f32,
    pub lapse_rate: f32,
    /// Mean reaction time in seconds.
    pub reaction_time: f64,
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            slope: 0.05,
            guess_rate: 0.5,
            lapse_rate: 0.02,
            reaction_time: 0.4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedSubject {
    cfg: SubjectConfig,
    rng: Prng,
    pending: Option<(bool, f64)>,
}

impl SimulatedSubject {
    pub fn new(cfg: SubjectConfig, seed: u64) -> Self {
        Self {
            cfg,
            rng: Prng::new(seed),
            pending: None,
        }
    }

    pub fn config(&self) -> &SubjectConfig {
        &self.cfg
    }

    pub fn p_correct(&self, condition: &ExperimentalCondition, level: f32) -> f32 {
        let threshold = condition
            .number("threshold")
            .map_or(self.cfg.threshold, |t| t as f32);
        let slope = self.cfg.slope.max(1e-6);
        let span = (1.0 - self.cfg.guess_rate - self.cfg.lapse_rate).max(0.0);
        self.cfg.guess_rate + span / (1.0 + (-(level - threshold) / slope).exp())
    }

    pub fn respond(&mut self, condition: &ExperimentalCondition, level: f32) -> bool {
        self.rng.next_f32_01() < self.p_correct(condition, level)
    }

    /// Input for this tick: clicks through gates, answers tasks after a reaction time.
    pub fn input_for<P: StimulusPresenter, R: RandomSource>(
        &mut self,
        machine: &TrialStateMachine<P, R>,
        now: f64,
    ) -> TickInput {
        match machine.phase() {
            TrialPhase::Task => {
                if self.pending.is_none() {
                    let scheduler = machine.scheduler();
                    let (Some(condition), Some(level)) =
                        (scheduler.condition(), scheduler.stimulus_level())
                    else {
                        return TickInput::idle();
                    };
                    let correct = self.respond(condition, level);
                    let rt = self.cfg.reaction_time * (0.75 + 0.5 * self.rng.next_f32_01() as f64);
                    self.pending = Some((correct, now + rt));
                }
                match self.pending {
                    Some((correct, at)) if now >= at => {
                        self.pending = None;
                        TickInput::respond(correct)
                    }
                    _ => TickInput::idle(),
                }
            }
            TrialPhase::Initial | TrialPhase::SessionFeedback => {
                self.pending = None;
                TickInput::start()
            }
            _ => {
                self.pending = None;
                TickInput::idle()
            }
        }
    }
}
