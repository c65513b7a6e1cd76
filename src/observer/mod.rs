use crate::presentation::StimulusPresenter;
use crate::prng::RandomSource;
use crate::trial::{TrialPhase, TrialStateMachine};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A read-only snapshot of one measurement.
///
/// Design intent:
/// - Observers cannot mutate or steer the session.
/// - Snapshotting is *on-demand* and can allocate; the tick loop stays unchanged.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeasurementSnapshot {
    pub index: usize,
    pub method: String,
    pub level: f32,
    pub trials: usize,
    pub reversals: u32,
    pub progress: f32,
    pub complete: bool,
    pub accuracy: f32,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SessionSnapshot {
    pub session_id: String,
    pub phase: TrialPhase,
    pub block_index: u32,
    pub trials_run: u64,
    pub overall_progress: f32,
    /// Unused task time over correct trials, in whole seconds.
    pub score: i64,
    pub measurements: Vec<MeasurementSnapshot>,
}

pub fn snapshot<P, R>(machine: &TrialStateMachine<P, R>) -> SessionSnapshot
where
    P: StimulusPresenter,
    R: RandomSource,
{
    let scheduler = machine.scheduler();
    SessionSnapshot {
        session_id: machine.session_id().to_string(),
        phase: machine.phase(),
        block_index: machine.state().block_index,
        trials_run: scheduler.total_trials_run(),
        overall_progress: scheduler.overall_progress(),
        score: machine.score(),
        measurements: scheduler
            .measurements()
            .iter()
            .enumerate()
            .map(|(index, m)| {
                let history = m.history();
                let correct = history.iter().filter(|r| r.correct).count();
                MeasurementSnapshot {
                    index,
                    method: m.method_name().to_string(),
                    level: m.level(),
                    trials: history.len(),
                    reversals: m.reversals(),
                    progress: m.progress_ratio(),
                    complete: m.is_complete(),
                    accuracy: if history.is_empty() {
                        0.0
                    } else {
                        correct as f32 / history.len() as f32
                    },
                }
            })
            .collect(),
    }
}
