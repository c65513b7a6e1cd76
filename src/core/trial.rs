//! Trial presentation state machine.
//!
//! One machine runs one session. It is advanced by [`TrialStateMachine::update`]
//! once per simulation tick with the current session clock (seconds). Every
//! state owns a stopwatch that restarts on each transition; waiting is just
//! "elapsed < threshold, stay here" re-checked on the next tick. At most one
//! transition happens per tick, so no state is ever skipped.
//!
//! ```text
//! Initial ─▶ Pretrial ─▶ Task ─▶ Feedback ─┬─▶ Pretrial           (next trial)
//!    ▲                                      ├─▶ Initial            (block complete)
//!    └──────────────────────────────────────┘
//!                                           └─▶ SessionFeedback ─▶ Complete
//! ```

use tracing::{debug, info, warn};

use crate::config::{SessionConfig, TimingConfig};
use crate::error::ConfigError;
use crate::prng::{Prng, RandomSource};
use crate::presentation::{StimulusParams, StimulusPresenter};
use crate::record::{TrialRecord, TrialRecorder};
use crate::scheduler::ConditionScheduler;

pub const NO_SESSION_MESSAGE: &str = "No session available.";
pub const SESSION_COMPLETE_MESSAGE: &str = "Session complete!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TrialPhase {
    Initial,
    Pretrial,
    Task,
    Feedback,
    SessionFeedback,
    Complete,
}

/// Subject input sampled for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickInput {
    /// Click/keypress that opens a gate (start of block, leaving session feedback).
    pub start: bool,
    /// Response captured this tick, if any.
    pub response: Option<bool>,
    /// Response inputs (clicks, key presses) spent this tick.
    pub response_inputs: u32,
}

impl TickInput {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn start() -> Self {
        Self {
            start: true,
            ..Self::default()
        }
    }

    pub fn respond(correct: bool) -> Self {
        Self {
            response: Some(correct),
            response_inputs: 1,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub from: TrialPhase,
    pub to: TrialPhase,
    pub at: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialState {
    pub phase: TrialPhase,
    pub elapsed_in_state: f64,
    /// Response of the last finished trial (`None` before the first trial).
    pub response: Option<bool>,
    pub block_index: u32,
    pub trials_in_block: u32,
    pub completed_trials_per_condition: Vec<u32>,
    pub remaining_trials_per_condition: Vec<u64>,
    /// Unused task time summed over correct trials (seconds).
    pub score: f64,
}

pub struct TrialStateMachine<P: StimulusPresenter, R: RandomSource = Prng> {
    session_id: String,
    description: String,
    training: bool,
    timing: TimingConfig,
    stimuli_per_trial: u32,
    pretrial_lambda: Option<f64>,
    scheduler: ConditionScheduler<R>,
    state: TrialState,
    entered_at: Option<f64>,
    pretrial_duration: f64,
    task_started_at: f64,
    inputs_used: u32,
    handles: Vec<P::Handle>,
    feedback_message: String,
    awaiting_block_start: bool,
    aborted: bool,
}

impl<P: StimulusPresenter, R: RandomSource> TrialStateMachine<P, R> {
    pub fn new(
        session: &SessionConfig,
        scheduler: ConditionScheduler<R>,
    ) -> Result<Self, ConfigError> {
        session.timing.validate()?;
        let pretrial_lambda = session.timing.pretrial_duration_range.map(|[min, max]| {
            truncated_exp_lambda(session.timing.pretrial_duration as f64, min as f64, max as f64)
        });
        let n = scheduler.len();
        let mut machine = Self {
            session_id: session.id.clone(),
            description: session.description.clone(),
            training: session.is_training(),
            timing: session.timing.clone(),
            stimuli_per_trial: session.stimuli_per_trial.max(1),
            pretrial_lambda,
            scheduler,
            state: TrialState {
                phase: TrialPhase::Initial,
                elapsed_in_state: 0.0,
                response: None,
                block_index: 0,
                trials_in_block: 0,
                completed_trials_per_condition: vec![0; n],
                remaining_trials_per_condition: vec![0; n],
                score: 0.0,
            },
            entered_at: None,
            pretrial_duration: session.timing.pretrial_duration as f64,
            task_started_at: 0.0,
            inputs_used: 0,
            handles: Vec::new(),
            feedback_message: String::new(),
            awaiting_block_start: false,
            aborted: false,
        };
        machine.refresh_remaining();
        if machine.timing.click_to_start && !machine.scheduler.is_empty() {
            machine.feedback_message = "Click to begin.".to_string();
        }
        Ok(machine)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> TrialPhase {
        self.state.phase
    }

    pub fn state(&self) -> &TrialState {
        &self.state
    }

    pub fn scheduler(&self) -> &ConditionScheduler<R> {
        &self.scheduler
    }

    pub fn feedback_message(&self) -> &str {
        &self.feedback_message
    }

    pub fn is_complete(&self) -> bool {
        self.state.phase == TrialPhase::Complete
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Session score as shown to the subject (whole seconds of unused task time).
    pub fn score(&self) -> i64 {
        self.state.score as i64
    }

    /// Pretrial duration in effect for the current (or next) trial.
    pub fn pretrial_duration(&self) -> f64 {
        self.pretrial_duration
    }

    pub fn live_stimuli(&self) -> usize {
        self.handles.len()
    }

    /// Seconds left before the task times out (0 outside `Task`).
    pub fn remaining_task_time(&self, now: f64) -> f64 {
        if self.state.phase != TrialPhase::Task {
            return 0.0;
        }
        let elapsed = now - self.entered_at.unwrap_or(now);
        (self.timing.max_trial_duration as f64 - elapsed).max(0.0)
    }

    /// Advance one tick. Returns the transition taken, if any.
    pub fn update(
        &mut self,
        now: f64,
        input: TickInput,
        presenter: &mut P,
        recorder: &mut impl TrialRecorder,
    ) -> Option<Transition> {
        let entered = *self.entered_at.get_or_insert(now);
        let elapsed = (now - entered).max(0.0);
        self.state.elapsed_in_state = elapsed;

        let next = match self.state.phase {
            TrialPhase::Initial => {
                if self.scheduler.is_empty() {
                    warn!("session {} has no conditions", self.session_id);
                    self.feedback_message = NO_SESSION_MESSAGE.to_string();
                    Some(TrialPhase::SessionFeedback)
                } else if input.start || !(self.timing.click_to_start || self.awaiting_block_start)
                {
                    self.awaiting_block_start = false;
                    self.feedback_message.clear();
                    Some(TrialPhase::Pretrial)
                } else {
                    None
                }
            }
            TrialPhase::Pretrial => {
                if elapsed < self.pretrial_duration {
                    None
                } else if self.scheduler.is_empty() {
                    self.feedback_message = NO_SESSION_MESSAGE.to_string();
                    Some(TrialPhase::SessionFeedback)
                } else {
                    self.spawn_trial_stimuli(now, presenter);
                    Some(TrialPhase::Task)
                }
            }
            TrialPhase::Task => {
                self.inputs_used = self.inputs_used.saturating_add(input.response_inputs);
                let out_of_inputs = self
                    .timing
                    .max_response_inputs
                    .is_some_and(|max| self.inputs_used >= max);
                let timed_out = elapsed >= self.timing.max_trial_duration as f64;
                if input.response.is_some() || timed_out || out_of_inputs {
                    self.finish_trial(now, input.response, presenter, recorder);
                    Some(TrialPhase::Feedback)
                } else {
                    None
                }
            }
            TrialPhase::Feedback => {
                let waiting = elapsed < self.timing.feedback_duration as f64;
                if waiting || !presenter.all_stimuli_cleared() {
                    None
                } else if self.scheduler.is_complete() {
                    self.feedback_message =
                        format!("{} You scored {}!", SESSION_COMPLETE_MESSAGE, self.score());
                    Some(TrialPhase::SessionFeedback)
                } else if self
                    .timing
                    .trials_per_block
                    .is_some_and(|quota| self.state.trials_in_block >= quota)
                {
                    self.state.block_index += 1;
                    self.state.trials_in_block = 0;
                    info!(
                        "session {}: block {} complete",
                        self.session_id, self.state.block_index
                    );
                    // A block break always waits for the subject.
                    self.awaiting_block_start = true;
                    self.feedback_message = format!(
                        "Block {} complete! Click to continue.",
                        self.state.block_index
                    );
                    Some(TrialPhase::Initial)
                } else {
                    self.feedback_message.clear();
                    Some(TrialPhase::Pretrial)
                }
            }
            TrialPhase::SessionFeedback => {
                let gate_open = !self.timing.session_feedback_requires_click || input.start;
                if elapsed >= self.timing.session_feedback_duration as f64 && gate_open {
                    info!(
                        "session {} complete after {} trials",
                        self.session_id,
                        self.scheduler.total_trials_run()
                    );
                    Some(TrialPhase::Complete)
                } else {
                    None
                }
            }
            TrialPhase::Complete => None,
        };

        next.map(|to| self.enter(to, now))
    }

    /// Stop the session from any state. Stimuli are cleared; nothing is recorded.
    pub fn abort(&mut self, now: f64, presenter: &mut P) -> Option<Transition> {
        if self.state.phase == TrialPhase::Complete {
            return None;
        }
        warn!("session {} aborted in {:?}", self.session_id, self.state.phase);
        presenter.clear_stimuli();
        self.handles.clear();
        self.aborted = true;
        Some(self.enter(TrialPhase::Complete, now))
    }

    fn enter(&mut self, to: TrialPhase, now: f64) -> Transition {
        let from = self.state.phase;
        self.state.phase = to;
        self.state.elapsed_in_state = 0.0;
        self.entered_at = Some(now);
        if to == TrialPhase::Pretrial {
            self.pretrial_duration = self.draw_pretrial_duration();
        }
        debug!("{:?} -> {:?} at {:.3}s", from, to, now);
        Transition { from, to, at: now }
    }

    fn draw_pretrial_duration(&mut self) -> f64 {
        match (self.pretrial_lambda, self.timing.pretrial_duration_range) {
            (Some(lambda), Some([min, max])) => {
                let u = self.scheduler.rng_mut().next_f32_01() as f64;
                sample_truncated_exp(lambda, min as f64, max as f64, u)
            }
            _ => self.timing.pretrial_duration as f64,
        }
    }

    fn spawn_trial_stimuli(&mut self, now: f64, presenter: &mut P) {
        self.task_started_at = now;
        self.inputs_used = 0;
        let (Some(condition_index), Some(m)) =
            (self.scheduler.active_index(), self.scheduler.active())
        else {
            return;
        };
        for instance in 0..self.stimuli_per_trial {
            let params = StimulusParams {
                condition_index,
                condition: m.condition(),
                level: m.level(),
                instance,
            };
            self.handles.push(presenter.spawn_stimulus(&params));
        }
    }

    fn finish_trial(
        &mut self,
        now: f64,
        response: Option<bool>,
        presenter: &mut P,
        recorder: &mut impl TrialRecorder,
    ) {
        let correct = response.unwrap_or(false);
        let condition_index = self.scheduler.active_index().unwrap_or(0);
        let level = self.scheduler.stimulus_level().unwrap_or(0.0);
        let execution = now - self.task_started_at;

        // Record before the scheduler moves the level on.
        recorder.record_trial(&TrialRecord {
            condition_index,
            session_id: self.session_id.clone(),
            session_description: self.description.clone(),
            block_index: self.state.block_index,
            start_time: self.task_started_at,
            end_time: now,
            execution_duration: execution,
            level,
            correct,
            timed_out: response.is_none(),
        });

        match self.scheduler.process_response(correct) {
            Ok(()) => {
                let completed = &mut self.state.completed_trials_per_condition;
                if let Some(c) = completed.get_mut(condition_index) {
                    *c += 1;
                }
                self.state.trials_in_block += 1;
                if correct {
                    let unused = self.timing.max_trial_duration as f64 - execution;
                    self.state.score += unused.max(0.0);
                }
            }
            Err(e) => warn!("session {}: response not processed: {}", self.session_id, e),
        }
        self.state.response = Some(correct);
        self.refresh_remaining();

        presenter.clear_stimuli();
        self.handles.clear();

        if !self.scheduler.is_complete() {
            self.scheduler.choose_next_condition();
        }

        self.feedback_message = if !self.training {
            String::new()
        } else if correct {
            format!("Success! {} ms", (execution * 1000.0) as i64)
        } else {
            "Failure!".to_string()
        };
    }

    fn refresh_remaining(&mut self) {
        self.state.remaining_trials_per_condition = self
            .scheduler
            .measurements()
            .iter()
            .map(|m| m.remaining_trials())
            .collect();
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Truncated exponential pretrial durations
// ─────────────────────────────────────────────────────────────────────────

/// Mean of the density `∝ exp(-λ(x - min))` on `[min, min + range]`, minus `min`.
fn truncated_exp_offset_mean(lambda: f64, range: f64) -> f64 {
    if (lambda * range).abs() < 1e-9 {
        return range / 2.0;
    }
    1.0 / lambda - range / (lambda * range).exp_m1()
}

/// Solve for the rate whose truncated exponential on `[min, max]` has the given mean.
/// Zero gives the uniform distribution; positive rates favour short durations.
pub fn truncated_exp_lambda(mean: f64, min: f64, max: f64) -> f64 {
    let range = max - min;
    if range <= 0.0 {
        return 0.0;
    }
    let target = (mean - min).clamp(0.0, range);
    // exp(λ·range) must stay representable.
    let bound = 700.0 / range;
    let (mut lo, mut hi) = (-bound, bound);
    // Offset mean decreases monotonically in λ.
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if truncated_exp_offset_mean(mid, range) > target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Inverse-CDF draw from the truncated exponential, `u` uniform in [0,1).
pub fn sample_truncated_exp(lambda: f64, min: f64, max: f64, u: f64) -> f64 {
    let range = max - min;
    if range <= 0.0 {
        return min;
    }
    let u = u.clamp(0.0, 1.0);
    if (lambda * range).abs() < 1e-9 {
        return min + u * range;
    }
    // F(x) = (1 - e^{-λx}) / (1 - e^{-λR})  =>  x = -ln(1 - u(1 - e^{-λR})) / λ
    let x = -(u * (-lambda * range).exp_m1()).ln_1p() / lambda;
    if x.is_finite() {
        min + x.clamp(0.0, range)
    } else if lambda < 0.0 {
        max
    } else {
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConstantStimuliSpec, ExperimentalCondition, ProcedureSpec, StaircaseSpec};
    use crate::presentation::HeadlessPresenter;
    use crate::record::MemoryRecorder;

    /// Presenter whose stimuli take a number of polls to disappear.
    #[derive(Default)]
    struct FadingPresenter {
        fade_polls: u32,
        fading: std::cell::Cell<u32>,
        spawned: Vec<(usize, f32, u32)>,
    }

    impl StimulusPresenter for FadingPresenter {
        type Handle = usize;

        fn spawn_stimulus(&mut self, params: &StimulusParams<'_>) -> usize {
            self.spawned
                .push((params.condition_index, params.level, params.instance));
            self.spawned.len()
        }

        fn clear_stimuli(&mut self) {
            self.fading.set(self.fade_polls);
        }

        fn all_stimuli_cleared(&self) -> bool {
            let left = self.fading.get();
            if left == 0 {
                true
            } else {
                self.fading.set(left - 1);
                false
            }
        }
    }

    fn session(timing: TimingConfig) -> SessionConfig {
        let mut s = SessionConfig::new("s1");
        s.timing = timing;
        s.with_condition(
            ExperimentalCondition::new().with("label", "mcs"),
            ProcedureSpec::ConstantStimuli(ConstantStimuliSpec {
                levels: vec![1.0, 2.0],
                trials_per_level: Some(vec![2, 2]),
            }),
        )
    }

    fn quick_timing() -> TimingConfig {
        TimingConfig {
            pretrial_duration: 0.0,
            pretrial_duration_range: None,
            max_trial_duration: 1.0,
            feedback_duration: 0.0,
            session_feedback_duration: 0.0,
            click_to_start: false,
            session_feedback_requires_click: false,
            max_response_inputs: None,
            trials_per_block: None,
        }
    }

    fn machine<P: StimulusPresenter>(cfg: &SessionConfig) -> TrialStateMachine<P> {
        let conditions = cfg.resolve_conditions().unwrap();
        let sched = ConditionScheduler::from_conditions(conditions, Prng::new(42)).unwrap();
        TrialStateMachine::new(cfg, sched).unwrap()
    }

    #[test]
    fn response_ends_task_when_it_arrives() {
        let cfg = session(quick_timing());
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();

        let t = m.update(0.0, TickInput::idle(), &mut p, &mut rec).unwrap();
        assert_eq!((t.from, t.to), (TrialPhase::Initial, TrialPhase::Pretrial));
        let t = m.update(0.0, TickInput::idle(), &mut p, &mut rec).unwrap();
        assert_eq!((t.from, t.to), (TrialPhase::Pretrial, TrialPhase::Task));
        assert_eq!(p.spawned(), 1);

        assert_eq!(m.update(0.1, TickInput::idle(), &mut p, &mut rec), None);
        assert_eq!(m.update(0.2, TickInput::idle(), &mut p, &mut rec), None);
        let t = m.update(0.3, TickInput::respond(true), &mut p, &mut rec).unwrap();
        assert_eq!((t.from, t.to, t.at), (TrialPhase::Task, TrialPhase::Feedback, 0.3));

        assert_eq!(rec.trials.len(), 1);
        let r = &rec.trials[0];
        assert_eq!((r.start_time, r.end_time), (0.0, 0.3));
        assert!(r.correct && !r.timed_out);
        assert_eq!(m.scheduler().total_trials_run(), 1);
        assert_eq!(m.state().response, Some(true));
        assert!(p.all_stimuli_cleared());
    }

    #[test]
    fn zero_length_pretrial_is_still_visited() {
        let cfg = session(quick_timing());
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        assert_eq!(m.phase(), TrialPhase::Pretrial);
        // A response arriving during pretrial is ignored; there is no task yet.
        m.update(0.0, TickInput::respond(true), &mut p, &mut rec);
        assert_eq!(m.phase(), TrialPhase::Task);
        assert!(rec.trials.is_empty());
    }

    #[test]
    fn timeout_counts_as_incorrect() {
        let cfg = session(quick_timing());
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        assert_eq!(m.update(0.5, TickInput::idle(), &mut p, &mut rec), None);
        assert!((m.remaining_task_time(0.5) - 0.5).abs() < 1e-9);
        let t = m.update(1.0, TickInput::idle(), &mut p, &mut rec).unwrap();
        assert_eq!(t.to, TrialPhase::Feedback);
        assert!(!rec.trials[0].correct);
        assert!(rec.trials[0].timed_out);
    }

    #[test]
    fn exhausted_input_budget_ends_task() {
        let cfg = session(TimingConfig {
            max_response_inputs: Some(3),
            max_trial_duration: 10.0,
            ..quick_timing()
        });
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        let click = TickInput {
            response_inputs: 1,
            ..TickInput::idle()
        };
        assert_eq!(m.update(0.1, click, &mut p, &mut rec), None);
        assert_eq!(m.update(0.2, click, &mut p, &mut rec), None);
        let t = m.update(0.3, click, &mut p, &mut rec).unwrap();
        assert_eq!(t.to, TrialPhase::Feedback);
        assert!(!rec.trials[0].correct);
    }

    #[test]
    fn feedback_waits_for_stimuli_to_clear() {
        let cfg = session(quick_timing());
        let mut m: TrialStateMachine<FadingPresenter> = machine(&cfg);
        let mut p = FadingPresenter {
            fade_polls: 2,
            ..FadingPresenter::default()
        };
        let mut rec = MemoryRecorder::new();
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        m.update(0.1, TickInput::respond(false), &mut p, &mut rec);
        assert_eq!(m.phase(), TrialPhase::Feedback);

        assert_eq!(m.update(0.2, TickInput::idle(), &mut p, &mut rec), None);
        assert_eq!(m.update(0.3, TickInput::idle(), &mut p, &mut rec), None);
        let t = m.update(0.4, TickInput::idle(), &mut p, &mut rec).unwrap();
        assert_eq!(t.to, TrialPhase::Pretrial);
    }

    #[test]
    fn feedback_waits_for_its_duration() {
        let cfg = session(TimingConfig {
            feedback_duration: 0.5,
            ..quick_timing()
        });
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        m.update(0.25, TickInput::respond(true), &mut p, &mut rec);
        assert_eq!(m.phase(), TrialPhase::Feedback);
        assert_eq!(m.update(0.5, TickInput::idle(), &mut p, &mut rec), None);
        assert_eq!(m.update(0.625, TickInput::idle(), &mut p, &mut rec), None);
        let t = m.update(0.75, TickInput::idle(), &mut p, &mut rec).unwrap();
        assert_eq!((t.from, t.to, t.at), (TrialPhase::Feedback, TrialPhase::Pretrial, 0.75));
    }

    #[test]
    fn unpopulated_session_never_enters_task() {
        let cfg = SessionConfig {
            timing: quick_timing(),
            ..SessionConfig::new("empty")
        };
        let sched = ConditionScheduler::from_conditions(Vec::new(), Prng::new(1)).unwrap();
        let mut m: TrialStateMachine<HeadlessPresenter> =
            TrialStateMachine::new(&cfg, sched).unwrap();
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        let t = m.update(0.0, TickInput::start(), &mut p, &mut rec).unwrap();
        assert_eq!(t.to, TrialPhase::SessionFeedback);
        assert_eq!(m.feedback_message(), NO_SESSION_MESSAGE);
        let t = m.update(0.1, TickInput::idle(), &mut p, &mut rec).unwrap();
        assert_eq!(t.to, TrialPhase::Complete);
        assert_eq!(p.spawned(), 0);
        assert!(rec.trials.is_empty());
    }

    #[test]
    fn click_gate_holds_initial_state() {
        let cfg = session(TimingConfig {
            click_to_start: true,
            ..quick_timing()
        });
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        for i in 0..5 {
            assert_eq!(m.update(i as f64 * 0.1, TickInput::idle(), &mut p, &mut rec), None);
        }
        let t = m.update(0.5, TickInput::start(), &mut p, &mut rec).unwrap();
        assert_eq!(t.to, TrialPhase::Pretrial);
    }

    #[test]
    fn runs_to_completion_and_records_every_trial() {
        let mut cfg = session(TimingConfig {
            trials_per_block: Some(2),
            ..quick_timing()
        });
        cfg.stimuli_per_trial = 2;
        let mut m: TrialStateMachine<FadingPresenter> = machine(&cfg);
        let mut p = FadingPresenter::default();
        let mut rec = MemoryRecorder::new();

        let mut now = 0.0;
        let mut blocks_seen = 0;
        let mut ticks = 0;
        while !m.is_complete() {
            let input = match m.phase() {
                TrialPhase::Task => TickInput::respond(true),
                TrialPhase::Initial => TickInput::start(),
                _ => TickInput::idle(),
            };
            if let Some(t) = m.update(now, input, &mut p, &mut rec) {
                if t.from == TrialPhase::Feedback && t.to == TrialPhase::Initial {
                    blocks_seen += 1;
                }
            }
            now += 0.05;
            ticks += 1;
            assert!(ticks < 10_000);
        }

        assert!(!m.aborted());
        assert!(m.scheduler().is_complete());
        assert_eq!(rec.trials.len(), 4);
        assert_eq!(p.spawned.len(), 8);
        assert!(p.spawned.iter().any(|s| s.2 == 1));
        assert_eq!(m.state().completed_trials_per_condition, vec![4]);
        assert_eq!(m.state().remaining_trials_per_condition, vec![0]);
        // Four trials in blocks of two: one block break, then session feedback.
        assert_eq!(blocks_seen, 1);
        assert_eq!(rec.trials[3].block_index, 1);
        assert!(m.feedback_message().starts_with(SESSION_COMPLETE_MESSAGE));
    }

    #[test]
    fn block_break_waits_for_start_without_click_gate() {
        let cfg = session(TimingConfig {
            trials_per_block: Some(1),
            ..quick_timing()
        });
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        m.update(0.25, TickInput::respond(true), &mut p, &mut rec);
        let t = m.update(0.5, TickInput::idle(), &mut p, &mut rec).unwrap();
        assert_eq!((t.from, t.to), (TrialPhase::Feedback, TrialPhase::Initial));

        for i in 1..=4 {
            let now = 0.5 + i as f64 * 0.25;
            assert_eq!(m.update(now, TickInput::idle(), &mut p, &mut rec), None);
            assert_eq!(m.feedback_message(), "Block 1 complete! Click to continue.");
        }
        let t = m.update(2.0, TickInput::start(), &mut p, &mut rec).unwrap();
        assert_eq!(t.to, TrialPhase::Pretrial);
        assert!(m.feedback_message().is_empty());

        // The next break is gated again.
        m.update(2.0, TickInput::idle(), &mut p, &mut rec);
        m.update(2.25, TickInput::respond(true), &mut p, &mut rec);
        m.update(2.5, TickInput::idle(), &mut p, &mut rec);
        assert_eq!(m.phase(), TrialPhase::Initial);
        assert_eq!(m.update(3.0, TickInput::idle(), &mut p, &mut rec), None);
        assert_eq!(m.state().block_index, 2);
    }

    #[test]
    fn correct_trials_score_unused_task_time() {
        let mut cfg = session(quick_timing());
        cfg.description = "real".to_string();
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        let mut now = 0.0;
        let mut answered = 0;
        while m.phase() != TrialPhase::SessionFeedback {
            let input = if m.phase() == TrialPhase::Task {
                // Three correct answers after a quarter second, one wrong.
                answered += 1;
                TickInput::respond(answered != 2)
            } else {
                TickInput::idle()
            };
            m.update(now, input, &mut p, &mut rec);
            now += 0.25;
            assert!(now < 100.0);
        }

        assert_eq!(rec.trials.len(), 4);
        assert!(rec.trials.iter().all(|t| t.execution_duration == 0.25));
        assert!(rec.trials.iter().all(|t| t.session_description == "real"));
        assert_eq!(m.state().score, 2.25);
        assert_eq!(m.score(), 2);
        assert_eq!(m.feedback_message(), "Session complete! You scored 2!");
    }

    #[test]
    fn timeouts_and_errors_add_nothing_to_score() {
        let cfg = session(quick_timing());
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        let mut now = 0.0;
        while m.phase() != TrialPhase::SessionFeedback {
            // Alternate wrong answers with timeouts.
            let input = match m.phase() {
                TrialPhase::Task if rec.trials.len() % 2 == 0 => TickInput::respond(false),
                _ => TickInput::idle(),
            };
            m.update(now, input, &mut p, &mut rec);
            now += 0.5;
            assert!(now < 100.0);
        }
        assert_eq!(rec.trials.len(), 4);
        assert_eq!(rec.trials.iter().filter(|t| t.timed_out).count(), 2);
        assert_eq!(m.state().score, 0.0);
        assert_eq!(m.feedback_message(), "Session complete! You scored 0!");
    }

    #[test]
    fn session_feedback_can_require_a_click() {
        let cfg = session(TimingConfig {
            session_feedback_requires_click: true,
            ..quick_timing()
        });
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        let mut now = 0.0;
        while m.phase() != TrialPhase::SessionFeedback {
            let input = if m.phase() == TrialPhase::Task {
                TickInput::respond(false)
            } else {
                TickInput::idle()
            };
            m.update(now, input, &mut p, &mut rec);
            now += 0.1;
        }
        assert_eq!(m.update(now + 5.0, TickInput::idle(), &mut p, &mut rec), None);
        let t = m.update(now + 5.1, TickInput::start(), &mut p, &mut rec).unwrap();
        assert_eq!(t.to, TrialPhase::Complete);
    }

    #[test]
    fn abort_clears_stimuli_from_any_state() {
        let cfg = session(quick_timing());
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        m.update(0.0, TickInput::idle(), &mut p, &mut rec);
        assert_eq!(m.phase(), TrialPhase::Task);
        assert_eq!(m.live_stimuli(), 1);

        let t = m.abort(0.2, &mut p).unwrap();
        assert_eq!((t.from, t.to), (TrialPhase::Task, TrialPhase::Complete));
        assert!(m.aborted());
        assert!(p.all_stimuli_cleared());
        assert_eq!(m.live_stimuli(), 0);
        assert!(rec.trials.is_empty());
        assert_eq!(m.abort(0.3, &mut p), None);
        assert_eq!(m.update(0.4, TickInput::respond(true), &mut p, &mut rec), None);
    }

    #[test]
    fn stimuli_use_scheduler_level() {
        let mut cfg = SessionConfig::new("stair");
        cfg.timing = quick_timing();
        let cfg = cfg.with_condition(
            ExperimentalCondition::new(),
            ProcedureSpec::Staircase(StaircaseSpec {
                min_level: 0.0,
                max_level: 4.0,
                min_step_size: 0.5,
                ..StaircaseSpec::default()
            }),
        );
        let mut m: TrialStateMachine<FadingPresenter> = machine(&cfg);
        let mut p = FadingPresenter::default();
        let mut rec = MemoryRecorder::new();
        let mut now = 0.0;
        while p.spawned.len() < 3 {
            let input = if m.phase() == TrialPhase::Task {
                TickInput::respond(true)
            } else {
                TickInput::idle()
            };
            m.update(now, input, &mut p, &mut rec);
            now += 0.1;
        }
        // Start at the easiest level; two correct responses step down by 2.0.
        let levels: Vec<f32> = p.spawned.iter().map(|s| s.1).collect();
        assert_eq!(levels, vec![4.0, 4.0, 2.0]);
        assert_eq!(rec.trials[1].level, 4.0);
    }

    #[test]
    fn truncated_exponential_matches_configured_mean() {
        let (mean, min, max) = (0.6, 0.3, 1.5);
        let lambda = truncated_exp_lambda(mean, min, max);
        assert!(lambda > 0.0);
        assert!((truncated_exp_offset_mean(lambda, max - min) - (mean - min)).abs() < 1e-6);

        let mut rng = Prng::new(77);
        let n = 20_000;
        let mut sum = 0.0;
        for _ in 0..n {
            let x = sample_truncated_exp(lambda, min, max, rng.next_f32_01() as f64);
            assert!((min..=max).contains(&x));
            sum += x;
        }
        assert!((sum / n as f64 - mean).abs() < 0.02);
    }

    #[test]
    fn truncated_exponential_degenerates_to_uniform_at_midpoint() {
        let lambda = truncated_exp_lambda(1.0, 0.5, 1.5);
        assert!(lambda.abs() < 1e-6);
        assert!((sample_truncated_exp(0.0, 0.5, 1.5, 0.25) - 0.75).abs() < 1e-12);
        assert!(truncated_exp_lambda(1.4, 0.5, 1.5) < 0.0);
    }

    #[test]
    fn truncated_exponential_above_midpoint_favours_long_durations() {
        let (mean, min, max) = (1.2, 0.5, 1.5);
        let lambda = truncated_exp_lambda(mean, min, max);
        assert!(lambda < 0.0);
        assert!((truncated_exp_offset_mean(lambda, max - min) - (mean - min)).abs() < 1e-6);
        assert_eq!(sample_truncated_exp(lambda, min, max, 0.0), min);
        assert!((sample_truncated_exp(lambda, min, max, 1.0) - max).abs() < 1e-9);

        let mut rng = Prng::new(5);
        let n = 20_000;
        let (mut sum, mut lo, mut hi) = (0.0, f64::MAX, f64::MIN);
        for _ in 0..n {
            let x = sample_truncated_exp(lambda, min, max, rng.next_f32_01() as f64);
            assert!((min..=max).contains(&x));
            sum += x;
            lo = lo.min(x);
            hi = hi.max(x);
        }
        assert!((sum / n as f64 - mean).abs() < 0.02);
        assert!(lo < 0.7 && hi > 1.4);
    }

    #[test]
    fn randomized_pretrial_follows_configured_mean() {
        let mut cfg = SessionConfig::new("jitter");
        cfg.timing = TimingConfig {
            pretrial_duration: 0.6,
            pretrial_duration_range: Some([0.3, 1.5]),
            ..quick_timing()
        };
        let cfg = cfg.with_condition(
            ExperimentalCondition::new(),
            ProcedureSpec::ConstantStimuli(ConstantStimuliSpec {
                levels: vec![1.0],
                trials_per_level: Some(vec![400]),
            }),
        );
        let mut m: TrialStateMachine<HeadlessPresenter> = machine(&cfg);
        let mut p = HeadlessPresenter::new();
        let mut rec = MemoryRecorder::new();
        let mut now = 0.0;
        let mut durations = Vec::new();
        while !m.is_complete() {
            let input = if m.phase() == TrialPhase::Task {
                TickInput::respond(true)
            } else {
                TickInput::idle()
            };
            if let Some(t) = m.update(now, input, &mut p, &mut rec) {
                if t.to == TrialPhase::Pretrial {
                    durations.push(m.pretrial_duration());
                }
            }
            now += 0.01;
        }
        assert_eq!(durations.len(), 400);
        assert!(durations.iter().all(|d| (0.3..=1.5).contains(d)));
        let lo = durations.iter().cloned().fold(f64::MAX, f64::min);
        let hi = durations.iter().cloned().fold(f64::MIN, f64::max);
        assert!(lo < 0.4 && hi > 1.0);
        let mean = durations.iter().sum::<f64>() / durations.len() as f64;
        assert!((mean - 0.6).abs() < 0.05, "mean pretrial {}", mean);
        // Each trial waited out its own drawn duration.
        assert_eq!(rec.trials.len(), 400);
    }
}
