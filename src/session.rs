//! Session sequencing: one trial machine per session, run in experiment order.
//!
//! The controller owns the presenter and the recorder for the whole experiment
//! and hands them to whichever session is running. Sessions already completed
//! (for example in an earlier run by the same subject) are skipped.

use tracing::{info, warn};

use crate::config::{ExperimentConfig, SessionConfig};
use crate::error::{ConfigError, SessionError};
use crate::presentation::StimulusPresenter;
use crate::prng::Prng;
use crate::record::TrialRecorder;
use crate::scheduler::ConditionScheduler;
use crate::trial::{TickInput, Transition, TrialPhase, TrialStateMachine};

pub struct SessionController<P: StimulusPresenter, W: TrialRecorder> {
    sessions: Vec<SessionConfig>,
    rng: Prng,
    presenter: P,
    recorder: W,
    current: Option<(usize, TrialStateMachine<P>)>,
    completed: Vec<String>,
}

impl<P: StimulusPresenter, W: TrialRecorder> SessionController<P, W> {
    /// Validate the whole experiment up front. Nothing is started yet.
    pub fn new(
        experiment: ExperimentConfig,
        presenter: P,
        recorder: W,
    ) -> Result<Self, ConfigError> {
        experiment.validate()?;
        let rng = match experiment.seed {
            Some(seed) => Prng::new(seed),
            #[cfg(feature = "std")]
            None => Prng::from_entropy(),
            #[cfg(not(feature = "std"))]
            None => Prng::new(0),
        };
        Ok(Self {
            sessions: experiment.sessions,
            rng,
            presenter,
            recorder,
            current: None,
            completed: Vec::new(),
        })
    }

    /// Mark sessions as already done so `advance` skips them.
    pub fn with_completed<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            let id = id.into();
            if !self.completed.contains(&id) {
                self.completed.push(id);
            }
        }
        self
    }

    /// Start the next session that has not been completed.
    ///
    /// Returns the id of the started session, or `None` when every session is done.
    pub fn advance(&mut self) -> Result<Option<&str>, SessionError> {
        self.ensure_idle()?;
        let after = self.current.as_ref().map_or(0, |(i, _)| i + 1);
        let next = (after..self.sessions.len())
            .chain(0..after)
            .find(|&i| !self.completed.contains(&self.sessions[i].id));
        match next {
            Some(i) => {
                self.start(i)?;
                Ok(self.current_session_id())
            }
            None => {
                self.current = None;
                info!("all {} sessions complete", self.sessions.len());
                Ok(None)
            }
        }
    }

    /// Start a specific session by id, completed or not.
    pub fn start_session(&mut self, id: &str) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let i = self
            .sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;
        self.start(i)
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        match &self.current {
            Some((_, m)) if !m.is_complete() => {
                Err(SessionError::InProgress(m.session_id().to_string()))
            }
            _ => Ok(()),
        }
    }

    fn start(&mut self, index: usize) -> Result<(), SessionError> {
        let session = &self.sessions[index];
        let conditions = session.resolve_conditions()?;
        let scheduler = ConditionScheduler::from_conditions(conditions, self.rng.fork())?;
        self.recorder
            .record_conditions(&session.id, &scheduler.condition_table());
        let machine = TrialStateMachine::new(session, scheduler)?;
        info!(
            "starting session {} ({} conditions)",
            session.id,
            machine.scheduler().len()
        );
        self.current = Some((index, machine));
        Ok(())
    }

    /// Advance the running session by one tick.
    pub fn update(&mut self, now: f64, input: TickInput) -> Option<Transition> {
        let (_, machine) = self.current.as_mut()?;
        let transition = machine.update(now, input, &mut self.presenter, &mut self.recorder)?;
        if transition.to == TrialPhase::Complete {
            let id = machine.session_id().to_string();
            if !self.completed.contains(&id) {
                self.completed.push(id);
            }
        }
        Some(transition)
    }

    /// Abort the running session. It is not marked completed.
    pub fn abort(&mut self, now: f64) -> Option<Transition> {
        let (_, machine) = self.current.as_mut()?;
        let t = machine.abort(now, &mut self.presenter);
        if t.is_some() {
            warn!(
                "session {} aborted after {} trials",
                machine.session_id(),
                machine.scheduler().total_trials_run()
            );
        }
        t
    }

    pub fn current(&self) -> Option<&TrialStateMachine<P>> {
        self.current.as_ref().map(|(_, m)| m)
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current().map(TrialStateMachine::session_id)
    }

    pub fn phase(&self) -> Option<TrialPhase> {
        self.current().map(TrialStateMachine::phase)
    }

    pub fn sessions(&self) -> &[SessionConfig] {
        &self.sessions
    }

    pub fn completed_sessions(&self) -> &[String] {
        &self.completed
    }

    pub fn remaining_sessions(&self) -> Vec<&str> {
        self.sessions
            .iter()
            .filter(|s| !self.completed.contains(&s.id))
            .map(|s| s.id.as_str())
            .collect()
    }

    pub fn all_sessions_complete(&self) -> bool {
        self.sessions.iter().all(|s| self.completed.contains(&s.id))
    }

    /// Completed sessions plus the running session's progress, over all sessions.
    pub fn overall_progress(&self) -> f32 {
        if self.sessions.is_empty() {
            return 1.0;
        }
        let done = self
            .sessions
            .iter()
            .filter(|s| self.completed.contains(&s.id))
            .count() as f32;
        let running = match self.current() {
            Some(m) if !self.completed.iter().any(|id| id == m.session_id()) => {
                m.scheduler().overall_progress()
            }
            _ => 0.0,
        };
        (done + running) / self.sessions.len() as f32
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn recorder(&self) -> &W {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut W {
        &mut self.recorder
    }

    pub fn into_parts(self) -> (P, W) {
        (self.presenter, self.recorder)
    }
}
