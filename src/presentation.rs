//! Boundary to whatever draws stimuli on screen.

use crate::config::ExperimentalCondition;

/// What the presentation layer needs to spawn one stimulus instance.
#[derive(Debug, Clone, PartialEq)]
pub struct StimulusParams<'a> {
    pub condition_index: usize,
    pub condition: &'a ExperimentalCondition,
    pub level: f32,
    /// Instance number within the trial (0-based).
    pub instance: u32,
}

/// Spawns and clears stimuli. Called at `Pretrial -> Task`, and polled before
/// leaving `Feedback` so a trial never overlaps the previous trial's stimuli.
pub trait StimulusPresenter {
    type Handle;

    fn spawn_stimulus(&mut self, params: &StimulusParams<'_>) -> Self::Handle;
    fn clear_stimuli(&mut self);
    fn all_stimuli_cleared(&self) -> bool;
}

/// Presenter with nothing on screen; clearing is immediate.
#[derive(Debug, Default, Clone)]
pub struct HeadlessPresenter {
    live: usize,
    spawned: u64,
}

impl HeadlessPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawned(&self) -> u64 {
        self.spawned
    }
}

impl StimulusPresenter for HeadlessPresenter {
    type Handle = u64;

    fn spawn_stimulus(&mut self, _params: &StimulusParams<'_>) -> u64 {
        self.live += 1;
        self.spawned += 1;
        self.spawned
    }

    fn clear_stimuli(&mut self) {
        self.live = 0;
    }

    fn all_stimuli_cleared(&self) -> bool {
        self.live == 0
    }
}
