//! Adaptive psychophysical measurement engine.
//!
//! Decides trial by trial which stimulus intensity to present, interprets the
//! correct/incorrect response and tracks when enough data has been collected.
//!
//! - [`measurement`]: continuous staircase, indexed staircase and the method of
//!   constant stimuli behind one [`measurement::Measurement`] type.
//! - [`scheduler`]: interleaves several measurements, always favouring the one
//!   furthest behind.
//! - [`trial`]: the per-trial presentation state machine, driven by ticks.
//! - [`session`]: runs the sessions of an experiment in order.
//!
//! Rendering, input polling and storage stay outside; they plug in through
//! [`presentation::StimulusPresenter`] and [`record::TrialRecorder`].
//! [`observer`] takes read-only snapshots for display and logs, and [`subject`]
//! simulates a responding observer for demos and soak runs.

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/measurement.rs"]
pub mod measurement;

#[path = "core/scheduler.rs"]
pub mod scheduler;

#[path = "core/trial.rs"]
pub mod trial;

pub mod config;
pub mod error;
pub mod observer;
pub mod presentation;
pub mod record;
pub mod session;
pub mod subject;

pub use config::{ExperimentConfig, ProcedureConfig, ProcedureSpec, SessionConfig, TimingConfig};
pub use error::{ConfigError, ResponseError, ScheduleError, SessionError};
pub use measurement::Measurement;
pub use scheduler::ConditionScheduler;
pub use session::SessionController;
pub use trial::{TickInput, TrialPhase, TrialStateMachine};
