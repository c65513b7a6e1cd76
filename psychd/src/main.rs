//! psychd - session runner service
//!
//! Runs the sessions of an experiment against a simulated observer on a
//! fixed-rate tick loop and stores every trial as JSON lines.
//!
//! Storage locations:
//! - Linux: ~/.local/share/psychometer/
//! - Windows: %APPDATA%\psychometer\
//! - MacOS: ~/Library/Application Support/psychometer/
//!
//! Environment:
//! - `PSYCHD_DATA_DIR`: override the data directory
//! - `PSYCHD_TICK_HZ`: tick rate (default 120)
//! - `PSYCHD_TIME_SCALE`: session clock speed-up (default 1.0)

use std::path::{Path, PathBuf};
use std::time::Duration;

use psychometer::observer::snapshot;
use psychometer::presentation::HeadlessPresenter;
use psychometer::subject::{SimulatedSubject, SubjectConfig};
use psychometer::{ExperimentConfig, SessionController, TickInput, TrialPhase};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

mod error;
mod paths;
mod recorder;

use error::DaemonError;
use paths::AppPaths;
use recorder::JsonlRecorder;

const DEFAULT_TICK_HZ: u32 = 120;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Progress {
    #[serde(default)]
    completed_sessions: Vec<String>,
}

fn load_progress(path: &Path) -> Result<Progress, DaemonError> {
    if !path.exists() {
        return Ok(Progress::default());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn load_experiment(
    paths: &AppPaths,
    arg: Option<PathBuf>,
) -> Result<ExperimentConfig, DaemonError> {
    if let Some(path) = arg {
        return Ok(ExperimentConfig::load(&path)?);
    }
    let path = paths.experiment_file();
    if path.exists() {
        return Ok(ExperimentConfig::load(&path)?);
    }
    // First run: seed the data dir with the demo experiment so it can be edited.
    let demo = ExperimentConfig::builtin_demo();
    std::fs::write(&path, demo.to_json_pretty()?)?;
    info!("wrote demo experiment to {}", path.display());
    Ok(demo)
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!("ignoring invalid {}={:?}", name, v);
            default
        }),
        Err(_) => default,
    }
}

struct DaemonState {
    paths: AppPaths,
    ctl: SessionController<HeadlessPresenter, JsonlRecorder>,
    subject: SimulatedSubject,
    clock: Instant,
    time_scale: f64,
}

impl DaemonState {
    fn new(
        paths: AppPaths,
        experiment: ExperimentConfig,
        time_scale: f64,
    ) -> Result<Self, DaemonError> {
        let progress = load_progress(&paths.progress_file())?;
        let seed = experiment.seed.unwrap_or(0x5EED);
        let recorder = JsonlRecorder::new(paths.clone());
        let ctl = SessionController::new(experiment, HeadlessPresenter::new(), recorder)?
            .with_completed(progress.completed_sessions);
        Ok(Self {
            paths,
            ctl,
            subject: SimulatedSubject::new(SubjectConfig::default(), seed.rotate_left(17)),
            clock: Instant::now(),
            time_scale,
        })
    }

    fn now(&self) -> f64 {
        self.clock.elapsed().as_secs_f64() * self.time_scale
    }

    /// One tick. Returns `false` once every session is done.
    fn tick(&mut self) -> Result<bool, DaemonError> {
        let idle = self.ctl.current().map_or(true, |m| m.is_complete());
        if idle {
            match self.ctl.advance()? {
                Some(id) => info!("session {} started", id),
                None => return Ok(false),
            }
        }

        let now = self.now();
        let input = match self.ctl.current() {
            Some(m) => self.subject.input_for(m, now),
            None => TickInput::idle(),
        };
        if let Some(t) = self.ctl.update(now, input) {
            if t.to == TrialPhase::Complete {
                self.session_finished()?;
            }
        }
        Ok(true)
    }

    fn session_finished(&self) -> Result<(), DaemonError> {
        if let Some(m) = self.ctl.current() {
            let snap = snapshot(m);
            info!(
                "session {} finished: {} trials, {} written",
                snap.session_id,
                snap.trials_run,
                self.ctl.recorder().trials_written()
            );
            for ms in &snap.measurements {
                info!(
                    "  [{}] {} level={:.3} reversals={} accuracy={:.2}",
                    ms.index, ms.method, ms.level, ms.reversals, ms.accuracy
                );
            }
        }
        self.save_progress()
    }

    fn save_progress(&self) -> Result<(), DaemonError> {
        let progress = Progress {
            completed_sessions: self.ctl.completed_sessions().to_vec(),
        };
        std::fs::write(
            self.paths.progress_file(),
            serde_json::to_string_pretty(&progress)?,
        )?;
        Ok(())
    }

    fn shutdown(&mut self) {
        let now = self.now();
        if self.ctl.abort(now).is_some() {
            info!("Ctrl-C: running session aborted");
        }
        if let Err(e) = self.save_progress() {
            error!("Ctrl-C save failed: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && (args[1] == "--help" || args[1] == "-h") {
        println!("psychd [experiment.json]");
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt::init();

    let paths = AppPaths::new()?;
    info!("data directory {}", paths.data_dir().display());

    let experiment = load_experiment(&paths, args.get(1).map(PathBuf::from))?;
    let tick_hz: u32 = env_or("PSYCHD_TICK_HZ", DEFAULT_TICK_HZ).clamp(1, 1000);
    let time_scale: f64 = env_or("PSYCHD_TIME_SCALE", 1.0_f64).max(1e-3);
    info!(
        "experiment {:?}: {} sessions at {} Hz",
        experiment.name,
        experiment.sessions.len(),
        tick_hz
    );

    let mut state = DaemonState::new(paths, experiment, time_scale)?;

    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / tick_hz as f64));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                state.shutdown();
                break;
            }
            _ = interval.tick() => {
                if !state.tick()? {
                    info!("all sessions complete");
                    break;
                }
            }
        }
    }
    Ok(())
}
