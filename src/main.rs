use psychometer::observer::snapshot;
use psychometer::presentation::HeadlessPresenter;
use psychometer::record::MemoryRecorder;
use psychometer::subject::{SimulatedSubject, SubjectConfig};
use psychometer::{ExperimentConfig, SessionController, TrialPhase};

const TICK: f64 = 1.0 / 120.0;
const MAX_SESSION_SECONDS: f64 = 3600.0;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && (args[1] == "--help" || args[1] == "-h" || args[1] == "help") {
        print_help();
        return;
    }
    if args.len() >= 2 && args[1] == "print-demo" {
        match ExperimentConfig::builtin_demo().to_json_pretty() {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("error: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let experiment = if args.len() >= 2 {
        match ExperimentConfig::load(std::path::Path::new(&args[1])) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("error: {}", e);
                std::process::exit(2);
            }
        }
    } else {
        ExperimentConfig::builtin_demo()
    };

    if let Err(e) = run(experiment) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(experiment: ExperimentConfig) -> Result<(), psychometer::SessionError> {
    let name = experiment.name.clone();
    let seed = experiment.seed.unwrap_or(1);
    let mut ctl =
        SessionController::new(experiment, HeadlessPresenter::new(), MemoryRecorder::new())?;
    let mut subject = SimulatedSubject::new(SubjectConfig::default(), seed ^ 0xA5A5);

    println!("experiment {:?}: {} sessions", name, ctl.sessions().len());

    let mut now = 0.0;
    while let Some(id) = ctl.advance()? {
        let id = id.to_string();
        let started = now;
        while ctl.phase().is_some_and(|p| p != TrialPhase::Complete) {
            let input = match ctl.current() {
                Some(m) => subject.input_for(m, now),
                None => break,
            };
            ctl.update(now, input);
            now += TICK;
            if now - started > MAX_SESSION_SECONDS {
                ctl.abort(now);
            }
        }

        if let Some(m) = ctl.current() {
            let snap = snapshot(m);
            println!(
                "session {}: {} trials in {:.1}s{}",
                id,
                snap.trials_run,
                now - started,
                if m.aborted() { " (aborted)" } else { "" }
            );
            for ms in &snap.measurements {
                println!(
                    "  [{}] {:<18} level={:.3} trials={:<4} reversals={:<3} acc={:.2}",
                    ms.index, ms.method, ms.level, ms.trials, ms.reversals, ms.accuracy
                );
            }
        }
        if ctl.current().is_some_and(|m| m.aborted()) {
            break;
        }
    }

    let rec = ctl.recorder();
    println!(
        "done: {} trials recorded, overall accuracy {:.2}, progress {:.0}%",
        rec.trials.len(),
        rec.accuracy(),
        ctl.overall_progress() * 100.0
    );
    Ok(())
}

fn print_help() {
    println!("psychometer (adaptive psychophysics engine, simulated observer demo)");
    println!("usage:");
    println!("  cargo run");
    println!("  cargo run -- <experiment.json>");
    println!("  cargo run -- print-demo");
    println!("  cargo run -- --help");
}
