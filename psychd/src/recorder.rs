//! JSON-lines trial log, one file per session run.

use std::fs::File;
use std::io::{LineWriter, Write as _};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use psychometer::record::{TrialRecord, TrialRecorder};
use psychometer::scheduler::ConditionRecord;
use serde::Serialize;
use tracing::{info, warn};

use crate::paths::AppPaths;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    Conditions {
        session_id: &'a str,
        conditions: &'a [ConditionRecord],
    },
    Trial(&'a TrialRecord),
}

pub struct JsonlRecorder {
    paths: AppPaths,
    out: Option<LineWriter<File>>,
    current: Option<PathBuf>,
    trials_written: u64,
}

impl JsonlRecorder {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            out: None,
            current: None,
            trials_written: 0,
        }
    }

    pub fn current_file(&self) -> Option<&PathBuf> {
        self.current.as_ref()
    }

    pub fn trials_written(&self) -> u64 {
        self.trials_written
    }

    fn write(&mut self, line: &Line<'_>) {
        let Some(out) = self.out.as_mut() else {
            warn!("no results file open; record dropped");
            return;
        };
        let res = serde_json::to_string(line)
            .map_err(std::io::Error::from)
            .and_then(|text| writeln!(out, "{}", text));
        if let Err(e) = res {
            warn!("failed to write record: {}", e);
        }
    }
}

impl TrialRecorder for JsonlRecorder {
    fn record_conditions(&mut self, session_id: &str, table: &[ConditionRecord]) {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = self.paths.results_file(session_id, stamp);
        match File::create(&path) {
            Ok(f) => {
                info!("recording session {} to {}", session_id, path.display());
                self.out = Some(LineWriter::new(f));
                self.current = Some(path);
            }
            Err(e) => {
                warn!("could not create {}: {}", path.display(), e);
                self.out = None;
                self.current = None;
            }
        }
        self.write(&Line::Conditions {
            session_id,
            conditions: table,
        });
    }

    fn record_trial(&mut self, record: &TrialRecord) {
        self.write(&Line::Trial(record));
        self.trials_written += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psychometer::config::ExperimentalCondition;

    #[test]
    fn writes_one_line_per_record() {
        let root = std::env::temp_dir().join(format!("psychd-rec-{}", std::process::id()));
        let paths = AppPaths::at(&root).unwrap();
        let mut rec = JsonlRecorder::new(paths);

        let table = vec![ConditionRecord {
            index: 0,
            method: "staircase".to_string(),
            params: ExperimentalCondition::new().with("size", 0.1),
        }];
        rec.record_conditions("s1", &table);
        rec.record_trial(&TrialRecord {
            condition_index: 0,
            session_id: "s1".to_string(),
            session_description: "real".to_string(),
            block_index: 0,
            start_time: 1.0,
            end_time: 1.5,
            execution_duration: 0.5,
            level: 0.25,
            correct: true,
            timed_out: false,
        });

        let path = rec.current_file().unwrap().clone();
        drop(rec);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "conditions");
        assert_eq!(lines[0]["conditions"][0]["method"], "staircase");
        assert_eq!(lines[1]["type"], "trial");
        assert_eq!(lines[1]["correct"], true);
        assert_eq!(lines[1]["level"], 0.25);
        assert_eq!(lines[1]["session_description"], "real");
        let _ = std::fs::remove_dir_all(root);
    }
}
