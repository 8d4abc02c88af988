//! Experiment-tracking contract.
//!
//! The engine only calls `init`, `log` and `finish`; what a backend does with
//! the values is its own business. [`JsonlTracker`] appends one JSON line per
//! call next to the run's checkpoints.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait Tracker: Send {
    /// Open (or reopen, when `resume_id` is given) a run. Returns its id.
    fn init(&mut self, project: &str, name: &str, dir: &Path, resume_id: Option<&str>) -> Result<String>;

    fn log(&mut self, step: u64, values: &BTreeMap<String, f64>) -> Result<()>;

    fn finish(&mut self) -> Result<()>;
}

/// Discards everything; ids are still generated so resume bookkeeping works.
#[derive(Debug, Default)]
pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn init(&mut self, _project: &str, _name: &str, _dir: &Path, resume_id: Option<&str>) -> Result<String> {
        Ok(resume_id.map_or_else(new_run_id, str::to_string))
    }

    fn log(&mut self, _step: u64, _values: &BTreeMap<String, f64>) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One line of `tracking.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackingEvent {
    Init {
        run_id: String,
        project: String,
        name: String,
        resumed: bool,
        time: String,
    },
    Log {
        run_id: String,
        step: u64,
        values: BTreeMap<String, f64>,
    },
    Finish {
        run_id: String,
        time: String,
    },
}

/// File name written inside the run directory.
pub const TRACKING_FILE: &str = "tracking.jsonl";

/// Appends [`TrackingEvent`]s to `<dir>/tracking.jsonl`.
#[derive(Debug, Default)]
pub struct JsonlTracker {
    path: Option<PathBuf>,
    file: Option<File>,
    run_id: String,
}

impl JsonlTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write(&mut self, event: &TrackingEvent) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            let mut line = serde_json::to_vec(event)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
        Ok(())
    }
}

impl Tracker for JsonlTracker {
    fn init(&mut self, project: &str, name: &str, dir: &Path, resume_id: Option<&str>) -> Result<String> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(TRACKING_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.path = Some(path);
        self.file = Some(file);
        self.run_id = resume_id.map_or_else(new_run_id, str::to_string);

        let event = TrackingEvent::Init {
            run_id: self.run_id.clone(),
            project: project.to_string(),
            name: name.to_string(),
            resumed: resume_id.is_some(),
            time: chrono::Utc::now().to_rfc3339(),
        };
        self.write(&event)?;
        Ok(self.run_id.clone())
    }

    fn log(&mut self, step: u64, values: &BTreeMap<String, f64>) -> Result<()> {
        let event = TrackingEvent::Log {
            run_id: self.run_id.clone(),
            step,
            // JSON has no NaN; non-finite values are dropped from the log line
            values: values
                .iter()
                .filter(|(_, v)| v.is_finite())
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        };
        self.write(&event)
    }

    fn finish(&mut self) -> Result<()> {
        let event = TrackingEvent::Finish {
            run_id: self.run_id.clone(),
            time: chrono::Utc::now().to_rfc3339(),
        };
        self.write(&event)?;
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_jsonl_tracker_writes_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = JsonlTracker::new();
        let id = tracker.init("proj", "v1/d1", dir.path(), None).unwrap();
        tracker
            .log(3, &BTreeMap::from([("loss".to_string(), 0.5), ("nan".to_string(), f64::NAN)]))
            .unwrap();
        tracker.finish().unwrap();

        let text = std::fs::read_to_string(dir.path().join(TRACKING_FILE)).unwrap();
        let events: Vec<TrackingEvent> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[1],
            TrackingEvent::Log {
                run_id: id.clone(),
                step: 3,
                values: BTreeMap::from([("loss".to_string(), 0.5)]),
            }
        );
    }

    #[test]
    fn test_resume_reuses_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = JsonlTracker::new();
        let id = tracker.init("p", "n", dir.path(), Some("run-1")).unwrap();
        assert_eq!(id, "run-1");

        let mut noop = NoopTracker;
        assert_eq!(noop.init("p", "n", dir.path(), Some("run-1")).unwrap(), "run-1");
        assert_eq!(noop.init("p", "n", dir.path(), None).unwrap().len(), 32);
    }
}
