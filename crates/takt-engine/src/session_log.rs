use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use takt_types::MatchMethod;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Execute,
    Report,
    Judge,
}

/// One line of `<runDir>/logs/<sessionId>.jsonl`. Field names are camelCase to match the wire
/// shape consumers expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionRecord {
    PieceStart {
        task: String,
        #[serde(rename = "pieceName")]
        piece_name: String,
        #[serde(rename = "startTime")]
        start_time: DateTime<Utc>,
    },
    MovementStart {
        movement: String,
        persona: String,
        iteration: u32,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instruction: Option<String>,
    },
    PhaseStart {
        movement: String,
        phase: u8,
        #[serde(rename = "phaseName")]
        phase_name: PhaseName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instruction: Option<String>,
        timestamp: DateTime<Utc>,
    },
    PhaseComplete {
        movement: String,
        phase: u8,
        #[serde(rename = "phaseName")]
        phase_name: PhaseName,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    MovementComplete {
        movement: String,
        persona: String,
        status: String,
        content: String,
        instruction: String,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "matchedRuleIndex")]
        matched_rule_index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "matchedRuleMethod")]
        matched_rule_method: Option<MatchMethod>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    PieceComplete {
        iterations: u32,
        #[serde(rename = "endTime")]
        end_time: DateTime<Utc>,
    },
    PieceAbort {
        iterations: u32,
        reason: String,
        #[serde(rename = "endTime")]
        end_time: DateTime<Utc>,
    },
}

/// Derived pointer snapshot written atomically to `logs/latest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointerSnapshot {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "logFile")]
    pub log_file: String,
    pub task: String,
    #[serde(rename = "pieceName")]
    pub piece_name: String,
    pub status: String,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    pub iterations: u32,
}

/// Write-only, append-only NDJSON log plus atomically-updated `latest.json`/`previous.json`
/// pointers. Grounded on `OrchestratorStore`'s split between `append_event` (plain
/// `OpenOptions::append`) and `atomic_write` (write-to-`.tmp`-then-`rename`) for snapshots.
pub struct SessionLog {
    logs_dir: PathBuf,
    session_id: String,
    file: File,
    copied_previous_this_run: bool,
}

impl SessionLog {
    pub fn open(run_dir: &Path, session_id: impl Into<String>) -> std::io::Result<Self> {
        let session_id = session_id.into();
        let logs_dir = run_dir.join("logs");
        fs::create_dir_all(&logs_dir)?;
        let log_path = logs_dir.join(format!("{session_id}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(log_path)?;
        Ok(Self {
            logs_dir,
            session_id,
            file,
            copied_previous_this_run: false,
        })
    }

    pub fn log_file_name(&self) -> String {
        format!("{}.jsonl", self.session_id)
    }

    /// Appends one record. Failures here are non-fatal: the caller logs a warning and continues
    /// the run rather than propagating.
    pub fn append(&mut self, record: &SessionRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()
    }

    /// Called once per run, before the first `piece_start` record: if a prior run's
    /// `latest.json` exists, copy it to `previous.json`. Subsequent pointer updates within the
    /// same run never copy again.
    pub fn snapshot_previous_pointer_if_needed(&mut self) -> std::io::Result<()> {
        if self.copied_previous_this_run {
            return Ok(());
        }
        self.copied_previous_this_run = true;
        let latest = self.logs_dir.join("latest.json");
        if latest.exists() {
            fs::copy(&latest, self.logs_dir.join("previous.json"))?;
        }
        Ok(())
    }

    pub fn write_pointer(&self, snapshot: &PointerSnapshot) -> std::io::Result<()> {
        let path = self.logs_dir.join("latest.json");
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &path)
    }
}

/// Reconstruction of `movementOutputs`-equivalent history from a completed NDJSON log. Only
/// `movement_complete` records are kept; a terminal record sets `status`/`end_time`.
#[derive(Debug, Clone, Default)]
pub struct PieceLogHistory {
    pub task: Option<String>,
    pub piece_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub movement_completions: Vec<(String, SessionRecord)>,
    pub status: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub iterations: Option<u32>,
}

impl PieceLogHistory {
    pub fn is_empty(&self) -> bool {
        self.task.is_none() && self.movement_completions.is_empty()
    }
}

pub fn load_ndjson_log(path: &Path) -> std::io::Result<PieceLogHistory> {
    let mut history = PieceLogHistory::default();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(history),
        Err(err) => return Err(err),
    };

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SessionRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(_) => continue,
        };
        match &record {
            SessionRecord::PieceStart { task, piece_name, start_time } => {
                history.task = Some(task.clone());
                history.piece_name = Some(piece_name.clone());
                history.start_time = Some(*start_time);
            }
            SessionRecord::MovementComplete { movement, .. } => {
                if let Some(entry) = history
                    .movement_completions
                    .iter_mut()
                    .find(|(name, _)| name == movement)
                {
                    entry.1 = record.clone();
                } else {
                    history.movement_completions.push((movement.clone(), record.clone()));
                }
            }
            SessionRecord::PieceComplete { iterations, end_time } => {
                history.status = Some("completed".to_string());
                history.end_time = Some(*end_time);
                history.iterations = Some(*iterations);
            }
            SessionRecord::PieceAbort { iterations, reason, end_time } => {
                history.status = Some("aborted".to_string());
                history.reason = Some(reason.clone());
                history.end_time = Some(*end_time);
                history.iterations = Some(*iterations);
            }
            _ => {}
        }
    }

    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_reload_reconstructs_movement_history_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SessionLog::open(dir.path(), "sess-1").unwrap();
        log.append(&SessionRecord::PieceStart {
            task: "do the thing".to_string(),
            piece_name: "default".to_string(),
            start_time: Utc::now(),
        })
        .unwrap();
        log.append(&SessionRecord::MovementComplete {
            movement: "plan".to_string(),
            persona: "plan".to_string(),
            status: "done".to_string(),
            content: "[PLAN:1] Clear".to_string(),
            instruction: "inst".to_string(),
            matched_rule_index: Some(0),
            matched_rule_method: Some(MatchMethod::Phase1Tag),
            error: None,
            timestamp: Utc::now(),
        })
        .unwrap();
        log.append(&SessionRecord::PieceComplete {
            iterations: 1,
            end_time: Utc::now(),
        })
        .unwrap();

        let log_path = dir.path().join("logs").join("sess-1.jsonl");
        let history = load_ndjson_log(&log_path).unwrap();
        assert_eq!(history.task.as_deref(), Some("do the thing"));
        assert_eq!(history.movement_completions.len(), 1);
        assert_eq!(history.movement_completions[0].0, "plan");
        assert_eq!(history.status.as_deref(), Some("completed"));
    }

    #[test]
    fn missing_log_file_returns_empty_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let history = load_ndjson_log(&dir.path().join("logs").join("missing.jsonl")).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn previous_pointer_is_copied_only_once_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SessionLog::open(dir.path(), "sess-1").unwrap();
        let snapshot = PointerSnapshot {
            session_id: "sess-1".to_string(),
            log_file: log.log_file_name(),
            task: "t".to_string(),
            piece_name: "p".to_string(),
            status: "running".to_string(),
            start_time: Utc::now(),
            updated_at: Utc::now(),
            iterations: 0,
        };
        log.write_pointer(&snapshot).unwrap();

        let mut next_run_log = SessionLog::open(dir.path(), "sess-2").unwrap();
        next_run_log.snapshot_previous_pointer_if_needed().unwrap();
        assert!(dir.path().join("logs").join("previous.json").exists());

        next_run_log.snapshot_previous_pointer_if_needed().unwrap();
        let previous_modified = fs::metadata(dir.path().join("logs").join("previous.json"))
            .unwrap()
            .modified()
            .unwrap();
        // second call is a no-op; the file should not have been rewritten to a new timestamp
        // that predates the first copy (smoke check rather than exact equality across platforms)
        assert!(previous_modified <= std::time::SystemTime::now());
    }
}
