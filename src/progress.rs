//! Index progress reporting.
//!
//! The pipeline reports a four-stage contract — scanning → embedding →
//! updating → complete — with a detail string and file counters on every
//! call. Progress is emitted on **stderr** so stdout stays parseable.

use std::io::Write;

/// Stage of the indexing pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressStage {
    Scanning,
    Embedding,
    Updating,
    Complete,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStage::Scanning => "scanning",
            ProgressStage::Embedding => "embedding",
            ProgressStage::Updating => "updating",
            ProgressStage::Complete => "complete",
        }
    }
}

/// Receives progress callbacks from the pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, stage: ProgressStage, detail: &str, file_index: usize, total_files: usize);
}

/// Human-friendly progress on stderr: `index  embedding  3/12  apis/order.xml`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, stage: ProgressStage, detail: &str, file_index: usize, total_files: usize) {
        let line = format!(
            "index  {}  {}/{}  {}\n",
            stage.as_str(),
            file_index,
            total_files,
            detail
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, stage: ProgressStage, detail: &str, file_index: usize, total_files: usize) {
        let obj = serde_json::json!({
            "event": "progress",
            "stage": stage.as_str(),
            "detail": detail,
            "file_index": file_index,
            "total_files": total_files,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _stage: ProgressStage, _detail: &str, _file_index: usize, _total_files: usize) {
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_follow_the_contract() {
        assert_eq!(ProgressStage::Scanning.as_str(), "scanning");
        assert_eq!(ProgressStage::Embedding.as_str(), "embedding");
        assert_eq!(ProgressStage::Updating.as_str(), "updating");
        assert_eq!(ProgressStage::Complete.as_str(), "complete");
    }
}
