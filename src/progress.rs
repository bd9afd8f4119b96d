//! Stage progress reporting.
//!
//! Reports observable progress while the pipeline runs so users can see which
//! stage is working and how much of its batch backlog is left. Progress is
//! emitted on **stderr** so the run report on stdout stays parseable.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum StageProgressEvent {
    /// The stage is loading and hashing its candidate units.
    Scanning { stage: String },
    /// `n` of `total` new units have been committed.
    Processing { stage: String, n: u64, total: u64 },
    /// A full-recompute stage is aggregating over `units` units.
    Recomputing { stage: String, units: u64 },
}

/// Reports stage progress. Implementations write to stderr (human or JSON).
pub trait StageProgressReporter: Send + Sync {
    fn report(&self, event: StageProgressEvent);
}

/// Human-friendly progress on stderr: "embed  processing  1,200 / 5,000 units".
pub struct StderrProgress;

impl StageProgressReporter for StderrProgress {
    fn report(&self, event: StageProgressEvent) {
        let line = match &event {
            StageProgressEvent::Scanning { stage } => format!("{}  scanning...\n", stage),
            StageProgressEvent::Processing { stage, n, total } => format!(
                "{}  processing  {} / {} units\n",
                stage,
                format_number(*n),
                format_number(*total)
            ),
            StageProgressEvent::Recomputing { stage, units } => {
                format!("{}  recomputing over {} units\n", stage, format_number(*units))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl StageProgressReporter for JsonProgress {
    fn report(&self, event: StageProgressEvent) {
        let obj = match &event {
            StageProgressEvent::Scanning { stage } => serde_json::json!({
                "event": "progress",
                "stage": stage,
                "phase": "scanning"
            }),
            StageProgressEvent::Processing { stage, n, total } => serde_json::json!({
                "event": "progress",
                "stage": stage,
                "phase": "processing",
                "n": n,
                "total": total
            }),
            StageProgressEvent::Recomputing { stage, units } => serde_json::json!({
                "event": "progress",
                "stage": stage,
                "phase": "recomputing",
                "units": units
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl StageProgressReporter for NoProgress {
    fn report(&self, _event: StageProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
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

    pub fn reporter(&self) -> Box<dyn StageProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
