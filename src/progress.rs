//! Indexing progress reporting.
//!
//! Reports observable progress during `ragx index` so users see what is
//! being scanned and how much is left. Progress is emitted on **stderr**
//! so stdout remains parseable for scripts.

use std::io::Write;
use std::path::Path;

/// A single progress event for a directory pass.
#[derive(Clone, Debug)]
pub enum IndexProgress<'a> {
    /// Walking the tree. Total unknown.
    Discovering { root: &'a Path },
    /// `completed` of `total` files finished; `path` is the one that just
    /// completed.
    Processing {
        completed: usize,
        total: usize,
        path: &'a Path,
    },
}

/// Receives progress events from the pipeline, in completion order.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &IndexProgress<'_>);
}

/// Human-friendly progress on stderr: "index  1,234 / 5,000  src/lib.rs".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &IndexProgress<'_>) {
        let line = match event {
            IndexProgress::Discovering { root } => {
                format!("index {}  discovering...\n", root.display())
            }
            IndexProgress::Processing {
                completed,
                total,
                path,
            } => format!(
                "index  {} / {}  {}\n",
                format_number(*completed as u64),
                format_number(*total as u64),
                path.display()
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &IndexProgress<'_>) {
        let obj = match event {
            IndexProgress::Discovering { root } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "root": root.display().to_string(),
            }),
            IndexProgress::Processing {
                completed,
                total,
                path,
            } => serde_json::json!({
                "event": "progress",
                "phase": "processing",
                "completed": completed,
                "total": total,
                "path": path.display().to_string(),
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &IndexProgress<'_>) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!("unknown progress mode: {}", other)),
        }
    }
}
