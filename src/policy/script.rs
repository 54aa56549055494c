//! Static script screening.
//!
//! A hygiene layer, not a security boundary: case-insensitive substring
//! matching against per-kind blocked-pattern tables, run before any
//! workspace is built. The real boundary is the sandbox (no network,
//! capped resources, read-only data mount).

use crate::job::ScriptKind;
use serde::{Deserialize, Serialize};

/// Scripts beyond these thresholds are bumped to at least medium risk.
const LARGE_SCRIPT_BYTES: usize = 50_000;
const LARGE_SCRIPT_LINES: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

/// Outcome of screening one script. The engine never modifies scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptReport {
    pub safe: bool,
    pub warnings: Vec<String>,
    pub blocked_patterns: Vec<String>,
    pub risk: Risk,
}

fn blocked_patterns(kind: ScriptKind) -> &'static [&'static str] {
    match kind {
        ScriptKind::Python | ScriptKind::Jupyter => &[
            "__import__",
            "importlib",
            "exec(",
            "eval(",
            "compile(",
            "subprocess",
            "os.system",
            "os.popen",
            "os.spawn",
            "shutil.rmtree",
            "socket",
            "urllib",
            "requests",
            "pickle",
            "marshal",
            "ctypes",
            "sys.exit",
        ],
        ScriptKind::R => &[
            "system(",
            "shell(",
            "file(",
            "url(",
            "download",
            "install.packages",
            "source(",
            "quit(",
        ],
        ScriptKind::Sql => &[
            "drop ",
            "delete ",
            "update ",
            "insert ",
            "create ",
            "alter ",
            "truncate ",
            "exec ",
            "xp_",
            "sp_",
            "information_schema",
            "pg_catalog",
            "sqlite_master",
        ],
    }
}

/// Subset whose presence alone makes the script unsafe.
fn high_danger_patterns(kind: ScriptKind) -> &'static [&'static str] {
    match kind {
        ScriptKind::Python | ScriptKind::Jupyter => &[
            "exec(",
            "eval(",
            "compile(",
            "os.system",
            "subprocess",
            "__import__",
            "importlib",
        ],
        ScriptKind::R => &["system(", "shell(", "download", "install.packages"],
        ScriptKind::Sql => &[
            "drop ",
            "delete ",
            "update ",
            "insert ",
            "alter ",
            "truncate ",
            "information_schema",
        ],
    }
}

/// Screen a script before execution.
pub fn validate_script(script: &str, kind: ScriptKind) -> ScriptReport {
    let haystack = script.to_lowercase();

    let mut blocked = Vec::new();
    let mut warnings = Vec::new();
    for pattern in blocked_patterns(kind) {
        if haystack.contains(pattern) {
            blocked.push((*pattern).to_string());
            warnings.push(format!("potentially dangerous pattern detected: {pattern}"));
        }
    }

    let unsafe_hit = high_danger_patterns(kind)
        .iter()
        .any(|p| blocked.iter().any(|b| b == p));

    let mut risk = if unsafe_hit {
        Risk::High
    } else if blocked.len() > 3 {
        Risk::Medium
    } else {
        Risk::Low
    };

    if script.len() > LARGE_SCRIPT_BYTES {
        warnings.push("script is very large".to_string());
        risk = risk.max(Risk::Medium);
    }
    if script.lines().count() > LARGE_SCRIPT_LINES {
        warnings.push("script has many lines".to_string());
        risk = risk.max(Risk::Medium);
    }

    ScriptReport {
        safe: !unsafe_hit,
        warnings,
        blocked_patterns: blocked,
        risk,
    }
}
