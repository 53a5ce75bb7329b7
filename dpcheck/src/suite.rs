use std::fs;
use std::path::{Path, PathBuf};

use dpcheck_verify::{Verdict, VerdictKind};
use miette::IntoDiagnostic;
use serde::Serialize;

const EXPECT_PREFIX: &str = "// EXPECT:";

/// Files named on the command line, with directories replaced by their
/// `*.c` files in name order.
pub fn expand_paths(paths: &[PathBuf]) -> miette::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for p in paths {
        if p.is_dir() {
            let mut found: Vec<PathBuf> = fs::read_dir(p)
                .into_diagnostic()?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|f| f.is_file() && f.extension().is_some_and(|x| x == "c"))
                .collect();
            found.sort();
            out.extend(found);
        } else {
            out.push(p.clone());
        }
    }
    Ok(out)
}

/// `// EXPECT: Proved` on the first line of a program.
pub fn expectation(src: &str) -> Option<VerdictKind> {
    let rest = src.lines().next()?.trim().strip_prefix(EXPECT_PREFIX)?;
    match rest.trim() {
        "Proved" => Some(VerdictKind::Proved),
        "Refuted" => Some(VerdictKind::Refuted),
        "Unknown" => Some(VerdictKind::Unknown),
        _ => None,
    }
}

/// `Unknown` only promises that no proof is found.
pub fn meets(expected: VerdictKind, actual: VerdictKind) -> bool {
    match expected {
        VerdictKind::Unknown => actual != VerdictKind::Proved,
        other => other == actual,
    }
}

#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub expected: Option<VerdictKind>,
    pub verdict: Result<Verdict, miette::Report>,
}

impl FileOutcome {
    /// Whether this file counts as a success for the exit code.
    pub fn passed(&self, use_expectations: bool) -> bool {
        match (&self.verdict, use_expectations, self.expected) {
            (Ok(v), true, Some(expected)) => meets(expected, v.result),
            (Ok(v), _, _) => v.is_proved(),
            (Err(_), _, _) => false,
        }
    }
}

#[derive(Serialize)]
struct JsonEntry<'a> {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<VerdictKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verdict: Option<&'a Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn to_json(outcomes: &[FileOutcome]) -> miette::Result<String> {
    let entries: Vec<JsonEntry<'_>> = outcomes
        .iter()
        .map(|o| JsonEntry {
            path: display_path(&o.path),
            expected: o.expected,
            verdict: o.verdict.as_ref().ok(),
            error: o.verdict.as_ref().err().map(|e| e.to_string()),
        })
        .collect();
    serde_json::to_string_pretty(&entries).into_diagnostic()
}

pub fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expectation_header_is_read_from_the_first_line() {
        assert_eq!(expectation("// EXPECT: Refuted\nint f()"), Some(VerdictKind::Refuted));
        assert_eq!(expectation("int f()\n// EXPECT: Proved"), None);
        assert_eq!(expectation("// EXPECT: maybe\n"), None);
    }

    #[test]
    fn unknown_expectation_accepts_anything_but_a_proof() {
        assert!(meets(VerdictKind::Unknown, VerdictKind::Refuted));
        assert!(meets(VerdictKind::Unknown, VerdictKind::Unknown));
        assert!(!meets(VerdictKind::Unknown, VerdictKind::Proved));
        assert!(!meets(VerdictKind::Refuted, VerdictKind::Unknown));
    }
}
