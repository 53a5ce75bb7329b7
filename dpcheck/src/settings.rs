use std::fs;
use std::path::{Path, PathBuf};

use dpcheck_verify::{SearchProfile, VerifyConfig};
use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_FILE: &str = "dpcheck.toml";

#[derive(Debug, Error, Diagnostic)]
#[error("config error: {message}")]
#[diagnostic(code(dpcheck::config))]
pub struct ConfigError {
    pub message: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// Interval bounds and grid search, no external solver
    #[default]
    Builtin,
    /// Z3 over the reals (needs the `z3` feature)
    Z3,
}

/// `[search]` in `dpcheck.toml`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchSection {
    pub profile: Option<SearchProfile>,
    pub max_derivations: Option<usize>,
    pub max_depth: Option<usize>,
    pub time_budget_ms: Option<u64>,
    pub structural_rounds: Option<usize>,
    pub hull_rounds: Option<usize>,
    pub shifts: Option<Vec<i64>>,
    pub max_paths: Option<usize>,
}

/// `[solver]` in `dpcheck.toml`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolverSection {
    pub backend: Option<SolverKind>,
    pub timeout_ms: Option<u64>,
    pub grid_points: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub solver: SolverSection,
}

impl FileConfig {
    pub fn parse(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError {
            message: format!("failed to parse {}: {e}", origin.display()),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::parse(&raw, path)
    }
}

/// `dpcheck.toml` in `dir` or any of its ancestors.
pub fn discover(dir: &Path) -> Option<PathBuf> {
    dir.ancestors().map(|d| d.join(CONFIG_FILE)).find(|p| p.is_file())
}

/// Flags that override both the profile and the config file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub profile: Option<SearchProfile>,
    pub solver: Option<SolverKind>,
    pub max_derivations: Option<usize>,
    pub time_budget_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub verify: VerifyConfig,
    pub solver: SolverKind,
}

/// Profile first, then the config file, then the command line.
pub fn resolve(file: &FileConfig, cli: &Overrides) -> Settings {
    let profile = cli.profile.or(file.search.profile).unwrap_or(SearchProfile::Ci);
    let mut verify = profile.config();

    let s = &file.search;
    if let Some(v) = s.max_derivations {
        verify.max_derivations = v;
    }
    if let Some(v) = s.max_depth {
        verify.max_depth = v;
    }
    if let Some(v) = s.time_budget_ms {
        verify.time_budget_ms = v;
    }
    if let Some(v) = s.structural_rounds {
        verify.structural_rounds = v;
    }
    if let Some(v) = s.hull_rounds {
        verify.hull_rounds = v;
    }
    if let Some(v) = &s.shifts {
        verify.shifts = v.clone();
    }
    if let Some(v) = s.max_paths {
        verify.max_paths = v;
    }
    if let Some(v) = file.solver.timeout_ms {
        verify.solver_timeout_ms = v;
    }
    if let Some(v) = file.solver.grid_points {
        verify.grid_points = v;
    }

    if let Some(v) = cli.max_derivations {
        verify.max_derivations = v;
    }
    if let Some(v) = cli.time_budget_ms {
        verify.time_budget_ms = v;
    }
    let solver = cli.solver.or(file.solver.backend).unwrap_or_default();
    Settings { verify, solver }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_the_profile() {
        let raw = r#"
[search]
profile = "fast"
max_depth = 12
shifts = [1, -1]

[solver]
timeout_ms = 250
"#;
        let file = FileConfig::parse(raw, Path::new("dpcheck.toml")).unwrap();
        let s = resolve(&file, &Overrides::default());
        assert_eq!(s.verify.max_derivations, SearchProfile::Fast.config().max_derivations);
        assert_eq!(s.verify.max_depth, 12);
        assert_eq!(s.verify.shifts, vec![1, -1]);
        assert_eq!(s.verify.solver_timeout_ms, 250);
        assert_eq!(s.solver, SolverKind::Builtin);
    }

    #[test]
    fn command_line_wins() {
        let file = FileConfig::parse("[search]\nmax_derivations = 10\n", Path::new("x")).unwrap();
        let cli = Overrides {
            profile: Some(SearchProfile::Thorough),
            solver: Some(SolverKind::Z3),
            max_derivations: Some(3),
            time_budget_ms: None,
        };
        let s = resolve(&file, &cli);
        assert_eq!(s.verify.max_derivations, 3);
        assert_eq!(s.verify.time_budget_ms, SearchProfile::Thorough.config().time_budget_ms);
        assert_eq!(s.solver, SolverKind::Z3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = FileConfig::parse("[search]\nmax_dept = 3\n", Path::new("dpcheck.toml")).unwrap_err();
        assert!(err.message.contains("dpcheck.toml"));
    }
}
