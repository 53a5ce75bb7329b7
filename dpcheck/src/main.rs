#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use dpcheck_verify::{BoundsProver, Certificate, Prover, SearchProfile, Verdict};
use miette::{IntoDiagnostic, NamedSource, miette};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod settings;
mod suite;

use settings::{FileConfig, Overrides, Settings, SolverKind};
use suite::{FileOutcome, display_path};

#[derive(Parser, Debug)]
#[command(name = "dpcheck", version, about = "Alignment-based differential privacy checker")]
struct Cli {
    /// More log output (repeatable). `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ProfileArg {
    Fast,
    Ci,
    Thorough,
}

impl From<ProfileArg> for SearchProfile {
    fn from(v: ProfileArg) -> Self {
        match v {
            ProfileArg::Fast => SearchProfile::Fast,
            ProfileArg::Ci => SearchProfile::Ci,
            ProfileArg::Thorough => SearchProfile::Thorough,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Search for an alignment proof of each program
    Verify {
        /// Program files or directories of `.c` files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print verdicts as JSON
        #[arg(long)]
        json: bool,

        /// Search profile: `fast`, `ci`, or `thorough`
        #[arg(long, value_enum)]
        profile: Option<ProfileArg>,

        /// Side-condition prover
        #[arg(long, value_enum)]
        solver: Option<SolverKind>,

        /// Config file (default: nearest `dpcheck.toml`)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Worker threads (default: one per core)
        #[arg(long, short)]
        jobs: Option<usize>,

        /// Compare each verdict with the file's `// EXPECT:` header
        #[arg(long)]
        expect: bool,

        #[arg(long)]
        max_derivations: Option<usize>,

        #[arg(long)]
        time_budget_ms: Option<u64>,
    },
    /// Re-check a certificate saved from an earlier `--json` run
    Replay {
        path: PathBuf,
        certificate: PathBuf,

        #[arg(long, value_enum)]
        solver: Option<SolverKind>,
    },
    /// Print the parsed program model
    Parse { path: PathBuf },
    /// Pretty-print a program
    Fmt { path: PathBuf },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.cmd {
        Cmd::Verify {
            paths,
            json,
            profile,
            solver,
            config,
            jobs,
            expect,
            max_derivations,
            time_budget_ms,
        } => {
            let file = load_config(config.as_deref())?;
            let settings = settings::resolve(
                &file,
                &Overrides {
                    profile: profile.map(Into::into),
                    solver,
                    max_derivations,
                    time_budget_ms,
                },
            );
            verify_cmd(&paths, &settings, json, jobs, expect)
        }
        Cmd::Replay {
            path,
            certificate,
            solver,
        } => {
            let file = load_config(None)?;
            let settings = settings::resolve(
                &file,
                &Overrides {
                    solver,
                    ..Overrides::default()
                },
            );
            replay_cmd(&path, &certificate, &settings)
        }
        Cmd::Parse { path } => {
            let (src, source) = read_source(&path)?;
            let program = dpcheck_parse::parse_source(&src).map_err(|e| e.with_source_code(source))?;
            println!("{program:#?}");
            Ok(())
        }
        Cmd::Fmt { path } => {
            let (src, source) = read_source(&path)?;
            let program = dpcheck_parse::parse_source(&src).map_err(|e| e.with_source_code(source))?;
            print!("{}", dpcheck_parse::format_program(&program));
            Ok(())
        }
    }
}

fn load_config(explicit: Option<&Path>) -> miette::Result<FileConfig> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => std::env::current_dir().ok().and_then(|d| settings::discover(&d)),
    };
    match path {
        Some(p) => {
            debug!(config = %p.display(), "loading config");
            Ok(FileConfig::load(&p)?)
        }
        None => Ok(FileConfig::default()),
    }
}

fn read_source(path: &Path) -> miette::Result<(String, NamedSource<String>)> {
    let src = fs::read_to_string(path).into_diagnostic()?;
    let source = NamedSource::new(display_path(path), src.clone());
    Ok((src, source))
}

fn make_prover(kind: SolverKind, grid_points: usize) -> miette::Result<Box<dyn Prover>> {
    match kind {
        SolverKind::Builtin => Ok(Box::new(BoundsProver::new(grid_points))),
        #[cfg(feature = "z3")]
        SolverKind::Z3 => Ok(Box::new(dpcheck_verify::Z3Prover::new())),
        #[cfg(not(feature = "z3"))]
        SolverKind::Z3 => Err(miette!("dpcheck was built without the `z3` feature")),
    }
}

fn verify_file(src: &str, source: NamedSource<String>, settings: &Settings) -> miette::Result<Verdict> {
    let (program, symbols) =
        dpcheck_parse::parse_and_validate(src).map_err(|e| e.with_source_code(source.clone()))?;
    let mut prover = make_prover(settings.solver, settings.verify.grid_points)?;
    dpcheck_verify::verify_with(&program, &symbols, &settings.verify, prover.as_mut())
        .map_err(|e| miette::Report::new(e).with_source_code(source))
}

fn check_one(path: &Path, settings: &Settings) -> FileOutcome {
    let (verdict, expected) = match read_source(path) {
        Ok((src, source)) => (verify_file(&src, source, settings), suite::expectation(&src)),
        Err(e) => (Err(e), None),
    };
    FileOutcome {
        path: path.to_path_buf(),
        expected,
        verdict,
    }
}

fn verify_cmd(paths: &[PathBuf], settings: &Settings, json: bool, jobs: Option<usize>, expect: bool) -> miette::Result<()> {
    let files = suite::expand_paths(paths)?;
    if files.is_empty() {
        return Err(miette!("no `.c` programs found"));
    }
    info!(programs = files.len(), solver = ?settings.solver, "verifying");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.unwrap_or(0))
        .build()
        .into_diagnostic()?;
    let outcomes: Vec<FileOutcome> = pool.install(|| files.par_iter().map(|p| check_one(p, settings)).collect());

    if json {
        println!("{}", suite::to_json(&outcomes)?);
    }
    let mut failed = 0;
    for o in &outcomes {
        let passed = o.passed(expect);
        if !passed {
            failed += 1;
        }
        match &o.verdict {
            Ok(v) if !json => {
                let tag = match (expect, o.expected) {
                    (true, Some(e)) if !passed => format!(" [expected {e}]"),
                    (true, None) => " [no EXPECT header]".to_string(),
                    _ => String::new(),
                };
                println!("{}: {v}{tag}", display_path(&o.path));
            }
            Ok(_) => {}
            Err(e) => eprintln!("{e:?}"),
        }
        if expect && o.expected.is_none() {
            warn!(path = %display_path(&o.path), "no EXPECT header");
        }
    }

    if failed > 0 {
        let what = if expect { "did not meet their expectation" } else { "were not proved" };
        return Err(miette!("{failed} of {} programs {what}", outcomes.len()));
    }
    Ok(())
}

fn replay_cmd(path: &Path, certificate: &Path, settings: &Settings) -> miette::Result<()> {
    let raw = fs::read_to_string(certificate).into_diagnostic()?;
    // Accepts the `--json` report of a single file, a bare verdict, or a bare certificate.
    let value = match serde_json::from_str::<serde_json::Value>(&raw).into_diagnostic()? {
        serde_json::Value::Array(mut entries) if entries.len() == 1 => entries.remove(0),
        other => other,
    };
    let value = value.get("verdict").unwrap_or(&value);
    let value = value.get("certificate").unwrap_or(value);
    let certificate: Certificate = serde_json::from_value(value.clone())
        .map_err(|e| miette!("{} does not hold a certificate: {e}", certificate.display()))?;
    let (src, source) = read_source(path)?;
    let (program, symbols) =
        dpcheck_parse::parse_and_validate(&src).map_err(|e| e.with_source_code(source.clone()))?;
    let mut prover = make_prover(settings.solver, settings.verify.grid_points)?;
    let verdict = dpcheck_verify::replay(&program, &symbols, &certificate, &settings.verify, prover.as_mut())
        .map_err(|e| miette::Report::new(e).with_source_code(source))?;
    println!("{}: {verdict}", display_path(path));
    if verdict.is_proved() {
        Ok(())
    } else {
        Err(miette!("certificate does not prove {}", verdict.program))
    }
}
