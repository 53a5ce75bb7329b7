use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn corpus() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("dpcheck crate must be in a workspace")
        .join("corpus")
}

fn scratch_dir(tag: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("dpcheck-cli-{tag}-{}-{ts}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn dpcheck(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dpcheck"))
        .args(args)
        .current_dir(cwd)
        .env_remove("RUST_LOG")
        .output()
        .expect("spawn dpcheck")
}

fn arg(p: &Path) -> &str {
    p.to_str().expect("path must be UTF-8")
}

#[test]
fn fmt_prints_the_program_back() {
    let tmp = scratch_dir("fmt");
    let file = corpus().join("noisymax.c");
    let out = dpcheck(&tmp, &["fmt", arg(&file)]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("noisymax("));
    assert!(stdout.contains("\"CHECK: epsilon\""));
    assert!(stdout.contains("CHECKDP_OUTPUT(max)"));
}

#[test]
fn parse_dumps_the_program_model() {
    let tmp = scratch_dir("parse");
    let file = corpus().join("partialsum.c");
    let out = dpcheck(&tmp, &["parse", arg(&file)]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Program"));
}

#[test]
fn parse_errors_point_at_the_file() {
    let tmp = scratch_dir("bad");
    let file = tmp.join("broken.c");
    std::fs::write(&file, "int broken (float q[], int size, float epsilon)\n{\n  int x = ;\n}\n").expect("write program");
    let out = dpcheck(&tmp, &["parse", arg(&file)]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("broken.c"));
}

#[test]
fn verify_json_reports_a_proof_with_certificate() {
    let tmp = scratch_dir("json");
    let file = corpus().join("noisymax.c");
    let out = dpcheck(&tmp, &["verify", "--json", arg(&file)]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).expect("stdout is JSON");
    let entry = &report[0];
    assert_eq!(entry["expected"], "Proved");
    assert_eq!(entry["verdict"]["result"], "Proved");
    assert!(entry["verdict"]["certificate"].is_object());

    let saved = tmp.join("noisymax.json");
    std::fs::write(&saved, &out.stdout).expect("write report");
    let replayed = dpcheck(&tmp, &["replay", arg(&file), arg(&saved)]);
    assert!(replayed.status.success(), "{}", String::from_utf8_lossy(&replayed.stderr));
    assert!(String::from_utf8_lossy(&replayed.stdout).contains("Proved"));
}

#[test]
fn refuted_json_carries_the_replayed_outputs() {
    let tmp = scratch_dir("replayed");
    let file = corpus().join("thresholdleak.c");
    let out = dpcheck(&tmp, &["verify", "--json", "--expect", arg(&file)]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).expect("stdout is JSON");
    let verdict = &report[0]["verdict"];
    assert_eq!(verdict["result"], "Refuted");
    let replay = &verdict["counterexample"]["replay"];
    assert_ne!(replay["outputs_a"], replay["outputs_b"]);
}

#[test]
fn unproved_program_fails_without_expectations() {
    let tmp = scratch_dir("refuted");
    let file = corpus().join("badnoisymax.c");
    let out = dpcheck(&tmp, &["verify", arg(&file)]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("were not proved"));
}

#[test]
fn corpus_meets_its_expectations() {
    let tmp = scratch_dir("suite");
    let dir = corpus();
    let out = dpcheck(&tmp, &["verify", "--expect", "--jobs", "2", arg(&dir)]);
    assert!(
        out.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.lines().count() >= 10);
}

#[test]
fn bad_config_is_reported() {
    let tmp = scratch_dir("config");
    std::fs::write(tmp.join("dpcheck.toml"), "[search]\nmax_dept = 3\n").expect("write config");
    let file = corpus().join("noisymax.c");
    let out = dpcheck(&tmp, &["verify", arg(&file)]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("config error"));
}

#[cfg(not(feature = "z3"))]
#[test]
fn z3_backend_needs_the_feature() {
    let tmp = scratch_dir("z3");
    let file = corpus().join("noisymax.c");
    let out = dpcheck(&tmp, &["verify", "--solver", "z3", arg(&file)]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("z3"));
}
