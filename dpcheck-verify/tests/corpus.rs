use std::fs;
use std::path::PathBuf;

use dpcheck_verify::{VerdictKind, VerifyConfig, verify_program};

fn corpus_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../corpus")
}

fn expectation(src: &str) -> Option<VerdictKind> {
    let line = src.lines().next()?.trim();
    match line.strip_prefix("// EXPECT:")?.trim() {
        "Proved" => Some(VerdictKind::Proved),
        "Refuted" => Some(VerdictKind::Refuted),
        "Unknown" => Some(VerdictKind::Unknown),
        _ => None,
    }
}

#[test]
fn corpus_matches_expectations() {
    let mut entries: Vec<PathBuf> = fs::read_dir(corpus_dir())
        .expect("corpus directory")
        .map(|e| e.expect("dir entry").path())
        .filter(|p| p.extension().is_some_and(|x| x == "c"))
        .collect();
    entries.sort();
    assert!(entries.len() >= 10, "corpus is incomplete: {entries:?}");

    let config = VerifyConfig::default();
    let mut mismatches = Vec::new();
    for path in &entries {
        let src = fs::read_to_string(path).expect("read corpus file");
        let expected = expectation(&src).unwrap_or_else(|| panic!("{} has no EXPECT header", path.display()));
        let (program, symbols) = dpcheck_parse::parse_and_validate(&src)
            .unwrap_or_else(|e| panic!("{} does not parse: {e:?}", path.display()));
        let verdict = verify_program(&program, &symbols, &config).expect("verification runs");

        // `Unknown` only promises that no proof is found.
        let ok = match expected {
            VerdictKind::Unknown => verdict.result != VerdictKind::Proved,
            other => verdict.result == other,
        };
        if !ok {
            mismatches.push(format!("{}: expected {expected}, got {verdict}", path.display()));
        }
    }
    assert!(mismatches.is_empty(), "{}", mismatches.join("\n"));
}

#[test]
fn proved_costs_match_the_claimed_budget() {
    let config = VerifyConfig::default();
    for name in ["noisymax", "partialsum"] {
        let src = fs::read_to_string(corpus_dir().join(format!("{name}.c"))).expect("read corpus file");
        let (program, symbols) = dpcheck_parse::parse_and_validate(&src).expect("parses");
        let verdict = verify_program(&program, &symbols, &config).expect("verification runs");
        assert!(verdict.is_proved(), "{verdict}");
        assert_eq!(verdict.cost_expr.as_deref(), Some(verdict.budget_expr.as_str()), "{name}");
        assert_eq!(verdict.rule_names().last(), Some(&"budget-check"));
    }
}
