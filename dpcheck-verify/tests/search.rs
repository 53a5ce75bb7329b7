use dpcheck_verify::{
    BoundsProver, FailureReason, Rule, SearchProfile, VerdictKind, VerifyConfig, replay, verify_program, verify_source,
};

const NOISY_MAX: &str = r#"
int noisymax(float q[], int size, float epsilon)
{
  "TYPES: epsilon: <0, 0>; size: <0, 0>; q: <*, *>;";
  "PRECONDITION: ALL_DIFFER;";
  "CHECK: BUDGET";
  int max = 0;
  int i = 0;
  float bq = 0;
  while (i < size)
  {
    float eta = Lap(2 / epsilon);
    if (q[i] + eta > bq || i == 0)
    {
      max = i;
      bq = q[i] + eta;
    }
    i = i + 1;
  }
  CHECKDP_OUTPUT(max);
}
"#;

fn noisy_max(budget: &str) -> String {
    NOISY_MAX.replace("BUDGET", budget)
}

#[test]
fn laplace_mechanism_is_proved_by_cancelling_the_output() {
    let src = r#"
int laplace(float q[], int size, float epsilon)
{
  "TYPES: epsilon: <0, 0>; size: <0, 0>; q: <*, *>;";
  "PRECONDITION: ONE_DIFFER;";
  "CHECK: epsilon";
  float eta = Lap(1 / epsilon);
  CHECKDP_OUTPUT(q[0] + eta);
}
"#;
    let verdict = verify_source(src, &VerifyConfig::default()).expect("verifies");
    assert_eq!(verdict.result, VerdictKind::Proved, "{verdict}");
    assert!(verdict.rule_trace.iter().any(|r| r.rule == Rule::Cancel));
}

#[test]
fn an_unnoised_output_of_the_data_is_not_proved() {
    let src = r#"
int leak(float q[], int size, float epsilon)
{
  "TYPES: epsilon: <0, 0>; size: <0, 0>; q: <*, *>;";
  "PRECONDITION: ALL_DIFFER;";
  "CHECK: epsilon";
  CHECKDP_OUTPUT(q[0]);
}
"#;
    let verdict = verify_source(src, &VerifyConfig::default()).expect("verifies");
    assert_ne!(verdict.result, VerdictKind::Proved);
    assert!(matches!(
        verdict.failure_reason,
        Some(FailureReason::MisalignedOutput { .. } | FailureReason::UnresolvedRelation { .. })
    ));
}

#[test]
fn verification_is_deterministic() {
    let src = noisy_max("epsilon");
    let config = VerifyConfig::default();
    let a = verify_source(&src, &config).expect("verifies");
    let b = verify_source(&src, &config).expect("verifies");
    assert_eq!(a.result, b.result);
    assert_eq!(a.cost_expr, b.cost_expr);
    assert_eq!(a.rule_trace, b.rule_trace);
    assert_eq!(a.certificate, b.certificate);
    assert_eq!(a.stats.derivations, b.stats.derivations);
}

#[test]
fn a_larger_budget_stays_proved() {
    let config = VerifyConfig::default();
    let tight = verify_source(&noisy_max("epsilon"), &config).expect("verifies");
    let loose = verify_source(&noisy_max("2 * epsilon"), &config).expect("verifies");
    assert!(tight.is_proved(), "{tight}");
    assert!(loose.is_proved(), "{loose}");
}

#[test]
fn a_smaller_budget_is_refuted() {
    let verdict = verify_source(&noisy_max("epsilon / 2"), &VerifyConfig::default()).expect("verifies");
    assert_ne!(verdict.result, VerdictKind::Proved, "{verdict}");
}

fn one_query(scale_and_body: &str, adjacency: &str, budget: &str) -> String {
    format!(
        r#"
int m(float q[], int size, float epsilon)
{{
  "TYPES: epsilon: <0, 0>; size: <0, 0>; q: <*, *>;";
  "PRECONDITION: {adjacency}; ASSUME(size > 0);";
  "CHECK: {budget}";
{scale_and_body}
}}
"#
    )
}

#[test]
fn mixed_concrete_and_unresolved_failures_stay_unknown() {
    // Cancelling the draw fits every output but costs more than the budget.
    // The computed shift leaves the last output misaligned.
    let body = r#"
  float eta = Lap(1 / epsilon);
  if (q[0] + eta > 0) { CHECKDP_OUTPUT(1); } else { CHECKDP_OUTPUT(0); }
  CHECKDP_OUTPUT(q[0] + eta);"#;
    let verdict = verify_source(&one_query(body, "ONE_DIFFER", "epsilon / 2"), &VerifyConfig::default()).expect("verifies");
    assert!(verdict.stats.derivations > 1, "{verdict}");
    assert_eq!(verdict.result, VerdictKind::Unknown, "{verdict}");
    assert!(verdict.counterexample.is_none());
}

#[test]
fn a_noise_free_threshold_is_refuted_with_a_replay() {
    let body = "  if (q[0] > 0) { CHECKDP_OUTPUT(1); } else { CHECKDP_OUTPUT(0); }";
    let verdict = verify_source(&one_query(body, "ONE_DIFFER", "epsilon"), &VerifyConfig::default()).expect("verifies");
    assert_eq!(verdict.result, VerdictKind::Refuted, "{verdict}");
    assert!(matches!(verdict.failure_reason, Some(FailureReason::DivergentBranch { .. })));
    let cex = verdict.counterexample.expect("refuted verdicts carry a counterexample");
    assert_ne!(cex.replay.outputs_a, cex.replay.outputs_b);
    assert_ne!(cex.replay.query_a, cex.replay.query_b);
}

#[test]
fn a_zero_laplace_scale_is_a_dead_end() {
    let body = "  float eta = Lap(0);\n  CHECKDP_OUTPUT(q[0] + eta);";
    let verdict = verify_source(&one_query(body, "ONE_DIFFER", "epsilon"), &VerifyConfig::default())
        .expect("a bad scale is not a fatal error");
    assert_ne!(verdict.result, VerdictKind::Proved, "{verdict}");
    assert!(
        matches!(verdict.failure_reason, Some(FailureReason::InvalidNoiseScale { .. })),
        "{verdict}"
    );
}

#[test]
fn a_sum_as_laplace_scale_is_unknown() {
    let body = "  float eta = Lap(epsilon + 1);\n  CHECKDP_OUTPUT(q[0] + eta);";
    let verdict = verify_source(&one_query(body, "ONE_DIFFER", "epsilon"), &VerifyConfig::default())
        .expect("a bad scale is not a fatal error");
    assert_eq!(verdict.result, VerdictKind::Unknown, "{verdict}");
    assert!(
        matches!(verdict.failure_reason, Some(FailureReason::InvalidNoiseScale { .. })),
        "{verdict}"
    );
}

#[test]
fn certificates_replay_without_search() {
    let config = VerifyConfig::default();
    let src = noisy_max("epsilon");
    let (program, symbols) = dpcheck_parse::parse_and_validate(&src).expect("parses");
    let verdict = verify_program(&program, &symbols, &config).expect("verifies");
    let certificate = verdict.certificate.clone().expect("proved verdicts carry a certificate");

    let mut prover = BoundsProver::new(config.grid_points);
    let again = replay(&program, &symbols, &certificate, &config, &mut prover).expect("replays");
    assert!(again.is_proved(), "{again}");
    assert_eq!(again.cost_expr, verdict.cost_expr);
    assert_eq!(again.stats.derivations, 1);

    let json = serde_json::to_string(&certificate).expect("serialises");
    let back = serde_json::from_str(&json).expect("deserialises");
    assert_eq!(certificate, back);
}

#[test]
fn a_tiny_search_is_reported_as_exhausted() {
    let config = VerifyConfig {
        max_derivations: 1,
        ..SearchProfile::Fast.config()
    };
    let verdict = verify_source(&noisy_max("epsilon"), &config).expect("verifies");
    if !verdict.is_proved() {
        assert_eq!(verdict.result, VerdictKind::Unknown);
        assert!(verdict.stats.truncated);
    }
}

#[test]
fn malformed_programs_are_rejected_before_search() {
    let src = r#"
int bad(float q[], int size, float epsilon)
{
  "TYPES: epsilon: <0, 0>; size: <0, 0>; q: <*, *>;";
  "PRECONDITION: ALL_DIFFER;";
  "CHECK: epsilon";
  CHECKDP_OUTPUT(undeclared);
}
"#;
    assert!(verify_source(src, &VerifyConfig::default()).is_err());
}
