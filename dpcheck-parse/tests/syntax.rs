use dpcheck_ast::{Adjacency, BinOp, ExprKind, Rhs, Stmt, TagBound, UnaryOp, VarKind};
use dpcheck_parse::{format_expr, format_program, parse_and_validate, parse_expr, parse_source};

const SPARSE: &str = r#"
int svt (float q[], int size, float epsilon, int N, float T)
{
  "TYPES: epsilon: <0, 0>; size: <0, 0>; q: <*, *>; N: <0, 0>; T: <0, 0>;";
  "PRECONDITION: ALL_DIFFER; ASSUME(N > 0); ASSUME(N < size);";
  "CHECK: epsilon";
  int count = 0, i = 0;
  float eta_1 = Lap(2 / epsilon);
  float T_bar = T + eta_1;

  while (count < N && i < size)
  {
    float eta_2 = Lap(4 * N / epsilon);
    if (q[i] + eta_2 >= T_bar)
    {
      CHECKDP_OUTPUT(1);
      count = count + 1;
    }
    else
      CHECKDP_OUTPUT(0);
    i = i + 1;
  }
}
"#;

fn wrap(body: &str) -> String {
    format!(
        "int f (float q[], int size, float epsilon)\n{{\n  \"TYPES: epsilon: <0, 0>; size: <0, 0>; q: <*, *>;\";\n  \"PRECONDITION: ALL_DIFFER;\";\n  \"CHECK: epsilon\";\n{body}\n}}\n"
    )
}

fn parse_err(src: &str) -> String {
    match parse_and_validate(src) {
        Ok(_) => panic!("expected an error for:\n{src}"),
        Err(e) => e.to_string(),
    }
}

#[test]
fn parses_signature_and_annotations() {
    let program = parse_source(SPARSE).unwrap();
    assert_eq!(program.name.node, "svt");
    assert_eq!(program.params.len(), 5);
    assert!(program.params[0].array);
    assert_eq!(program.query_param().unwrap().name.node, "q");
    assert_eq!(program.length_param().unwrap().name.node, "size");

    let a = &program.annotations;
    assert_eq!(a.types.len(), 5);
    let q = a.type_of("q").unwrap();
    assert_eq!((q.lo, q.hi), (TagBound::Star, TagBound::Star));
    assert!(a.type_of("N").unwrap().is_fixed());
    assert_eq!(program.adjacency(), Adjacency::AllDiffer);
    assert_eq!(a.precondition.assumptions.len(), 2);
    assert_eq!(format_expr(&a.check), "epsilon");
}

#[test]
fn multi_declarations_split_and_laplace_draws_are_recognised() {
    let program = parse_source(SPARSE).unwrap();
    let stmts = &program.body.stmts;
    let names: Vec<&str> = stmts
        .iter()
        .filter_map(|s| match s {
            Stmt::Decl(d) => Some(d.name.node.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["count", "i", "eta_1", "T_bar"]);
    match &stmts[2] {
        Stmt::Decl(d) => match &d.init {
            Some(Rhs::Laplace(draw)) => assert_eq!(format_expr(&draw.scale), "2 / epsilon"),
            other => panic!("expected a Laplace draw, got {other:?}"),
        },
        other => panic!("expected a declaration, got {other:?}"),
    }
}

#[test]
fn unbraced_else_becomes_a_one_statement_block() {
    let program = parse_source(SPARSE).unwrap();
    let Some(Stmt::While(w)) = program.body.stmts.last() else {
        panic!("expected the loop last");
    };
    let Stmt::If(branch) = &w.body.stmts[1] else {
        panic!("expected an if inside the loop");
    };
    assert_eq!(branch.then_block.stmts.len(), 2);
    let else_block = branch.else_block.as_ref().unwrap();
    assert_eq!(else_block.stmts.len(), 1);
    assert!(matches!(else_block.stmts[0], Stmt::Output(_)));
}

#[test]
fn expression_precedence() {
    let e = parse_expr("a + b * c >= d || !x && y").unwrap();
    let ExprKind::Binary { left, op, right } = &e.kind else {
        panic!("expected a binary expression");
    };
    assert_eq!(*op, BinOp::Or);
    assert!(matches!(left.kind, ExprKind::Binary { op: BinOp::Ge, .. }));
    let ExprKind::Binary { left: not_x, op: BinOp::And, .. } = &right.kind else {
        panic!("expected `&&` on the right");
    };
    assert!(matches!(not_x.kind, ExprKind::Unary { op: UnaryOp::Not, .. }));
    assert_eq!(format_expr(&e), "a + b * c >= d || !x && y");
}

#[test]
fn subtraction_is_left_associative() {
    let e = parse_expr("a - b - c").unwrap();
    let ExprKind::Binary { left, op: BinOp::Sub, .. } = &e.kind else {
        panic!("expected subtraction");
    };
    assert!(matches!(left.kind, ExprKind::Binary { op: BinOp::Sub, .. }));
    assert_eq!(format_expr(&parse_expr("a - (b - c)").unwrap()), "a - (b - c)");
}

#[test]
fn chained_comparisons_are_rejected() {
    let err = parse_expr("a < b < c").unwrap_err().to_string();
    assert!(err.contains("chained comparisons"), "{err}");
}

#[test]
fn formatting_is_stable() {
    let once = format_program(&parse_source(SPARSE).unwrap());
    let twice = format_program(&parse_source(&once).unwrap());
    assert_eq!(once, twice);
}

#[test]
fn validation_classifies_variables() {
    let (_, symbols) = parse_and_validate(SPARSE).unwrap();
    assert!(symbols.is_param("epsilon"));
    assert!(symbols.is_noise("eta_1"));
    assert!(symbols.is_noise("eta_2"));
    assert_eq!(symbols.get("count").unwrap().kind, VarKind::Local);
    assert_eq!(symbols.params().count(), 5);
}

#[test]
fn missing_check_annotation_is_reported() {
    let src = "int f (float q[], int size, float epsilon)\n{\n  \"TYPES: epsilon: <0, 0>; size: <0, 0>; q: <*, *>;\";\n  \"PRECONDITION: ALL_DIFFER;\";\n  CHECKDP_OUTPUT(0);\n}\n";
    let err = parse_err(src);
    assert!(err.contains("CHECK"), "{err}");
}

#[test]
fn unknown_adjacency_is_reported() {
    let src = SPARSE.replace("ALL_DIFFER", "SOME_DIFFER");
    assert!(parse_err(&src).contains("unknown adjacency"));
}

#[test]
fn unsupported_statements_are_rejected() {
    assert!(parse_err(&wrap("  return 0;")).contains("`return` is not supported"));
    assert!(parse_err(&wrap("  printf(1);")).contains("unknown function"));
    assert!(parse_err(&wrap("  q[0] = 1;")).contains("array elements cannot be assigned"));
}

#[test]
fn model_checks_run_after_parsing() {
    assert!(parse_err(&wrap("  y = 1;")).contains("undeclared variable `y`"));
    assert!(parse_err(&wrap("  epsilon = 1;")).contains("parameter `epsilon` cannot be assigned"));
    assert!(parse_err(&wrap("  break;")).contains("`break` outside of a loop"));
}
