use std::thread;

use anyhow::anyhow;
use approx::assert_abs_diff_eq;
use nalgebra::DMatrix;

use tandem_core::dispatch::{self, NormKind};
use tandem_core::ops::{BinaryOp, UnaryOp};
use tandem_core::solvers::{NonlinearProblem, NonlinearSolver, SolverOutcome};
use tandem_core::{Declaration, Error, Kind, Phase, Session, SolveOptions, Value};

fn scalar(value: &Value) -> f64 {
    value.to_f64().expect("concrete scalar")
}

/// Declares `x`, pins it to `target` with `x - target`, and returns both.
fn identity_session(target: Value, guess: Vec<f64>) -> (Session, Value) {
    let session = Session::new();
    let x = if target.shape().is_scalar() {
        session.declare_variable(Declaration::scalar("x", guess[0]))
    } else {
        session.declare_variable(Declaration::vector("x", guess))
    }
    .expect("declaration");
    session
        .add_residual(&x.sub(&target).expect("residual"))
        .expect("registration");
    (session, x)
}

fn assert_close(solved: &Value, expected: &Value, label: &str) {
    let solved = solved.to_vec().expect("solved value is concrete");
    let expected = expected.to_vec().expect("expected value is concrete");
    assert_eq!(solved.len(), expected.len(), "{label}");
    for (s, e) in solved.iter().zip(&expected) {
        assert!((s - e).abs() < 1e-6, "{label}: {s} vs {e}");
    }
}

#[test]
fn square_root_of_four_from_zero() {
    let session = Session::new();
    let x = session
        .declare_variable(Declaration::scalar("x", 0.0))
        .unwrap();
    session
        .add_residual(&x.mul(&x).unwrap().sub(4.0).unwrap())
        .unwrap();
    session.solve(&SolveOptions::default()).unwrap();

    // Which root is reached depends on the solver path.
    let root = scalar(&session.value_of(&x).unwrap());
    assert_abs_diff_eq!(root.abs(), 2.0, epsilon = 1e-6);
    assert_eq!(session.phase(), Phase::Solved);
}

#[test]
fn two_by_two_linear_system() {
    let session = Session::new();
    let x = session
        .declare_variable(Declaration::scalar("x", 0.0))
        .unwrap();
    let y = session
        .declare_variable(Declaration::scalar("y", 0.0))
        .unwrap();
    session
        .add_residual(&x.add(&y).unwrap().sub(3.0).unwrap())
        .unwrap();
    session
        .add_residual(&x.sub(&y).unwrap().sub(1.0).unwrap())
        .unwrap();
    let report = session.solve(&SolveOptions::default()).unwrap();

    assert_abs_diff_eq!(scalar(&session.value_of(&x).unwrap()), 2.0, epsilon = 1e-8);
    assert_abs_diff_eq!(scalar(&session.value_of(&y).unwrap()), 1.0, epsilon = 1e-8);
    assert!(report.residual_norm <= 1e-8);

    let results = session.results().unwrap();
    assert_eq!(results.values.len(), 2);
    assert_abs_diff_eq!(scalar(results.get("x").unwrap()), 2.0, epsilon = 1e-8);
}

#[test]
fn no_real_root_raises_convergence_error_and_closes() {
    let session = Session::new();
    let x = session
        .declare_variable(Declaration::scalar("x", 0.0))
        .unwrap();
    session
        .add_residual(&x.mul(&x).unwrap().add(1.0).unwrap())
        .unwrap();
    let err = session
        .solve(&SolveOptions::default().with_max_iterations(5))
        .expect_err("x^2 + 1 has no real root");
    match err {
        Error::Convergence {
            session: id,
            iterations,
            residual_norm,
        } => {
            assert_eq!(id, session.id());
            assert!(iterations <= 5);
            assert!(residual_norm >= 1.0 - 1e-12);
        }
        other => panic!("expected a convergence error, got {other}"),
    }

    assert_eq!(session.phase(), Phase::Closed);
    assert!(matches!(
        session.value_of(&x),
        Err(Error::SessionClosed { .. })
    ));
    assert!(matches!(
        session.declare_variable(Declaration::scalar("y", 0.0)),
        Err(Error::SessionClosed { .. })
    ));
    assert!(matches!(
        session.add_residual(&x),
        Err(Error::SessionClosed { .. })
    ));
    assert_registration_closed(&session, &x);
    assert!(matches!(
        x.add(1.0),
        Err(Error::StaleSymbolicHandle { .. })
    ));
}

/// Every registration entry point and `solve` refuse a closed session.
fn assert_registration_closed(session: &Session, x: &Value) {
    assert!(matches!(
        session.add_residual(x),
        Err(Error::SessionClosed { .. })
    ));
    assert!(matches!(
        session.add_constraint(x, None, Some(1.0)),
        Err(Error::SessionClosed { .. })
    ));
    assert!(matches!(
        session.add_least_squares(x),
        Err(Error::SessionClosed { .. })
    ));
    assert!(matches!(
        session.solve(&SolveOptions::default()),
        Err(Error::SessionClosed { .. })
    ));
}

#[test]
fn lifecycle_on_the_success_path() {
    let session = Session::new();
    let x = session
        .declare_variable(Declaration::scalar("x", 1.0))
        .unwrap();
    let doubled = x.mul(2.0).unwrap();
    session.add_residual(&x.sub(5.0).unwrap()).unwrap();

    assert!(matches!(
        session.value_of(&x),
        Err(Error::NotYetSolved { .. })
    ));
    assert!(matches!(session.results(), Err(Error::NotYetSolved { .. })));

    session.solve(&SolveOptions::default()).unwrap();
    assert_abs_diff_eq!(scalar(&session.value_of(&doubled).unwrap()), 10.0, epsilon = 1e-7);
    assert!(matches!(
        session.solve(&SolveOptions::default()),
        Err(Error::AlreadySolved { .. })
    ));
    assert!(matches!(
        session.add_residual(&x),
        Err(Error::AlreadySolved { .. })
    ));

    session.close();
    assert_eq!(session.phase(), Phase::Closed);
    assert!(matches!(
        session.value_of(&x),
        Err(Error::SessionClosed { .. })
    ));
    assert!(matches!(
        session.declare_variable(Declaration::scalar("z", 0.0)),
        Err(Error::SessionClosed { .. })
    ));
    assert_registration_closed(&session, &x);
    assert!(matches!(
        x.sin(),
        Err(Error::StaleSymbolicHandle { .. })
    ));
}

#[test]
fn invalid_options_leave_the_session_building() {
    let session = Session::new();
    let x = session
        .declare_variable(Declaration::scalar("x", 0.0))
        .unwrap();
    session.add_residual(&x).unwrap();
    assert!(matches!(
        session.solve(&SolveOptions::default().with_tolerance(0.0)),
        Err(Error::InvalidOptions(_))
    ));
    assert_eq!(session.phase(), Phase::Building);
    session.solve(&SolveOptions::default()).unwrap();
}

#[test]
fn every_symbolic_unary_operation_matches_concrete_evaluation() {
    let target = 0.4;
    for op in UnaryOp::ALL {
        let (session, x) = identity_session(Value::scalar(target), vec![0.9]);
        let symbolic = dispatch::unary(op, &x);
        if !op.symbolic_support() {
            assert!(
                matches!(symbolic, Err(Error::UnsupportedOperation { .. })),
                "{}",
                op.name()
            );
            continue;
        }
        let symbolic = symbolic.unwrap();
        session.solve(&SolveOptions::default()).unwrap();
        let expected = dispatch::unary(op, &Value::scalar(target)).unwrap();
        assert_close(&session.value_of(&symbolic).unwrap(), &expected, op.name());
    }
}

#[test]
fn every_symbolic_binary_operation_matches_concrete_evaluation() {
    let (target, other) = (1.3, 0.7);
    for op in BinaryOp::ALL.into_iter().filter(|op| op.symbolic_support()) {
        let (session, x) = identity_session(Value::scalar(target), vec![0.9]);
        let left = dispatch::binary(op, &x, &Value::scalar(other)).unwrap();
        let right = dispatch::binary(op, &Value::scalar(other), &x).unwrap();
        session.solve(&SolveOptions::default()).unwrap();

        let t = Value::scalar(target);
        let o = Value::scalar(other);
        assert_close(
            &session.value_of(&left).unwrap(),
            &dispatch::binary(op, &t, &o).unwrap(),
            op.name(),
        );
        assert_close(
            &session.value_of(&right).unwrap(),
            &dispatch::binary(op, &o, &t).unwrap(),
            op.name(),
        );
    }
}

#[test]
fn array_and_linear_algebra_operations_match_concrete_evaluation() {
    let target = Value::vector(vec![0.4, -1.2, 2.5]);
    let (session, v) = identity_session(target.clone(), vec![0.0, 0.0, 0.0]);
    let w = Value::vector(vec![1.0, 2.0, -0.5]);
    let m = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 2.0, -1.0, 3.0, 0.5]);

    type Case = (&'static str, fn(&Value, &Value, &DMatrix<f64>) -> tandem_core::Result<Value>);
    let cases: [Case; 19] = [
        ("sum", |v, _, _| v.sum()),
        ("mean", |v, _, _| v.mean()),
        ("prod", |v, _, _| v.prod()),
        ("max", |v, _, _| v.max()),
        ("min", |v, _, _| v.min()),
        ("norm_l1", |v, _, _| v.norm(NormKind::L1)),
        ("norm_l2", |v, _, _| v.norm(NormKind::L2)),
        ("norm_inf", |v, _, _| v.norm(NormKind::Inf)),
        ("dot", |v, w, _| v.dot(w)),
        ("cross", |v, w, _| v.cross(w)),
        ("matvec", |v, _, m| dispatch::matvec(m, v)),
        ("concat", |v, w, _| dispatch::concat(&[w.clone(), v.clone()])),
        ("index", |v, _, _| v.index(1)),
        ("slice", |v, _, _| v.slice(1, 3)),
        ("diff", |v, _, _| v.diff()),
        ("cumsum", |v, _, _| v.cumsum()),
        ("clip", |v, _, _| v.clip(-1.0, 1.0)),
        ("select", |v, w, _| v.gt(0.0)?.select(v, w)),
        ("broadcast", |v, _, _| v.mul(2.0)?.add(Value::scalar(1.0))),
    ];

    let symbolic: Vec<Value> = cases
        .iter()
        .map(|(name, f)| {
            let out = f(&v, &w, &m).unwrap_or_else(|e| panic!("{name}: {e}"));
            assert!(out.is_symbolic(), "{name}");
            out
        })
        .collect();
    session.solve(&SolveOptions::default()).unwrap();

    for ((name, f), out) in cases.iter().zip(&symbolic) {
        let expected = f(&target, &w, &m).unwrap();
        assert!(!expected.is_symbolic());
        assert_close(&session.value_of(out).unwrap(), &expected, name);
    }
}

#[test]
fn mixed_kinds_always_give_symbolic_results() {
    let session = Session::new();
    let x = session
        .declare_variable(Declaration::scalar("x", 1.0))
        .unwrap();
    let c = Value::scalar(2.0);
    for op in BinaryOp::ALL {
        for (a, b) in [(&x, &c), (&c, &x)] {
            match dispatch::binary(op, a, b) {
                Ok(out) => assert_eq!(out.kind(), Kind::Symbolic, "{}", op.name()),
                Err(Error::UnsupportedOperation { operation, kind }) => {
                    assert!(!op.symbolic_support());
                    assert_eq!(operation, op.name());
                    assert_eq!(kind, Kind::Symbolic);
                }
                Err(other) => panic!("{}: {other}", op.name()),
            }
        }
    }
    let picked = dispatch::select(&Value::scalar(1.0), &x, &c).unwrap();
    assert!(picked.is_symbolic());
}

#[test]
fn values_from_another_session_are_rejected_everywhere() {
    let a = Session::new();
    let b = Session::new();
    let x = a
        .declare_variable(Declaration::filled("x", 3, 1.0))
        .unwrap();
    let y = b
        .declare_variable(Declaration::filled("y", 3, 2.0))
        .unwrap();
    let mixed = |result: tandem_core::Result<Value>, label: &str| {
        assert!(
            matches!(result, Err(Error::MixedSession { .. })),
            "{label}: {result:?}"
        );
    };

    for op in BinaryOp::ALL {
        mixed(dispatch::binary(op, &x, &y), op.name());
    }
    mixed(dispatch::select(&x, &y, &Value::scalar(0.0)), "select");
    mixed(dispatch::select(&Value::scalar(1.0), &x, &y), "select");
    mixed(x.dot(&y), "dot");
    mixed(x.cross(&y), "cross");
    mixed(dispatch::concat(&[x.clone(), Value::scalar(1.0), y.clone()]), "concat");

    assert!(matches!(
        b.add_residual(&x),
        Err(Error::ForeignSession { .. })
    ));
    assert!(matches!(
        b.add_constraint(&x, Some(0.0), None),
        Err(Error::ForeignSession { .. })
    ));
    assert!(matches!(
        b.add_least_squares(&x),
        Err(Error::ForeignSession { .. })
    ));
}

#[test]
fn closed_sub_session_outputs_cross_as_constants() {
    let inner = Session::new();
    let r = inner
        .declare_variable(Declaration::scalar("r", 1.0).lower(0.0))
        .unwrap();
    inner
        .add_residual(&r.mul(&r).unwrap().sub(2.0).unwrap())
        .unwrap();
    inner.solve(&SolveOptions::default()).unwrap();
    let root = inner.value_of(&r).unwrap();
    inner.close();

    let outer = Session::new();
    let x = outer
        .declare_variable(Declaration::scalar("x", 0.0))
        .unwrap();
    outer
        .add_residual(&x.sub(&root).unwrap())
        .unwrap();
    outer.solve(&SolveOptions::default()).unwrap();
    assert_abs_diff_eq!(
        scalar(&outer.value_of(&x).unwrap()),
        2.0_f64.sqrt(),
        epsilon = 1e-8
    );
}

#[test]
fn value_of_is_safe_from_several_threads() {
    let session = Session::new();
    let v = session
        .declare_variable(Declaration::vector("v", vec![0.0; 4]))
        .unwrap();
    let target = Value::vector(vec![1.0, 2.0, 3.0, 4.0]);
    session.add_residual(&v.sub(&target).unwrap()).unwrap();
    session.solve(&SolveOptions::default()).unwrap();

    let total = v.sum().unwrap();
    thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| scalar(&session.value_of(&total).unwrap())))
            .collect();
        for handle in handles {
            assert_abs_diff_eq!(handle.join().unwrap(), 10.0, epsilon = 1e-7);
        }
    });
}

/// Backend that always fails, to exercise the error path of `solve`.
struct BrokenSolver;

impl NonlinearSolver for BrokenSolver {
    fn solve(
        &self,
        _problem: &dyn NonlinearProblem,
        _options: &SolveOptions,
    ) -> anyhow::Result<SolverOutcome> {
        Err(anyhow!("factorization failed"))
    }
}

/// Backend that returns the initial guess as if it had converged.
struct AcceptGuess;

impl NonlinearSolver for AcceptGuess {
    fn solve(
        &self,
        problem: &dyn NonlinearProblem,
        _options: &SolveOptions,
    ) -> anyhow::Result<SolverOutcome> {
        let x = problem.initial_guess();
        let values = problem.evaluate(&x)?;
        Ok(SolverOutcome {
            residual_norm: values.residuals.norm(),
            objective: values.objective.norm_squared(),
            x,
            converged: true,
            iterations: 0,
        })
    }
}

#[test]
fn solver_backends_are_pluggable() {
    let session = Session::with_solver(AcceptGuess);
    let x = session
        .declare_variable(Declaration::scalar("x", 3.0))
        .unwrap();
    session.add_residual(&x.sub(1.0).unwrap()).unwrap();
    let report = session.solve(&SolveOptions::default()).unwrap();
    assert_eq!(report.iterations, 0);
    assert_abs_diff_eq!(report.residual_norm, 2.0);
    assert_eq!(scalar(&session.value_of(&x).unwrap()), 3.0);

    let broken = Session::with_solver(BrokenSolver);
    let y = broken
        .declare_variable(Declaration::scalar("y", 0.0))
        .unwrap();
    broken.add_residual(&y).unwrap();
    let err = broken
        .solve(&SolveOptions::default())
        .expect_err("backend failure");
    assert!(matches!(err, Error::Backend { .. }));
    assert!(err.to_string().contains("factorization failed"));
    assert_eq!(broken.phase(), Phase::Closed);
    assert!(matches!(
        broken.value_of(&y),
        Err(Error::SessionClosed { .. })
    ));
}

#[test]
fn native_branching_on_symbolic_values_is_refused() {
    let session = Session::new();
    let x = session
        .declare_variable(Declaration::scalar("x", 1.0))
        .unwrap();
    let condition = x.gt(0.0).unwrap();
    assert!(matches!(
        condition.truthy(),
        Err(Error::SymbolicValue { .. })
    ));
    assert!(matches!(x.to_f64(), Err(Error::SymbolicValue { .. })));
    assert!(Value::scalar(1.0).gt(0.0).unwrap().truthy().unwrap());
}
