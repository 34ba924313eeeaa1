//! End-to-end loader scenarios across the supported formats.

use std::io::Cursor;

use rustwcsp::{
    instances::{fio, Config},
    types::{costs::Cost, Value},
};

/// Four weighted queens in the legacy format: one variable per column, six
/// binary difference tables and four unary row preferences.
fn four_wqueens() -> String {
    let mut out = String::from("4-WQUEENS 4 4 10 5\n4 4 4 4\n");
    for (i, j) in [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)] {
        let dist = j - i;
        let mut tuples = vec![];
        for a in 0_i32..4 {
            for b in 0_i32..4 {
                if a == b || (a - b).abs() == dist {
                    tuples.push((a, b));
                }
            }
        }
        out.push_str(&format!("2 {i} {j} 0 {}\n", tuples.len()));
        for (a, b) in tuples {
            out.push_str(&format!("{a} {b} 5\n"));
        }
    }
    for i in 0..4 {
        out.push_str(&format!("1 {i} 0 2\n1 1\n2 1\n"));
    }
    out
}

fn all_assignments(n: usize, d: u32) -> Vec<Vec<Value>> {
    let mut out: Vec<Vec<Value>> = vec![vec![]];
    for _ in 0..n {
        out = out
            .into_iter()
            .flat_map(|a| {
                (0..d).map(move |v| {
                    let mut next = a.clone();
                    next.push(Value::new(v));
                    next
                })
            })
            .collect();
    }
    out
}

#[test]
fn s1_four_wqueens_optimum() {
    let wcsp = fio::load_reader(
        Cursor::new(four_wqueens()),
        fio::Format::Wcsp,
        "4-WQUEENS",
        &Config::default(),
    )
    .unwrap();
    assert_eq!(wcsp.num_variables(), 4);
    assert_eq!(wcsp.num_constraints(), 10);
    assert_eq!(wcsp.neg_cost(), Cost::ZERO);
    assert_eq!(wcsp.ub(), Cost::new(5));

    let mut best = Cost::TOP;
    let mut best_count = 0;
    for assignment in all_assignments(4, 4) {
        let cost = wcsp.eval_complete(&assignment);
        if cost < best {
            best = cost;
            best_count = 1;
        } else if cost == best {
            best_count += 1;
        }
    }
    // both queen placements pay one unit in their first and last columns
    assert_eq!(best, Cost::new(2));
    assert_eq!(best_count, 2);
}

#[test]
fn s2_alldiff_shared_tables() {
    let input = "\
AllDifferentDecomposedIntoBinaryConstraints 4 4 6 1
4 4 4 4
-2 0 1 0 4
0 0 1
1 1 1
2 2 1
3 3 1
2 0 2 0 -1
2 0 3 0 -1
2 1 2 0 -1
2 1 3 0 -1
2 2 3 0 -1
";
    let wcsp = fio::load_reader(
        Cursor::new(input),
        fio::Format::Wcsp,
        "alldiff",
        &Config::default(),
    )
    .unwrap();
    assert_eq!(wcsp.num_constraints(), 6);
    assert_eq!(wcsp.ub(), Cost::UNIT);

    let mut zero_cost = 0;
    for assignment in all_assignments(4, 4) {
        let cost = wcsp.eval_complete(&assignment);
        let distinct = (0..4).all(|i| (0..i).all(|j| assignment[i] != assignment[j]));
        if distinct {
            assert_eq!(cost, Cost::ZERO);
            zero_cost += 1;
        } else {
            // any value repetition reaches the bound
            assert!(cost >= wcsp.ub());
        }
    }
    assert_eq!(zero_cost, 24);
}

#[test]
fn s3_cnf_tautology_skipped() {
    let input = "p cnf 2 3\n1 -1 0\n1 2 0\n-2 0\n";
    let wcsp = fio::load_reader(
        Cursor::new(input),
        fio::Format::Cnf,
        "taut",
        &Config::default(),
    )
    .unwrap();
    // one clause fewer than declared is effective
    assert_eq!(wcsp.num_constraints(), 2);
}

#[test]
fn s4_qpbo_sign_flip() {
    let input = "-2\n-2\n1 1 -3\n1 2 2\n2 2 -1\n";
    let wcsp = fio::load_reader(
        Cursor::new(input),
        fio::Format::Qpbo,
        "flip",
        &Config::default(),
    )
    .unwrap();
    // maximisation flips through the negative multiplier; the declared
    // count reads two of the three entries, and the shift covers the read
    // diagonal constant and the symmetrised quadratic term
    assert!(wcsp.multiplier() < 0.0);
    assert_eq!(wcsp.neg_cost(), Cost::new(7));
    assert_eq!(wcsp.ub(), Cost::new(11));
    // the maximising assignment (-1, -1), at value index one, is free
    assert_eq!(
        wcsp.eval_complete(&[Value::new(1), Value::new(1)]),
        Cost::ZERO
    );
    assert_eq!(
        wcsp.eval_complete(&[Value::new(0), Value::new(0)]),
        Cost::new(6)
    );
}

#[test]
fn external_bound_tightens() {
    let config = Config {
        external_ub: Some(String::from("3")),
        ..Config::default()
    };
    let wcsp = fio::load_reader(
        Cursor::new(four_wqueens()),
        fio::Format::Wcsp,
        "4-WQUEENS",
        &config,
    )
    .unwrap();
    assert_eq!(wcsp.ub(), Cost::new(3));
}

#[test]
fn delta_relaxation_keeps_certification_bound() {
    let config = Config {
        delta_ub: Some(String::from("2")),
        ..Config::default()
    };
    let wcsp = fio::load_reader(
        Cursor::new(four_wqueens()),
        fio::Format::Wcsp,
        "4-WQUEENS",
        &config,
    )
    .unwrap();
    // the working bound carries the slack, certification takes it back out
    assert_eq!(wcsp.ub(), Cost::new(7));
    assert_eq!(wcsp.certified_ub(), Cost::new(5));
}

#[test]
fn cfn_round_trip_preserves_costs() {
    let input = r#"{"problem": {"name": "rt", "mustbe": "<12.0"},
        "variables": {"a": 3, "b": 3},
        "functions": {
          "fa": {"scope": ["a"], "costs": [0.5, 0.0, 2.5]},
          "fab": {"scope": ["a", "b"], "defaultcost": 1.0,
                  "costs": [0 0 0.0, 1 1 0.0, 2 2 0.0]}}}"#;
    let first = fio::load_reader(
        Cursor::new(input),
        fio::Format::Cfn,
        "rt",
        &Config::default(),
    )
    .unwrap();
    let mut emitted = Vec::new();
    rustwcsp::instances::fio::cfn::write_cfn(&first, &mut emitted).unwrap();
    let second = fio::load_reader(
        Cursor::new(emitted),
        fio::Format::Cfn,
        "rt",
        &Config::default(),
    )
    .unwrap();
    assert_eq!(first.ub(), second.ub());
    for assignment in all_assignments(2, 3) {
        assert_eq!(
            first.eval_complete(&assignment),
            second.eval_complete(&assignment)
        );
    }
}

#[test]
fn infeasible_bound_reported() {
    // constant cost reaches the declared bound
    let input = "inf 1 2 1 3\n2\n0 3 0\n";
    assert!(fio::load_reader(
        Cursor::new(input),
        fio::Format::Wcsp,
        "inf",
        &Config::default(),
    )
    .is_err());
}

#[test]
fn opb_objective_and_constraints() {
    let input = "* knapsack toy\nmin: 2 x1 +3 x2 +1 x3 ;\n+1 x1 +1 x2 +1 x3 >= 2 ;\n";
    let wcsp = fio::load_reader(
        Cursor::new(input),
        fio::Format::Opb,
        "toy",
        &Config::default(),
    )
    .unwrap();
    assert_eq!(wcsp.num_variables(), 3);
    // three unary objective terms plus one knapsack
    assert_eq!(wcsp.num_constraints(), 4);
    // picking the two cheapest items satisfies the constraint at cost 3
    let mut best = Cost::TOP;
    for assignment in all_assignments(3, 2) {
        best = best.min(wcsp.eval_complete(&assignment));
    }
    assert_eq!(best, Cost::new(3));
}

#[test]
fn uai_markov_grid() {
    let input = "MARKOV\n2\n2 2\n2\n1 0\n2 0 1\n\n2\n0.4 0.6\n\n4\n0.9 0.1 0.1 0.9\n";
    let wcsp = fio::load_reader(
        Cursor::new(input),
        fio::Format::Uai,
        "grid",
        &Config::default(),
    )
    .unwrap();
    // the jointly most likely assignment costs zero
    assert_eq!(
        wcsp.eval_complete(&[Value::new(1), Value::new(1)]),
        Cost::ZERO
    );
    let expected_shift = 0.6_f64.ln() + 0.9_f64.ln();
    assert!((wcsp.log_shift() - expected_shift).abs() < 1e-9);
}
