//! End-to-end scenarios for the embedded-network constraint: universality,
//! event forwarding and contradiction recovery across a master/slave family.

use std::io::Cursor;

use rustwcsp::{
    instances::{fio, Config, Wcsp},
    solving::Session,
    types::{costs::Cost, Value, Var},
};

/// Master and slave over the same two Boolean variables; the slave carries a
/// single binary cost function that is 0 on (0,0) and 1 elsewhere.
fn boolean_family() -> (Session, usize, usize, Vec<Var>) {
    let mut master = Wcsp::new("master");
    let x = master.make_enum_var("x", 1).unwrap();
    let y = master.make_enum_var("y", 1).unwrap();
    let mut slave = Wcsp::new("slave");
    let sx = slave.make_enum_var("x", 1).unwrap();
    let sy = slave.make_enum_var("y", 1).unwrap();
    slave
        .post_binary(sx, sy, &[Cost::ZERO, Cost::UNIT, Cost::UNIT, Cost::UNIT])
        .unwrap();
    let mut session = Session::new();
    let master_id = session.attach(master);
    let slave_id = session.attach(slave);
    (session, master_id, slave_id, vec![x, y])
}

#[test]
fn s5_universality_deconnects_without_pruning() {
    let (mut session, master_id, slave_id, scope) = boolean_family();
    let cidx = session
        .post_wcsp_constraint(
            master_id,
            scope,
            Some(slave_id),
            None,
            Cost::ZERO,
            Cost::UNIT,
            false,
            false,
        )
        .unwrap();
    session.store();
    session.propagate().unwrap();
    // the slave lower bound of zero witnesses the window, so the constraint
    // is universal and deconnects
    assert!(session.universal(cidx));
    assert!(!session.connected(cidx));
    for var in [Var::new(0), Var::new(1)] {
        assert_eq!(session.wcsp(master_id).domain_size(var), 2);
        assert_eq!(session.wcsp(slave_id).domain_size(var), 2);
    }
}

#[test]
fn s6_master_assignment_reaches_slave_atomically() {
    let (mut session, master_id, slave_id, scope) = boolean_family();
    session
        .post_wcsp_constraint(
            master_id,
            scope,
            Some(slave_id),
            None,
            Cost::ZERO,
            Cost::UNIT,
            false,
            false,
        )
        .unwrap();
    session.store();
    session
        .assign(master_id, Var::new(0), Value::new(1))
        .unwrap();
    // the slave mirrors the assignment and the guard is released
    assert_eq!(
        session.wcsp(slave_id).value_of(Var::new(0)),
        Some(Value::new(1))
    );
    assert!(!session.is_protected());
}

#[test]
fn s6_contradiction_unwinds_to_master() {
    // a hard slave tuple keeps the constraint active; violating its window
    // must surface as a master-side contradiction with clean slaves
    let mut master = Wcsp::new("master");
    let x = master.make_enum_var("x", 1).unwrap();
    let y = master.make_enum_var("y", 1).unwrap();
    let mut slave = Wcsp::new("slave");
    let sx = slave.make_enum_var("x", 1).unwrap();
    let sy = slave.make_enum_var("y", 1).unwrap();
    slave
        .post_binary(sx, sy, &[Cost::ZERO, Cost::UNIT, Cost::UNIT, Cost::TOP])
        .unwrap();
    let mut session = Session::new();
    let master_id = session.attach(master);
    let slave_id = session.attach(slave);
    session
        .post_wcsp_constraint(
            master_id,
            vec![x, y],
            Some(slave_id),
            None,
            Cost::ZERO,
            Cost::UNIT,
            false,
            false,
        )
        .unwrap();
    let depth = session.store();
    let features = *session.features();
    let errored = session.assign(master_id, x, Value::new(1)).is_err()
        || session.assign(master_id, y, Value::new(1)).is_err();
    assert!(errored);
    assert!(!session.is_protected());
    assert_eq!(*session.features(), features);
    // backtracking restores both networks
    session.restore(depth);
    assert_eq!(session.wcsp(master_id).domain_size(x), 2);
    assert_eq!(session.wcsp(slave_id).domain_size(sx), 2);
    assert_eq!(session.wcsp(slave_id).lb(), Cost::ZERO);
}

#[test]
fn slave_built_from_cfn_channel_round() {
    // the slave network comes straight from the CFN loader
    let cfn = r#"{"problem": {"name": "slave", "mustbe": "<10"},
        "variables": {"x": 2, "y": 2},
        "functions": {"f": {"scope": ["x", "y"], "costs": [0, 2, 2, 4]}}}"#;
    let slave = fio::load_reader(
        Cursor::new(cfn),
        fio::Format::Cfn,
        "slave",
        &Config::default(),
    )
    .unwrap();
    let mut master = Wcsp::new("master");
    let x = master.make_enum_var("x", 1).unwrap();
    let y = master.make_enum_var("y", 1).unwrap();
    let mut session = Session::new();
    let master_id = session.attach(master);
    let slave_id = session.attach(slave);
    session
        .post_wcsp_constraint(
            master_id,
            vec![x, y],
            Some(slave_id),
            None,
            Cost::ZERO,
            Cost::new(3),
            false,
            false,
        )
        .unwrap();
    // the slave bound tightens to the window
    assert_eq!(session.wcsp(slave_id).ub(), Cost::new(3));
    session.store();
    // a slave-side removal reaches the master
    session
        .remove(slave_id, Var::new(0), Value::new(0))
        .unwrap();
    assert!(!session.wcsp(master_id).can_be(x, Value::new(0)));
}

#[test]
fn negated_slave_bounds_the_upper_side() {
    // slave costs 0/1/1/1; its negation carries 1/0/0/0 with a unit shift
    let mut master = Wcsp::new("master");
    let x = master.make_enum_var("x", 1).unwrap();
    let y = master.make_enum_var("y", 1).unwrap();
    let mut slave = Wcsp::new("slave");
    let sx = slave.make_enum_var("x", 1).unwrap();
    let sy = slave.make_enum_var("y", 1).unwrap();
    slave
        .post_binary(sx, sy, &[Cost::ZERO, Cost::UNIT, Cost::UNIT, Cost::UNIT])
        .unwrap();
    let mut neg = Wcsp::new("negslave");
    let nx = neg.make_enum_var("x", 1).unwrap();
    let ny = neg.make_enum_var("y", 1).unwrap();
    neg.post_binary(
        nx,
        ny,
        &[-Cost::UNIT, Cost::ZERO, Cost::ZERO, Cost::ZERO],
    )
    .unwrap();
    assert_eq!(neg.neg_cost(), Cost::UNIT);
    let mut session = Session::new();
    let master_id = session.attach(master);
    let slave_id = session.attach(slave);
    let neg_id = session.attach(neg);
    let cidx = session
        .post_wcsp_constraint(
            master_id,
            vec![x, y],
            Some(slave_id),
            Some(neg_id),
            Cost::ZERO,
            Cost::UNIT,
            false,
            false,
        )
        .unwrap();
    // negated slave upper bound: -lb + negCost + 1
    assert_eq!(session.wcsp(neg_id).ub(), Cost::new(2));
    // not yet universal: the negated bound witness requires its lb to move
    assert!(!session.universal(cidx));
    session.store();
    // assigning (0,0) raises the negated slave's lb to 1 > -ub + negCost
    session
        .assign(master_id, x, Value::new(0))
        .unwrap();
    session
        .assign(master_id, y, Value::new(0))
        .unwrap();
    assert_eq!(
        session.wcsp(neg_id).value_of(Var::new(0)),
        Some(Value::new(0))
    );
}

#[test]
fn probing_leaves_no_trace() {
    let (mut session, _master_id, slave_id, scope) = boolean_family();
    let cidx = session
        .post_wcsp_constraint(
            0,
            scope,
            Some(slave_id),
            None,
            Cost::ZERO,
            Cost::UNIT,
            false,
            false,
        )
        .unwrap();
    session.store();
    let depth = session.wcsp(slave_id).depth();
    assert_eq!(
        session.eval(
            cidx,
            &[(Var::new(0), Value::new(0)), (Var::new(1), Value::new(0))]
        ),
        Cost::ZERO
    );
    assert!(session
        .eval(
            cidx,
            &[(Var::new(0), Value::new(1)), (Var::new(1), Value::new(1))]
        )
        .is_top());
    assert_eq!(session.wcsp(slave_id).depth(), depth);
    assert!(!session.wcsp(slave_id).assigned(Var::new(0)));
}
