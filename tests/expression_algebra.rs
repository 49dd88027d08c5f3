mod common;

use std::sync::Arc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use shardex::core::types::{EventId, Value, ValueType};
use shardex::index::ids::Ids;
use shardex::query::ast::{Expression, Predicate, RelOp};
use shardex::schema::layout::RecordLayout;
use shardex::slice::builder::TableSliceBuilder;
use shardex::storage::partition::{Partition, PartitionId};

use common::at;

const WORDS: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

struct Row {
    x: Option<i64>,
    s: Option<&'static str>,
}

fn build(rng: &mut StdRng, dir: &TempDir, rows: usize) -> (Partition, Vec<Row>) {
    let layout = Arc::new(
        RecordLayout::new("algebra")
            .with_field("x", ValueType::Int)
            .with_field("s", ValueType::Str),
    );
    let mut builder = TableSliceBuilder::new(layout, EventId(0));
    let mut truth = Vec::with_capacity(rows);
    for i in 0..rows {
        let x = rng.gen_bool(0.9).then(|| rng.gen_range(-5..5));
        let s = rng.gen_bool(0.9).then(|| WORDS[rng.gen_range(0..WORDS.len())]);
        builder.add(
            at(i as i64),
            vec![
                x.map(Value::Int).unwrap_or(Value::Null),
                s.map(Value::str).unwrap_or(Value::Null),
            ],
        );
        truth.push(Row { x, s });
    }
    let mut partition = Partition::new(dir.path(), PartitionId::new());
    partition.add(&builder.finish().unwrap()).unwrap();
    (partition, truth)
}

fn random_predicate(rng: &mut StdRng) -> Predicate {
    if rng.gen_bool(0.5) {
        let ops = [
            RelOp::Equal,
            RelOp::NotEqual,
            RelOp::Less,
            RelOp::LessEqual,
            RelOp::Greater,
            RelOp::GreaterEqual,
        ];
        let op = ops[rng.gen_range(0..ops.len())];
        Predicate::field("x", op, Value::Int(rng.gen_range(-6..6)))
    } else {
        let ops = [RelOp::Equal, RelOp::NotEqual, RelOp::Ni, RelOp::NotNi];
        let op = ops[rng.gen_range(0..ops.len())];
        let word = WORDS[rng.gen_range(0..WORDS.len())];
        let operand = match op {
            RelOp::Ni | RelOp::NotNi => &word[1..3],
            _ => word,
        };
        Predicate::field("s", op, Value::str(operand))
    }
}

fn random_expression(rng: &mut StdRng, depth: u32) -> Expression {
    if depth == 0 || rng.gen_bool(0.3) {
        return random_predicate(rng).into();
    }
    match rng.gen_range(0..3) {
        0 => Expression::Conjunction((0..rng.gen_range(1..4)).map(|_| random_expression(rng, depth - 1)).collect()),
        1 => Expression::Disjunction((0..rng.gen_range(1..4)).map(|_| random_expression(rng, depth - 1)).collect()),
        _ => random_expression(rng, depth - 1).not(),
    }
}

/// Column semantics: nulls only satisfy the negative operators.
fn compare<T: PartialOrd>(op: RelOp, value: Option<T>, operand: T) -> bool {
    match op {
        RelOp::Equal => value.is_some_and(|v| v == operand),
        RelOp::NotEqual => !value.is_some_and(|v| v == operand),
        RelOp::Less => value.is_some_and(|v| v < operand),
        RelOp::LessEqual => value.is_some_and(|v| v <= operand),
        RelOp::Greater => value.is_some_and(|v| v > operand),
        RelOp::GreaterEqual => value.is_some_and(|v| v >= operand),
        op => unreachable!("{}", op),
    }
}

fn contains(op: RelOp, value: Option<&str>, needle: &str) -> bool {
    match op {
        RelOp::Ni => value.is_some_and(|s| s.contains(needle)),
        RelOp::NotNi => !value.is_some_and(|s| s.contains(needle)),
        _ => compare(op, value, needle),
    }
}

fn eval_predicate(pred: &Predicate, row: &Row) -> bool {
    let shardex::query::ast::Extractor::Field(key) = &pred.extractor else {
        unreachable!()
    };
    match (key.as_str(), &pred.value) {
        ("x", Value::Int(c)) => compare(pred.op, row.x, *c),
        ("s", Value::Str(c)) => contains(pred.op, row.s, c),
        _ => unreachable!(),
    }
}

fn eval(expr: &Expression, leaf: &dyn Fn(&Predicate) -> bool) -> bool {
    match expr {
        Expression::Conjunction(xs) => xs.iter().all(|x| eval(x, leaf)),
        Expression::Disjunction(xs) => xs.iter().any(|x| eval(x, leaf)),
        Expression::Negation(x) => !eval(x, leaf),
        Expression::Predicate(pred) => leaf(pred),
    }
}

fn brute_force(expr: &Expression, rows: &[Row]) -> Ids {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| eval(expr, &|pred: &Predicate| eval_predicate(pred, row)))
        .map(|(i, _)| i as u64)
        .collect()
}

/// Row of a partition holding `mixed.a { value: count }` and
/// `mixed.b { value: string, x: count }`.
enum MixedRow {
    A { value: Option<u64> },
    B { value: Option<&'static str>, x: Option<u64> },
}

fn maybe<T>(rng: &mut StdRng, f: impl FnOnce(&mut StdRng) -> T) -> Option<T> {
    if rng.gen_bool(0.9) { Some(f(rng)) } else { None }
}

fn build_mixed(rng: &mut StdRng, dir: &TempDir) -> (Partition, Vec<MixedRow>) {
    let a = Arc::new(RecordLayout::new("mixed.a").with_field("value", ValueType::Count));
    let b = Arc::new(
        RecordLayout::new("mixed.b")
            .with_field("value", ValueType::Str)
            .with_field("x", ValueType::Count),
    );
    let mut partition = Partition::new(dir.path(), PartitionId::new());
    let mut rows = Vec::new();
    // a, b, a again: the second `a` slice appends to the first table.
    for (chunk, len) in [(0, 100u64), (1, 100), (0, 50)] {
        let first = rows.len() as u64;
        let slice = if chunk == 0 {
            let mut builder = TableSliceBuilder::new(a.clone(), EventId(first));
            for i in 0..len {
                let value = maybe(rng, |rng| rng.gen_range(0..5u64));
                builder.add(at((first + i) as i64), vec![value.map(Value::Count).unwrap_or(Value::Null)]);
                rows.push(MixedRow::A { value });
            }
            builder.finish().unwrap()
        } else {
            let mut builder = TableSliceBuilder::new(b.clone(), EventId(first));
            for i in 0..len {
                let value = maybe(rng, |rng| WORDS[rng.gen_range(0..WORDS.len())]);
                let x = maybe(rng, |rng| rng.gen_range(0..5u64));
                builder.add(
                    at((first + i) as i64),
                    vec![
                        value.map(Value::str).unwrap_or(Value::Null),
                        x.map(Value::Count).unwrap_or(Value::Null),
                    ],
                );
                rows.push(MixedRow::B { value, x });
            }
            builder.finish().unwrap()
        };
        partition.add(&slice).unwrap();
    }
    (partition, rows)
}

fn random_mixed_predicate(rng: &mut StdRng) -> Predicate {
    let count_ops = [RelOp::Equal, RelOp::NotEqual, RelOp::Less, RelOp::GreaterEqual];
    let str_ops = [RelOp::Equal, RelOp::NotEqual, RelOp::Ni, RelOp::NotNi];
    match rng.gen_range(0..3) {
        0 => Predicate::field("value", count_ops[rng.gen_range(0..4)], Value::Count(rng.gen_range(0..6))),
        1 => {
            let op = str_ops[rng.gen_range(0..4)];
            let word = WORDS[rng.gen_range(0..WORDS.len())];
            let operand = if matches!(op, RelOp::Ni | RelOp::NotNi) { &word[1..3] } else { word };
            Predicate::field("value", op, Value::str(operand))
        }
        _ => Predicate::field("x", count_ops[rng.gen_range(0..4)], Value::Count(rng.gen_range(0..6))),
    }
}

fn random_mixed(rng: &mut StdRng, depth: u32) -> Expression {
    if depth == 0 || rng.gen_bool(0.3) {
        return random_mixed_predicate(rng).into();
    }
    match rng.gen_range(0..3) {
        0 => Expression::Conjunction((0..rng.gen_range(1..4)).map(|_| random_mixed(rng, depth - 1)).collect()),
        1 => Expression::Disjunction((0..rng.gen_range(1..4)).map(|_| random_mixed(rng, depth - 1)).collect()),
        _ => random_mixed(rng, depth - 1).not(),
    }
}

/// A field of another type in a row's layout matches nothing, for positive
/// and negative operators alike.
fn eval_mixed_predicate(pred: &Predicate, row: &MixedRow) -> bool {
    let shardex::query::ast::Extractor::Field(key) = &pred.extractor else {
        unreachable!()
    };
    match (key.as_str(), &pred.value, row) {
        ("value", Value::Count(c), MixedRow::A { value }) => compare(pred.op, *value, *c),
        ("value", Value::Str(c), MixedRow::B { value, .. }) => contains(pred.op, *value, c),
        ("x", Value::Count(c), MixedRow::B { x, .. }) => compare(pred.op, *x, *c),
        _ => false,
    }
}

fn brute_force_mixed(expr: &Expression, rows: &[MixedRow]) -> Ids {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| eval(expr, &|pred: &Predicate| eval_mixed_predicate(pred, row)))
        .map(|(i, _)| i as u64)
        .collect()
}

#[test]
fn test_lookup_matches_brute_force() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let dir = TempDir::new().unwrap();
    let (mut partition, rows) = build(&mut rng, &dir, 400);
    for _ in 0..300 {
        let expr = random_expression(&mut rng, 3);
        let expected = brute_force(&expr, &rows);
        assert_eq!(partition.lookup(&expr).unwrap(), expected, "expression {}", expr);
    }
}

#[test]
fn test_boolean_identities() {
    let mut rng = StdRng::seed_from_u64(42);
    let dir = TempDir::new().unwrap();
    let (mut partition, _) = build(&mut rng, &dir, 200);
    let all = partition.lookup(&Expression::Conjunction(Vec::new())).unwrap();
    assert_eq!(all.len(), 200);

    for _ in 0..100 {
        let a = random_expression(&mut rng, 2);
        let b = random_expression(&mut rng, 2);
        let la = partition.lookup(&a).unwrap();
        let lb = partition.lookup(&b).unwrap();

        let and = partition.lookup(&a.clone().and(b.clone())).unwrap();
        assert_eq!(and, &la & &lb);
        let or = partition.lookup(&a.clone().or(b.clone())).unwrap();
        assert_eq!(or, &la | &lb);
        let not_a = partition.lookup(&a.clone().not()).unwrap();
        assert_eq!(not_a, &all - &la);
        let double = partition.lookup(&a.clone().not().not()).unwrap();
        assert_eq!(double, la);

        // De Morgan
        let lhs = partition.lookup(&a.clone().and(b.clone()).not()).unwrap();
        let rhs = partition.lookup(&a.not().or(b.not())).unwrap();
        assert_eq!(lhs, rhs);
    }
}

#[test]
fn test_flushed_columns_answer_the_same() {
    let mut rng = StdRng::seed_from_u64(7);
    let dir = TempDir::new().unwrap();
    let (mut partition, rows) = build(&mut rng, &dir, 150);
    let id = partition.id();
    partition.flush_to_disk().unwrap();
    let mut reloaded = Partition::load(dir.path(), id).unwrap();
    for _ in 0..50 {
        let expr = random_expression(&mut rng, 3);
        assert_eq!(reloaded.lookup(&expr).unwrap(), brute_force(&expr, &rows), "expression {}", expr);
    }
}

#[test]
fn test_layouts_with_conflicting_field_types() {
    let mut rng = StdRng::seed_from_u64(0xc0ff);
    let dir = TempDir::new().unwrap();
    let (mut partition, rows) = build_mixed(&mut rng, &dir);
    let all = partition.lookup(&Expression::Conjunction(Vec::new())).unwrap();
    assert_eq!(all.len(), rows.len() as u64);

    // Only mixed.a can hold a count `value`; its negation still covers mixed.b.
    let one: Expression = Predicate::field("value", RelOp::Equal, Value::Count(1)).into();
    let hits = partition.lookup(&one).unwrap();
    assert_eq!(hits, brute_force_mixed(&one, &rows));
    let misses = partition.lookup(&one.clone().not()).unwrap();
    assert_eq!(misses, &all - &hits);
    assert!((100..200).all(|id| misses.contains(id)));

    let either = one.or(Predicate::field("x", RelOp::Equal, Value::Count(2)).into());
    assert_eq!(partition.lookup(&either).unwrap(), brute_force_mixed(&either, &rows));

    for _ in 0..300 {
        let expr = random_mixed(&mut rng, 3);
        let hits = partition.lookup(&expr).unwrap();
        assert_eq!(hits, brute_force_mixed(&expr, &rows), "expression {}", expr);
        let misses = partition.lookup(&expr.clone().not()).unwrap();
        assert!(hits.is_disjoint(&misses), "expression {}", expr);
        assert_eq!(&hits | &misses, all, "expression {}", expr);
    }

    // A string `x` fits no layout at all.
    let wrong: Expression = Predicate::field("x", RelOp::Equal, Value::str("2")).into();
    assert_eq!(
        partition.lookup(&wrong.not()).unwrap_err().kind,
        shardex::core::error::ErrorKind::TypeMismatch
    );
}
