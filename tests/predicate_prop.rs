#![cfg(feature = "sqlite")]

use proptest::prelude::*;
use proptest::strategy::ValueTree;
use proptest::test_runner::{Config, TestRunner};
use serde_json::json;
use trellis::prelude::*;
use trellis::{BindValue, CompareOp, PredValue};

const NAMES: &[&str] = &["alice", "bob", "carol", "dave"];
const PATTERNS: &[&str] = &["a%", "%e", "%ar%", "bob", "%o%"];

/// The reference dataset: (id, name, nickname).
const ROWS: &[(i64, &str, Option<&str>)] = &[
    (1, "alice", Some("ace")),
    (2, "bob", None),
    (3, "carol", Some("caz")),
    (4, "dave", None),
    (5, "alice", None),
    (6, "bob", Some("ace")),
    (7, "carol", None),
    (8, "dave", Some("d")),
];

fn registry() -> Registry {
    Registry::new(vec![
        ModelDefinition::new("user")
            .column(ColumnDefinition::new("id", ColumnType::Integer).primary_key())
            .column(ColumnDefinition::new("name", ColumnType::Text))
            .column(ColumnDefinition::new("nickname", ColumnType::Text).nullable()),
    ])
    .expect("registry")
}

async fn seeded_db() -> Db<sqlx::Sqlite> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("pool");
    sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, nickname TEXT)")
        .execute(&pool)
        .await
        .expect("create");
    let db = Db::new(pool, registry());
    let rows = ROWS
        .iter()
        .map(|(id, name, nickname)| json!({ "id": id, "name": name, "nickname": nickname }))
        .collect();
    db.create_many("user", CreateSpec::rows(rows))
        .await
        .expect("seed");
    db
}

fn id_leaf() -> impl Strategy<Value = Predicate> {
    let op = prop_oneof![
        Just(CompareOp::Eq),
        Just(CompareOp::Ne),
        Just(CompareOp::Gt),
        Just(CompareOp::Gte),
        Just(CompareOp::Lt),
        Just(CompareOp::Lte),
    ];
    (0..10i64, op).prop_map(|(v, op)| Predicate::Compare {
        column: "id".to_owned(),
        op,
        value: PredValue::Value(BindValue::I64(v)),
    })
}

fn arb_leaf() -> impl Strategy<Value = Predicate> {
    prop_oneof![
        id_leaf(),
        // Deliberately includes the empty list.
        proptest::collection::vec(0..10i64, 0..4).prop_map(|vs| Predicate::is_in("id", vs)),
        (
            proptest::sample::select(NAMES),
            prop_oneof![Just(CompareOp::Eq), Just(CompareOp::Ne)]
        )
            .prop_map(|(name, op)| Predicate::Compare {
                column: "name".to_owned(),
                op,
                value: PredValue::Value(BindValue::String(name.to_owned())),
            }),
        proptest::sample::select(PATTERNS).prop_map(|p| Predicate::like("name", p)),
        Just(Predicate::is_null("nickname")),
        Just(Predicate::is_not_null("nickname")),
        Just(Predicate::eq("nickname", "ace")),
    ]
}

fn arb_predicate() -> impl Strategy<Value = Predicate> {
    arb_leaf().prop_recursive(3, 24, 3, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..3).prop_map(Predicate::And),
            proptest::collection::vec(inner.clone(), 0..3).prop_map(Predicate::Or),
            inner.prop_map(Predicate::not),
        ]
    })
}

/// `LIKE` with `%` wildcards only, over the all-lowercase domain above, so
/// SQLite's ASCII case folding never comes into play.
fn like_matches(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if i == parts.len() - 1 {
            return part.is_empty() || rest.ends_with(part);
        } else {
            let Some(at) = rest.find(part) else {
                return false;
            };
            rest = &rest[at + part.len()..];
        }
    }
    rest.is_empty()
}

/// Three-valued evaluation mirroring SQL: `None` is the unknown produced by
/// comparing against NULL; a row is selected only on `Some(true)`.
fn eval(p: &Predicate, row: &(i64, &str, Option<&str>)) -> Option<bool> {
    match p {
        Predicate::Compare { column, op, value } => {
            let lhs: Option<BindValue> = match column.as_str() {
                "id" => Some(BindValue::I64(row.0)),
                "name" => Some(BindValue::String(row.1.to_owned())),
                "nickname" => row.2.map(|n| BindValue::String(n.to_owned())),
                other => panic!("unexpected column {other}"),
            };
            match value {
                PredValue::List(values) => {
                    if values.is_empty() {
                        return Some(false);
                    }
                    lhs.map(|v| values.contains(&v))
                }
                PredValue::Value(BindValue::Null) => match op {
                    CompareOp::Eq | CompareOp::Is => Some(lhs.is_none()),
                    CompareOp::Ne | CompareOp::IsNot => Some(lhs.is_some()),
                    other => panic!("unexpected null op {other:?}"),
                },
                PredValue::Value(rhs) => {
                    let lhs = lhs?;
                    Some(match (op, &lhs, rhs) {
                        (CompareOp::Eq, l, r) => l == r,
                        (CompareOp::Ne, l, r) => l != r,
                        (CompareOp::Gt, BindValue::I64(l), BindValue::I64(r)) => l > r,
                        (CompareOp::Gte, BindValue::I64(l), BindValue::I64(r)) => l >= r,
                        (CompareOp::Lt, BindValue::I64(l), BindValue::I64(r)) => l < r,
                        (CompareOp::Lte, BindValue::I64(l), BindValue::I64(r)) => l <= r,
                        (CompareOp::Like, BindValue::String(l), BindValue::String(r)) => {
                            like_matches(r, l)
                        }
                        (op, l, r) => panic!("unexpected comparison {op:?} {l:?} {r:?}"),
                    })
                }
            }
        }
        Predicate::And(children) => {
            let mut unknown = false;
            for child in children {
                match eval(child, row) {
                    Some(false) => return Some(false),
                    None => unknown = true,
                    Some(true) => {}
                }
            }
            if unknown { None } else { Some(true) }
        }
        Predicate::Or(children) => {
            let mut unknown = false;
            for child in children {
                match eval(child, row) {
                    Some(true) => return Some(true),
                    None => unknown = true,
                    Some(false) => {}
                }
            }
            if unknown { None } else { Some(false) }
        }
        Predicate::Not(child) => eval(child, row).map(|b| !b),
    }
}

#[tokio::test]
async fn compiled_predicates_match_a_naive_in_memory_filter() {
    let db = seeded_db().await;
    let mut runner = TestRunner::new(Config {
        cases: 128,
        failure_persistence: None,
        ..Config::default()
    });
    let strategy = arb_predicate();

    for _ in 0..128 {
        let predicate = strategy.new_tree(&mut runner).unwrap().current();
        let found = db
            .find_many(
                "user",
                FindSpec::new()
                    .select(["id"])
                    .filter(predicate.clone())
                    .order_by("id", Direction::Asc),
            )
            .await
            .expect("find");
        let got: Vec<i64> = found
            .iter()
            .map(|row| row["id"].as_i64().expect("id"))
            .collect();
        let want: Vec<i64> = ROWS
            .iter()
            .filter(|row| eval(&predicate, row) == Some(true))
            .map(|row| row.0)
            .collect();
        assert_eq!(got, want, "diverged on predicate {predicate:?}");
    }
}

#[tokio::test]
async fn empty_in_list_selects_no_rows() {
    let db = seeded_db().await;
    let found = db
        .find_many(
            "user",
            FindSpec::new().filter(Predicate::is_in("id", Vec::<i64>::new())),
        )
        .await
        .expect("find");
    assert!(found.is_empty());
}
