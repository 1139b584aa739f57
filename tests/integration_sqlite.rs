#![cfg(feature = "sqlite")]

use serde_json::json;
use trellis::prelude::*;

async fn pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("pool");
    sqlx::query(
        "CREATE TABLE users (\
         id INTEGER PRIMARY KEY, \
         username TEXT NOT NULL UNIQUE, \
         role TEXT NOT NULL DEFAULT 'member', \
         deleted_at TEXT)",
    )
    .execute(&pool)
    .await
    .expect("create users");
    sqlx::query(
        "CREATE TABLE posts (\
         id INTEGER PRIMARY KEY, \
         user_id INTEGER NOT NULL, \
         title TEXT NOT NULL)",
    )
    .execute(&pool)
    .await
    .expect("create posts");
    pool
}

fn registry() -> Registry {
    Registry::new(vec![
        ModelDefinition::new("user")
            .column(ColumnDefinition::new("id", ColumnType::Integer).primary_key())
            .column(ColumnDefinition::new("username", ColumnType::Text).unique())
            .column(ColumnDefinition::new("role", ColumnType::Text).default_value("member"))
            .column(
                ColumnDefinition::new("deletedAt", ColumnType::Text)
                    .stored("deleted_at")
                    .nullable(),
            )
            .relation("posts", RelationDefinition::to_many("post", ["user_id"])),
        ModelDefinition::new("post")
            .column(ColumnDefinition::new("id", ColumnType::Integer).primary_key())
            .column(ColumnDefinition::new("user_id", ColumnType::Integer))
            .column(ColumnDefinition::new("title", ColumnType::Text))
            .relation("author", RelationDefinition::to_one("user", ["user_id"])),
    ])
    .expect("registry")
}

async fn db() -> Db<sqlx::Sqlite> {
    Db::new(pool().await, registry())
}

async fn seed_users(db: &Db<sqlx::Sqlite>, names: &[&str]) {
    for name in names {
        db.create_many("user", CreateSpec::row(json!({ "username": name })))
            .await
            .expect("seed user");
    }
}

fn usernames(rows: &[serde_json::Value]) -> Vec<&str> {
    rows.iter()
        .map(|row| row["username"].as_str().expect("username"))
        .collect()
}

#[tokio::test]
async fn like_filters_match_prefixes_exactly() {
    let db = db().await;
    seed_users(&db, &["Stewart House", "Stewart Home", "Steve"]).await;

    let found = db
        .find_many(
            "user",
            FindSpec::new()
                .select(["username"])
                .filter(Predicate::like("username", "Stewart %"))
                .order_by("username", Direction::Asc),
        )
        .await
        .expect("find");
    assert_eq!(usernames(&found), vec!["Stewart Home", "Stewart House"]);
}

#[tokio::test]
async fn selected_columns_are_exactly_the_output_keys() {
    let db = db().await;
    seed_users(&db, &["alice"]).await;

    let found = db
        .find_many("user", FindSpec::new().select(["username", "role"]))
        .await
        .expect("find");
    let object = found[0].as_object().expect("object");
    let mut keys: Vec<_> = object.keys().map(String::as_str).collect();
    keys.sort_unstable();
    // The implicitly projected primary key never leaks into the output.
    assert_eq!(keys, vec!["role", "username"]);
}

#[tokio::test]
async fn ordered_finds_are_stable_across_runs() {
    let db = db().await;
    seed_users(&db, &["carol", "alice", "bob"]).await;

    let spec = FindSpec::new()
        .select(["username"])
        .order_by("username", Direction::Desc);
    let first = db.find_many("user", spec.clone()).await.expect("first");
    let second = db.find_many("user", spec).await.expect("second");
    assert_eq!(first, second);
    assert_eq!(usernames(&first), vec!["carol", "bob", "alice"]);
}

#[tokio::test]
async fn empty_in_list_matches_no_rows() {
    let db = db().await;
    seed_users(&db, &["alice"]).await;

    let found = db
        .find_many(
            "user",
            FindSpec::new().filter(Predicate::is_in("id", Vec::<i64>::new())),
        )
        .await
        .expect("find");
    assert!(found.is_empty());
}

#[tokio::test]
async fn to_one_includes_nest_the_related_object() {
    let db = db().await;
    let alice = db
        .create_one("user", CreateSpec::row(json!({ "username": "alice" })))
        .await
        .expect("create alice");
    let alice_id = alice["id"].as_i64().expect("id");
    db.create_many(
        "post",
        CreateSpec::rows(vec![
            json!({ "user_id": alice_id, "title": "Post a" }),
            json!({ "user_id": 999, "title": "Orphan" }),
        ]),
    )
    .await
    .expect("create posts");

    let posts = db
        .find_many(
            "post",
            FindSpec::new()
                .select(["title"])
                .include("author", FindSpec::new().select(["username"]))
                .order_by("title", Direction::Asc),
        )
        .await
        .expect("find");
    assert_eq!(posts.len(), 2);
    // The dangling join materializes as an absent object, not nulled fields.
    assert_eq!(posts[0]["title"], "Orphan");
    assert!(posts[0]["author"].is_null());
    assert_eq!(posts[1]["author"]["username"], "alice");
}

#[tokio::test]
async fn create_binds_registry_defaults_and_returns_rows() {
    let db = db().await;
    let result = db
        .create_many(
            "user",
            CreateSpec::rows(vec![
                json!({ "username": "a" }),
                json!({ "username": "b", "role": "admin" }),
            ])
            .returning(["username", "role"]),
        )
        .await
        .expect("create");
    assert_eq!(result.affected, 2);
    assert_eq!(result.returned[0]["role"], "member");
    assert_eq!(result.returned[1]["role"], "admin");
}

#[tokio::test]
async fn on_conflict_do_nothing_suppresses_unique_violations() {
    let db = db().await;
    seed_users(&db, &["alice"]).await;

    let result = db
        .create_many(
            "user",
            CreateSpec::row(json!({ "username": "alice" })).on_conflict_do_nothing(),
        )
        .await
        .expect("create");
    assert_eq!(result.affected, 0);
    assert_eq!(db.count("user", FindSpec::new()).await.expect("count"), 1);

    // Without the policy the violation surfaces as a driver error.
    let err = db
        .create_many("user", CreateSpec::row(json!({ "username": "alice" })))
        .await;
    assert!(matches!(err, Err(TrellisError::Sqlx(_))));
}

#[tokio::test]
async fn create_rejects_missing_required_columns() {
    let db = db().await;
    let err = db
        .create_many("user", CreateSpec::row(json!({ "role": "admin" })))
        .await;
    assert!(matches!(err, Err(TrellisError::Build { .. })));
}

#[tokio::test]
async fn update_many_applies_the_change_set() {
    let db = db().await;
    seed_users(&db, &["a", "b"]).await;

    let result = db
        .update_many(
            "user",
            UpdateSpec::new(Predicate::eq("username", "a"), json!({ "role": "admin" })),
        )
        .await
        .expect("update");
    assert_eq!(result.affected, 1);

    let admin = db
        .find_one(
            "user",
            FindSpec::new()
                .select(["role"])
                .filter(Predicate::eq("username", "a")),
        )
        .await
        .expect("find");
    assert_eq!(admin["role"], "admin");
}

#[tokio::test]
async fn delete_many_removes_matching_rows() {
    let db = db().await;
    seed_users(&db, &["a", "b", "c"]).await;

    let result = db
        .delete_many(
            "user",
            DeleteSpec::new(Predicate::is_in("username", ["a", "c"])),
        )
        .await
        .expect("delete");
    assert_eq!(result.affected, 2);
    let left = db
        .find_many("user", FindSpec::new().select(["username"]))
        .await
        .expect("find");
    assert_eq!(usernames(&left), vec!["b"]);
}

#[tokio::test]
async fn update_and_delete_require_a_predicate() {
    let db = db().await;
    seed_users(&db, &["a", "b"]).await;

    let err = db
        .update_many(
            "user",
            UpdateSpec::new(Predicate::and([]), json!({ "role": "admin" })),
        )
        .await;
    assert!(matches!(err, Err(TrellisError::Build { .. })));

    let err = db.delete_many("user", DeleteSpec::new(Predicate::or([]))).await;
    assert!(matches!(err, Err(TrellisError::Build { .. })));

    // Nothing executed: both rows still there, untouched.
    let found = db
        .find_many("user", FindSpec::new().select(["username", "role"]))
        .await
        .expect("find");
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|u| u["role"] == "member"));
}

#[tokio::test]
async fn find_one_distinguishes_missing_from_ambiguous() {
    let db = db().await;
    seed_users(&db, &["a", "b"]).await;

    let err = db
        .find_one(
            "user",
            FindSpec::new().filter(Predicate::eq("username", "nobody")),
        )
        .await;
    assert!(matches!(err, Err(TrellisError::NotFound { .. })));

    let err = db
        .find_one(
            "user",
            FindSpec::new().filter(Predicate::eq("role", "member")),
        )
        .await;
    assert!(matches!(err, Err(TrellisError::NotUnique { .. })));

    let one = db
        .find_one("user", FindSpec::new().filter(Predicate::eq("username", "a")))
        .await
        .expect("find one");
    assert_eq!(one["username"], "a");
}

#[tokio::test]
async fn count_ignores_includes_ordering_and_pagination() {
    let db = db().await;
    seed_users(&db, &["a", "b", "c"]).await;

    let count = db
        .count(
            "user",
            FindSpec::new()
                .limit(1)
                .offset(1)
                .order_by("username", Direction::Desc)
                .include("posts", FindSpec::new()),
        )
        .await
        .expect("count");
    assert_eq!(count, 3);
}
