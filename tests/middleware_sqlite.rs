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
         username TEXT NOT NULL, \
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
         title TEXT NOT NULL, \
         slug TEXT NOT NULL, \
         revised_by TEXT)",
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
            .column(ColumnDefinition::new("username", ColumnType::Text))
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
            .column(ColumnDefinition::new("slug", ColumnType::Text))
            .column(
                ColumnDefinition::new("revisedBy", ColumnType::Text)
                    .stored("revised_by")
                    .nullable(),
            )
            .relation("author", RelationDefinition::to_one("user", ["user_id"])),
    ])
    .expect("registry")
}

/// Hides soft-deleted users from every read, wherever they appear in the
/// query shape.
fn soft_delete_hooks() -> Hooks {
    let hide = |_: &Registry, _: &str, p: Predicate| {
        if p.is_empty() {
            Predicate::is_null("deletedAt")
        } else {
            Predicate::and([p, Predicate::is_null("deletedAt")])
        }
    };
    Hooks::new()
        .find_predicate("user", hide)
        .count_predicate("user", hide)
}

async fn db_with(hooks: Hooks) -> Db<sqlx::Sqlite> {
    Db::new(pool().await, registry()).with_hooks(hooks)
}

#[tokio::test]
async fn find_hooks_hide_soft_deleted_rows_at_the_root() {
    let db = db_with(soft_delete_hooks()).await;
    db.create_many(
        "user",
        CreateSpec::rows(vec![
            json!({ "username": "alice" }),
            json!({ "username": "bob", "deletedAt": "2024-05-01T00:00:00Z" }),
        ]),
    )
    .await
    .expect("seed");

    let found = db
        .find_many("user", FindSpec::new().select(["username"]))
        .await
        .expect("find");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["username"], "alice");
    assert_eq!(db.count("user", FindSpec::new()).await.expect("count"), 1);
}

#[tokio::test]
async fn find_hooks_apply_to_nested_to_one_branches() {
    let db = db_with(soft_delete_hooks()).await;
    let users = db
        .create_many(
            "user",
            CreateSpec::rows(vec![
                json!({ "username": "alice" }),
                json!({ "username": "ghost", "deletedAt": "2024-05-01T00:00:00Z" }),
            ])
            .returning(["id", "username"]),
        )
        .await
        .expect("seed users");
    let alice_id = users.returned[0]["id"].as_i64().expect("id");
    let ghost_id = users.returned[1]["id"].as_i64().expect("id");
    db.create_many(
        "post",
        CreateSpec::rows(vec![
            json!({ "user_id": alice_id, "title": "Kept", "slug": "kept" }),
            json!({ "user_id": ghost_id, "title": "Haunted", "slug": "haunted" }),
        ]),
    )
    .await
    .expect("seed posts");

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
    // The caller never mentioned deletedAt; the ghost author still vanishes
    // while the post row itself stays.
    assert_eq!(posts.len(), 2);
    assert!(posts[0]["author"].is_null());
    assert_eq!(posts[1]["author"]["username"], "alice");
}

#[tokio::test]
async fn create_values_hooks_supply_omitted_columns_before_validation() {
    let slugify = |_: &Registry, _: &str, mut values: serde_json::Map<String, serde_json::Value>| {
        if !values.contains_key("slug")
            && let Some(title) = values.get("title").and_then(|t| t.as_str())
        {
            let slug = title.to_lowercase().replace(' ', "-");
            values.insert("slug".to_owned(), json!(slug));
        }
        values
    };
    let db = db_with(Hooks::new().create_values("post", slugify)).await;

    // `slug` is required; without the hook this is a build error.
    let bare = db_with(Hooks::new()).await;
    let err = bare
        .create_many(
            "post",
            CreateSpec::row(json!({ "user_id": 1, "title": "Hello World" })),
        )
        .await;
    assert!(matches!(err, Err(TrellisError::Build { .. })));

    let created = db
        .create_many(
            "post",
            CreateSpec::row(json!({ "user_id": 1, "title": "Hello World" })).returning(["slug"]),
        )
        .await
        .expect("create");
    assert_eq!(created.returned[0]["slug"], "hello-world");
}

#[tokio::test]
async fn update_values_hooks_stamp_every_change_set() {
    let db = db_with(Hooks::new().update_values("post", |_, _, mut values| {
        values.insert("revisedBy".to_owned(), json!("system"));
        values
    }))
    .await;
    db.create_many(
        "post",
        CreateSpec::row(json!({ "user_id": 1, "title": "Draft", "slug": "draft" })),
    )
    .await
    .expect("seed");

    db.update_many(
        "post",
        UpdateSpec::new(Predicate::eq("slug", "draft"), json!({ "title": "Final" })),
    )
    .await
    .expect("update");

    let post = db
        .find_one(
            "post",
            FindSpec::new()
                .select(["title", "revisedBy"])
                .filter(Predicate::eq("slug", "draft")),
        )
        .await
        .expect("find");
    assert_eq!(post["title"], "Final");
    assert_eq!(post["revisedBy"], "system");
}

#[tokio::test]
async fn write_predicate_hooks_restrict_update_and_delete_scope() {
    let guard = |_: &Registry, _: &str, p: Predicate| {
        Predicate::and([p, Predicate::eq("role", "member")])
    };
    let db = db_with(
        Hooks::new()
            .update_predicate("user", guard)
            .delete_predicate("user", guard),
    )
    .await;
    db.create_many(
        "user",
        CreateSpec::rows(vec![
            json!({ "username": "root", "role": "admin" }),
            json!({ "username": "mortal" }),
        ]),
    )
    .await
    .expect("seed");

    // Admins are outside the rewritten predicate on both write paths.
    let updated = db
        .update_many(
            "user",
            UpdateSpec::new(Predicate::eq("username", "root"), json!({ "username": "pwned" })),
        )
        .await
        .expect("update");
    assert_eq!(updated.affected, 0);

    let deleted = db
        .delete_many("user", DeleteSpec::new(Predicate::eq("username", "root")))
        .await
        .expect("delete");
    assert_eq!(deleted.affected, 0);

    let deleted = db
        .delete_many("user", DeleteSpec::new(Predicate::eq("username", "mortal")))
        .await
        .expect("delete");
    assert_eq!(deleted.affected, 1);
}
