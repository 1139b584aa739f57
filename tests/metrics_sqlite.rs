#![cfg(all(feature = "metrics", feature = "sqlite"))]

use serde_json::json;
use trellis::metrics::{install_prometheus_recorder, record_pool_stats};
use trellis::prelude::*;

fn registry() -> Registry {
    Registry::new(vec![
        ModelDefinition::new("user")
            .column(ColumnDefinition::new("id", ColumnType::Integer).primary_key())
            .column(ColumnDefinition::new("username", ColumnType::Text)),
    ])
    .expect("registry")
}

#[tokio::test]
async fn metrics_are_recorded_for_queries() {
    let handle = install_prometheus_recorder().expect("recorder");
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("pool");
    sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT NOT NULL)")
        .execute(&pool)
        .await
        .expect("create");
    let db = Db::new(pool, registry());

    db.create_many("user", CreateSpec::row(json!({ "username": "metric" })))
        .await
        .expect("create");
    db.find_many("user", FindSpec::new().select(["username"]))
        .await
        .expect("find");
    record_pool_stats(db.pool(), "sqlite");

    let rendered = handle.render();
    assert!(rendered.contains("trellis_query_count"));
    assert!(rendered.contains("trellis_query_duration_ms"));
    assert!(rendered.contains("trellis_pool_size"));
}
