//! idbridge demo
//!
//! Runs the "notes" walkthrough against the default on-disk store, or an
//! in-memory one with `--memory`, printing each response as JSON.

use serde::Serialize;
use serde_json::{json, Value};

use idbridge_core::{Config, DbData, IdbClient, IdbResponse, SchemaDescription, TableSchema};

fn print<T: Serialize>(step: &str, response: &IdbResponse<T>) {
    match serde_json::to_string(response) {
        Ok(json) => println!("{:<8} {}", step, json),
        Err(e) => tracing::error!(step, error = %e, "Cannot print response"),
    }
}

#[tokio::main]
async fn main() -> idbridge_core::Result<()> {
    idbridge_core::init_logging();

    let config = if std::env::args().any(|arg| arg == "--memory") {
        Config::in_memory()
    } else {
        Config::default()
    };
    let client = IdbClient::new(config)?;

    let schema = SchemaDescription::new().table(
        "items",
        TableSchema::new("id").auto_increment().index("byTag", ["tag"]),
    );

    let setup = client
        .setup_db("notes", 1, &schema)
        .await
        .map(|conn| conn.name().to_string());
    print("setup", &setup);

    let saved = client
        .save_db_data("notes", 1, "items", DbData::One(json!({"tag": "x", "text": "a"})))
        .await;
    print("save", &saved);

    let batch = DbData::Many(vec![
        json!({"tag": "x", "text": "b"}),
        json!({"tag": "y", "text": "c"}),
    ]);
    print("save", &client.save_db_data("notes", 1, "items", batch).await);

    let loaded = client
        .load_db_data::<Value>("notes", 1, "items", "byTag", "x")
        .await;
    print("load", &loaded);

    print(
        "count",
        &client.count_db_data("notes", 1, "items", "byTag", "x").await,
    );

    Ok(())
}
