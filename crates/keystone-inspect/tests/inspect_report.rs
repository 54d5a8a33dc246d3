use keystone_inspect::{inspect, load_config, InspectError};
use rusqlite::Connection;
use serde_json::json;

fn seed(path: &std::path::Path) {
    let conn = Connection::open(path).expect("open seed connection");
    conn.execute_batch(
        "CREATE TABLE entries (
            id INTEGER PRIMARY KEY,
            field1 INTEGER NOT NULL,
            field2 INTEGER NOT NULL,
            name TEXT NOT NULL
        );
        INSERT INTO entries (field1, field2, name) VALUES (20, 11, 'first');
        INSERT INTO entries (field1, field2, name) VALUES (30, 11, 'second');
        INSERT INTO entries (field1, field2, name) VALUES (40, 11, 'third');",
    )
    .expect("seed schema");
}

#[test]
fn report_from_config_file_includes_lookup_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("entries.db");
    seed(&db_path);

    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
            [database]
            path = "{}"
            pool_max_size = 2

            [inspect.lookup]
            base_query = "SELECT id, name FROM entries"
            per_id_filter = "field1=? AND field2=?"
            static_filter = "field1<?"
            static_params = [40]
            keys = [[20, 11], [30, 11], [40, 11]]
            "#,
            db_path.display()
        ),
    )
    .expect("write config");

    let config = load_config(&config_path.to_string_lossy()).expect("load config");
    let report = inspect(&config).expect("inspect");

    assert_eq!(report.pool.capacity, 2);
    assert_eq!(report.pool.checked_out, 0);

    let lookup = report.lookup.expect("lookup");
    assert_eq!(lookup.keys, 3);
    assert_eq!(
        lookup.rows,
        vec![vec![json!(1), json!("first")], vec![json!(2), json!("second")]]
    );

    let rendered = serde_json::to_value(&lookup.rows).expect("serialize rows");
    assert_eq!(rendered[1][1], json!("second"));
}

#[test]
fn unopenable_location_is_a_database_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        "[database]\npath = \"/nonexistent-keystone-dir/sub/db.sqlite\"\n",
    )
    .expect("write config");

    let config = load_config(&config_path.to_string_lossy()).expect("load config");
    let err = inspect(&config).expect_err("open should fail");
    assert!(matches!(err, InspectError::Db(_)));
}
