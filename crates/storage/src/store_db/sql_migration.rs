//! Schema reconciliation for the SQL engine.
//!
//! The `metadata` table is the ground truth for what exists on disk: one row
//! per index (JSON of the index schema, keyed `<store>_<index>`) plus the
//! last applied schema version. Migration compares the declared schema
//! against those rows and the actual tables, then runs the cheapest safe
//! path per store: full rebuild, in-place column copy, additive columns, or
//! plain index recreation.

use std::collections::{HashMap, HashSet};

use libsql::{Connection, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use docstore_common::Document;
use docstore_common::schema::{DbSchema, IndexSchema, StoreSchema};

use crate::error::StoreError;
use crate::store_db::sql::{
    SqlExecutor, column_indexes, execute_put, index_column_name, is_separate_table_index,
    separate_table_name,
};

pub(crate) const SCHEMA_VERSION_KEY: &str = "schemaVersion";
/// Full migrations re-put documents in batches of roughly this many bytes.
const DB_MIGRATION_MAX_BYTE_TARGET: u64 = 1_000_000;
const DEFAULT_ESTIMATED_OBJECT_SIZE: u64 = 1_024;

/// Persisted description of one on-disk index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexMetadata {
    key: String,
    store_name: String,
    index: IndexSchema,
}

fn meta_key(store: &StoreSchema, index: &IndexSchema) -> String {
    format!("{}_{}", store.name, index.name)
}

fn column_sql_index_name(store_name: &str, index_name: &str) -> String {
    format!("{store_name}_{index_name}")
}

fn pivot_sql_index_name(store_name: &str, index_name: &str) -> String {
    format!("{store_name}_{index_name}_k")
}

pub(crate) async fn migrate_database(
    conn: &Connection,
    schema: &DbSchema,
    fts_supported: bool,
    wipe_requested: bool,
    strip_unicode: bool,
) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS metadata (name TEXT PRIMARY KEY, value TEXT)",
        (),
    )
    .await?;
    let on_disk_version = read_schema_version(conn).await?;
    if on_disk_version == schema.version && !wipe_requested {
        return Ok(());
    }
    if on_disk_version > schema.version && !wipe_requested {
        return Err(StoreError::SchemaTooNew {
            on_disk: on_disk_version,
            requested: schema.version,
        });
    }

    let below_usable_floor = schema
        .last_usable_version
        .is_some_and(|floor| on_disk_version < floor);
    if wipe_requested || below_usable_floor {
        info!(
            on_disk_version,
            requested = schema.version,
            "wiping database before schema creation"
        );
        wipe_all_tables(conn).await?;
        for store in &schema.stores {
            create_store(conn, store, fts_supported).await?;
            write_index_metas(conn, store).await?;
        }
    } else {
        info!(
            on_disk_version,
            requested = schema.version,
            "migrating database schema"
        );
        migrate_incrementally(conn, schema, fts_supported, strip_unicode).await?;
    }

    write_schema_version(conn, schema.version).await?;
    Ok(())
}

async fn read_schema_version(conn: &Connection) -> Result<u32, StoreError> {
    let mut rows = conn
        .query(
            "SELECT value FROM metadata WHERE name = ?",
            vec![Value::Text(SCHEMA_VERSION_KEY.to_string())],
        )
        .await?;
    match rows.next().await? {
        Some(row) => match row.get_value(0)? {
            Value::Text(text) => text
                .parse::<u32>()
                .map_err(|err| StoreError::Custom(format!("bad schema version row: {err}"))),
            _ => Err(StoreError::Custom(
                "unexpected column type for the schema version".to_string(),
            )),
        },
        None => Ok(0),
    }
}

async fn write_schema_version(conn: &Connection, version: u32) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (name, value) VALUES (?, ?)",
        vec![
            Value::Text(SCHEMA_VERSION_KEY.to_string()),
            Value::Text(version.to_string()),
        ],
    )
    .await?;
    Ok(())
}

async fn read_table_names(conn: &Connection) -> Result<HashSet<String>, StoreError> {
    let mut rows = conn
        .query("SELECT name FROM sqlite_master WHERE type = 'table'", ())
        .await?;
    let mut names = HashSet::new();
    while let Some(row) = rows.next().await? {
        if let Value::Text(name) = row.get_value(0)? {
            if !name.starts_with("sqlite_") {
                names.insert(name);
            }
        }
    }
    Ok(names)
}

async fn read_sql_index_names(conn: &Connection) -> Result<HashSet<String>, StoreError> {
    let mut rows = conn
        .query("SELECT name FROM sqlite_master WHERE type = 'index'", ())
        .await?;
    let mut names = HashSet::new();
    while let Some(row) = rows.next().await? {
        if let Value::Text(name) = row.get_value(0)? {
            if !name.starts_with("sqlite_") {
                names.insert(name);
            }
        }
    }
    Ok(names)
}

async fn read_table_columns(
    conn: &Connection,
    table: &str,
) -> Result<HashSet<String>, StoreError> {
    let mut rows = conn
        .query(&format!("PRAGMA table_info({table})"), ())
        .await?;
    let mut columns = HashSet::new();
    while let Some(row) = rows.next().await? {
        if let Value::Text(name) = row.get_value(1)? {
            columns.insert(name);
        }
    }
    Ok(columns)
}

async fn read_index_metadata(conn: &Connection) -> Result<Vec<IndexMetadata>, StoreError> {
    let mut rows = conn
        .query(
            "SELECT value FROM metadata WHERE name != ?",
            vec![Value::Text(SCHEMA_VERSION_KEY.to_string())],
        )
        .await?;
    let mut metas = Vec::new();
    while let Some(row) = rows.next().await? {
        if let Value::Text(value) = row.get_value(0)? {
            metas.push(serde_json::from_str(&value)?);
        }
    }
    Ok(metas)
}

async fn delete_index_meta(conn: &Connection, key: &str) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM metadata WHERE name = ?",
        vec![Value::Text(key.to_string())],
    )
    .await?;
    Ok(())
}

async fn write_index_metas(conn: &Connection, store: &StoreSchema) -> Result<(), StoreError> {
    for index in &store.indexes {
        let meta = IndexMetadata {
            key: meta_key(store, index),
            store_name: store.name.clone(),
            index: index.clone(),
        };
        conn.execute(
            "INSERT OR REPLACE INTO metadata (name, value) VALUES (?, ?)",
            vec![
                Value::Text(meta.key.clone()),
                Value::Text(serde_json::to_string(&meta)?),
            ],
        )
        .await?;
    }
    Ok(())
}

async fn wipe_all_tables(conn: &Connection) -> Result<(), StoreError> {
    for table in read_table_names(conn).await? {
        if table != "metadata" {
            conn.execute(&format!("DROP TABLE IF EXISTS {table}"), ())
                .await?;
        }
    }
    conn.execute("DELETE FROM metadata", ()).await?;
    Ok(())
}

async fn create_store(
    conn: &Connection,
    store: &StoreSchema,
    fts_supported: bool,
) -> Result<(), StoreError> {
    let columns = column_indexes(store, fts_supported);
    let mut definitions = vec!["nsp_pk TEXT PRIMARY KEY".to_string(), "nsp_data TEXT".to_string()];
    definitions.extend(
        columns
            .iter()
            .map(|index| format!("{} TEXT", index_column_name(index))),
    );
    conn.execute(
        &format!("CREATE TABLE {} ({})", store.name, definitions.join(", ")),
        (),
    )
    .await?;
    for index in &store.indexes {
        if is_separate_table_index(index, fts_supported) {
            create_separate_table(conn, store, index, fts_supported).await?;
        } else {
            create_column_sql_index(conn, store, index).await?;
        }
    }
    Ok(())
}

async fn create_column_sql_index(
    conn: &Connection,
    store: &StoreSchema,
    index: &IndexSchema,
) -> Result<(), StoreError> {
    let unique = if index.unique { "UNIQUE " } else { "" };
    let column = index_column_name(index);
    let target = if index.include_data_in_index {
        format!("({column}, nsp_data)")
    } else {
        format!("({column})")
    };
    conn.execute(
        &format!(
            "CREATE {unique}INDEX IF NOT EXISTS {} ON {} {target}",
            column_sql_index_name(&store.name, &index.name),
            store.name
        ),
        (),
    )
    .await?;
    Ok(())
}

/// Creates the pivot table for a multi-entry or full-text index, dropping
/// any stale incarnation first.
async fn create_separate_table(
    conn: &Connection,
    store: &StoreSchema,
    index: &IndexSchema,
    fts_supported: bool,
) -> Result<(), StoreError> {
    let table = separate_table_name(store, index);
    conn.execute(&format!("DROP TABLE IF EXISTS {table}"), ())
        .await?;
    conn.execute(
        &format!(
            "DROP INDEX IF EXISTS {}",
            pivot_sql_index_name(&store.name, &index.name)
        ),
        (),
    )
    .await?;
    if index.full_text && fts_supported {
        conn.execute(
            &format!("CREATE VIRTUAL TABLE {table} USING fts3 (nsp_key TEXT, nsp_refpk TEXT)"),
            (),
        )
        .await?;
        return Ok(());
    }
    let with_data = index.include_data_in_index;
    let definitions = if with_data {
        "nsp_key TEXT, nsp_refpk TEXT, nsp_data TEXT"
    } else {
        "nsp_key TEXT, nsp_refpk TEXT"
    };
    conn.execute(&format!("CREATE TABLE {table} ({definitions})"), ())
        .await?;
    let unique = if index.unique { "UNIQUE " } else { "" };
    let target = if with_data {
        "(nsp_key, nsp_refpk, nsp_data)"
    } else {
        "(nsp_key, nsp_refpk)"
    };
    conn.execute(
        &format!(
            "CREATE {unique}INDEX {} ON {table} {target}",
            pivot_sql_index_name(&store.name, &index.name)
        ),
        (),
    )
    .await?;
    Ok(())
}

async fn migrate_incrementally(
    conn: &Connection,
    schema: &DbSchema,
    fts_supported: bool,
    strip_unicode: bool,
) -> Result<(), StoreError> {
    let tables = read_table_names(conn).await?;
    let sql_indexes = read_sql_index_names(conn).await?;
    let metas = read_index_metadata(conn).await?;

    drop_orphan_tables(conn, schema, &tables, &metas).await?;

    let meta_by_key: HashMap<&str, &IndexMetadata> =
        metas.iter().map(|meta| (meta.key.as_str(), meta)).collect();
    for store in &schema.stores {
        migrate_store(
            conn,
            store,
            &tables,
            &sql_indexes,
            &meta_by_key,
            &metas,
            fts_supported,
            strip_unicode,
        )
        .await?;
        write_index_metas(conn, store).await?;
    }
    Ok(())
}

/// Drops tables belonging to stores no longer in the schema, along with
/// stale `temp_` leftovers, and clears their meta rows.
async fn drop_orphan_tables(
    conn: &Connection,
    schema: &DbSchema,
    tables: &HashSet<String>,
    metas: &[IndexMetadata],
) -> Result<(), StoreError> {
    let known: HashSet<&str> = schema.stores.iter().map(|store| store.name.as_str()).collect();
    let mut keep: HashSet<String> = HashSet::new();
    keep.insert("metadata".to_string());
    for store in &schema.stores {
        keep.insert(store.name.clone());
        for index in &store.indexes {
            keep.insert(separate_table_name(store, index));
        }
    }
    for meta in metas {
        if known.contains(meta.store_name.as_str()) {
            keep.insert(meta.key.clone());
        }
    }
    for table in tables {
        if !keep.contains(table) {
            debug!("dropping orphan table {table}");
            conn.execute(&format!("DROP TABLE IF EXISTS {table}"), ())
                .await?;
            delete_index_meta(conn, table).await?;
        }
    }
    for meta in metas {
        if !known.contains(meta.store_name.as_str()) {
            delete_index_meta(conn, &meta.key).await?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn migrate_store(
    conn: &Connection,
    store: &StoreSchema,
    tables: &HashSet<String>,
    sql_indexes: &HashSet<String>,
    meta_by_key: &HashMap<&str, &IndexMetadata>,
    metas: &[IndexMetadata],
    fts_supported: bool,
    strip_unicode: bool,
) -> Result<(), StoreError> {
    if !tables.contains(&store.name) {
        info!(store = %store.name, "creating store");
        create_store(conn, store, fts_supported).await?;
        return Ok(());
    }

    let on_disk_columns = read_table_columns(conn, &store.name).await?;

    let mut new_backfill = Vec::new();
    let mut new_no_backfill = Vec::new();
    let mut changed = Vec::new();
    let mut missing_physical = Vec::new();
    let mut missing_sql_indexes = Vec::new();
    for index in &store.indexes {
        let key = meta_key(store, index);
        match meta_by_key.get(key.as_str()) {
            None => {
                if index.do_not_backfill {
                    new_no_backfill.push(index);
                } else {
                    new_backfill.push(index);
                }
            }
            Some(meta) if !index.same_shape(&meta.index) => changed.push(index),
            Some(_) => {
                let physically_present = if is_separate_table_index(index, fts_supported) {
                    tables.contains(&separate_table_name(store, index))
                } else {
                    on_disk_columns.contains(&index_column_name(index))
                };
                if !physically_present {
                    missing_physical.push(index);
                    continue;
                }
                let expected_sql_index = if is_separate_table_index(index, fts_supported) {
                    // FTS virtual tables have no secondary index to check.
                    if index.full_text {
                        continue;
                    }
                    pivot_sql_index_name(&store.name, &index.name)
                } else {
                    column_sql_index_name(&store.name, &index.name)
                };
                if !sql_indexes.contains(&expected_sql_index) {
                    missing_sql_indexes.push(index);
                }
            }
        }
    }

    let desired_keys: HashSet<String> = store
        .indexes
        .iter()
        .map(|index| meta_key(store, index))
        .collect();
    let removed: Vec<&IndexMetadata> = metas
        .iter()
        .filter(|meta| meta.store_name == store.name && !desired_keys.contains(&meta.key))
        .collect();
    let removed_column: Vec<&IndexMetadata> = removed
        .iter()
        .copied()
        .filter(|meta| !is_separate_table_index(&meta.index, fts_supported))
        .collect();
    let removed_separate: Vec<&IndexMetadata> = removed
        .iter()
        .copied()
        .filter(|meta| is_separate_table_index(&meta.index, fts_supported))
        .collect();

    // Pivot tables for dropped indexes go away on every path.
    for meta in &removed_separate {
        conn.execute(&format!("DROP TABLE IF EXISTS {}", meta.key), ())
            .await?;
        conn.execute(
            &format!(
                "DROP INDEX IF EXISTS {}",
                pivot_sql_index_name(&store.name, &meta.index.name)
            ),
            (),
        )
        .await?;
        delete_index_meta(conn, &meta.key).await?;
    }

    let needs_full_migration =
        !new_backfill.is_empty() || !changed.is_empty() || !missing_physical.is_empty();
    if needs_full_migration {
        info!(store = %store.name, "running full store migration");
        for meta in &removed_column {
            delete_index_meta(conn, &meta.key).await?;
        }
        full_store_migration(conn, store, metas, fts_supported, strip_unicode).await?;
        return Ok(());
    }

    // Not an early return: a no-backfill index added in the same migration
    // still needs its column or pivot table created below.
    if !removed_column.is_empty() {
        info!(store = %store.name, "running in-place store migration");
        in_place_store_migration(conn, store, &removed_column, &on_disk_columns, fts_supported)
            .await?;
    }

    if !new_no_backfill.is_empty() {
        info!(store = %store.name, "adding no-backfill indexes");
        for index in &new_no_backfill {
            if is_separate_table_index(index, fts_supported) {
                create_separate_table(conn, store, index, fts_supported).await?;
            } else {
                conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {} TEXT",
                        store.name,
                        index_column_name(index)
                    ),
                    (),
                )
                .await?;
                create_column_sql_index(conn, store, index).await?;
            }
        }
    }

    for index in &missing_sql_indexes {
        debug!(store = %store.name, index = %index.name, "recreating sql index");
        if is_separate_table_index(index, fts_supported) {
            // Covered by create_separate_table during full migration; a lone
            // missing pivot index is recreated directly.
            let table = separate_table_name(store, index);
            let unique = if index.unique { "UNIQUE " } else { "" };
            let target = if index.include_data_in_index {
                "(nsp_key, nsp_refpk, nsp_data)"
            } else {
                "(nsp_key, nsp_refpk)"
            };
            conn.execute(
                &format!(
                    "CREATE {unique}INDEX IF NOT EXISTS {} ON {table} {target}",
                    pivot_sql_index_name(&store.name, &index.name)
                ),
                (),
            )
            .await?;
        } else {
            create_column_sql_index(conn, store, index).await?;
        }
    }
    Ok(())
}

/// Rebuilds the store's main table and every index by renaming the table
/// aside and re-putting each document through the normal write path, so all
/// index side effects happen exactly as they would on a client `put`.
async fn full_store_migration(
    conn: &Connection,
    store: &StoreSchema,
    metas: &[IndexMetadata],
    fts_supported: bool,
    strip_unicode: bool,
) -> Result<(), StoreError> {
    for meta in metas.iter().filter(|meta| meta.store_name == store.name) {
        if is_separate_table_index(&meta.index, fts_supported) {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", meta.key), ())
                .await?;
            conn.execute(
                &format!(
                    "DROP INDEX IF EXISTS {}",
                    pivot_sql_index_name(&store.name, &meta.index.name)
                ),
                (),
            )
            .await?;
        } else {
            conn.execute(
                &format!(
                    "DROP INDEX IF EXISTS {}",
                    column_sql_index_name(&store.name, &meta.index.name)
                ),
                (),
            )
            .await?;
        }
    }

    // Indexes follow a renamed table and keep their names, which would make
    // the IF NOT EXISTS recreation below a no-op; clear them first.
    for index in &store.indexes {
        if !is_separate_table_index(index, fts_supported) {
            conn.execute(
                &format!(
                    "DROP INDEX IF EXISTS {}",
                    column_sql_index_name(&store.name, &index.name)
                ),
                (),
            )
            .await?;
        }
    }

    conn.execute(&format!("DROP TABLE IF EXISTS temp_{}", store.name), ())
        .await?;
    conn.execute(
        &format!("ALTER TABLE {} RENAME TO temp_{}", store.name, store.name),
        (),
    )
    .await?;
    create_store(conn, store, fts_supported).await?;

    let estimated = store
        .estimated_obj_bytes
        .map(u64::from)
        .unwrap_or(DEFAULT_ESTIMATED_OBJECT_SIZE)
        .max(1);
    let batch_size = (DB_MIGRATION_MAX_BYTE_TARGET / estimated).max(1);
    let executor = SqlExecutor::Connection(conn);
    let mut offset = 0u64;
    loop {
        let mut rows = conn
            .query(
                &format!(
                    "SELECT nsp_data FROM temp_{} ORDER BY nsp_pk LIMIT {batch_size} OFFSET {offset}",
                    store.name
                ),
                (),
            )
            .await?;
        let mut documents: Vec<Document> = Vec::new();
        while let Some(row) = rows.next().await? {
            if let Value::Text(text) = row.get_value(0)? {
                documents.push(serde_json::from_str(&text)?);
            }
        }
        let fetched = documents.len() as u64;
        execute_put(&executor, store, &documents, fts_supported, strip_unicode).await?;
        if fetched < batch_size {
            break;
        }
        offset += fetched;
    }

    conn.execute(&format!("DROP TABLE temp_{}", store.name), ())
        .await?;
    Ok(())
}

/// Rebuilds only the main table, copying the surviving columns across in a
/// single statement. Used when column indexes were dropped but nothing needs
/// backfilling.
async fn in_place_store_migration(
    conn: &Connection,
    store: &StoreSchema,
    removed_column: &[&IndexMetadata],
    on_disk_columns: &HashSet<String>,
    fts_supported: bool,
) -> Result<(), StoreError> {
    for meta in removed_column {
        conn.execute(
            &format!(
                "DROP INDEX IF EXISTS {}",
                column_sql_index_name(&store.name, &meta.index.name)
            ),
            (),
        )
        .await?;
        delete_index_meta(conn, &meta.key).await?;
    }

    // Only columns present on the old table can be copied across; a column
    // index added in the same migration gets its column via ALTER TABLE
    // afterwards.
    let surviving: Vec<&IndexSchema> = column_indexes(store, fts_supported)
        .into_iter()
        .filter(|index| on_disk_columns.contains(&index_column_name(index)))
        .collect();
    for index in &surviving {
        conn.execute(
            &format!(
                "DROP INDEX IF EXISTS {}",
                column_sql_index_name(&store.name, &index.name)
            ),
            (),
        )
        .await?;
    }

    conn.execute(&format!("DROP TABLE IF EXISTS temp_{}", store.name), ())
        .await?;
    conn.execute(
        &format!("ALTER TABLE {} RENAME TO temp_{}", store.name, store.name),
        (),
    )
    .await?;

    let mut definitions = vec!["nsp_pk TEXT PRIMARY KEY".to_string(), "nsp_data TEXT".to_string()];
    definitions.extend(
        surviving
            .iter()
            .map(|index| format!("{} TEXT", index_column_name(index))),
    );
    conn.execute(
        &format!("CREATE TABLE {} ({})", store.name, definitions.join(", ")),
        (),
    )
    .await?;

    let mut column_list = vec!["nsp_pk".to_string(), "nsp_data".to_string()];
    column_list.extend(surviving.iter().map(|index| index_column_name(index)));
    let column_list = column_list.join(", ");
    conn.execute(
        &format!(
            "INSERT INTO {} ({column_list}) SELECT {column_list} FROM temp_{}",
            store.name, store.name
        ),
        (),
    )
    .await?;
    conn.execute(&format!("DROP TABLE temp_{}", store.name), ())
        .await?;

    for index in &surviving {
        create_column_sql_index(conn, store, index).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use libsql::Builder;
    use serde_json::json;

    use docstore_common::schema::StoreSchema;

    use super::*;

    async fn memory_conn() -> (libsql::Database, Connection) {
        let db = Builder::new_local(":memory:")
            .build()
            .await
            .expect("build database");
        let conn = db.connect().expect("connect");
        (db, conn)
    }

    fn v1_schema() -> DbSchema {
        DbSchema::new(1, vec![StoreSchema::new("test", "id")])
    }

    fn v2_schema(do_not_backfill: bool) -> DbSchema {
        let mut index = IndexSchema::new("ind1", "tt");
        index.do_not_backfill = do_not_backfill;
        DbSchema::new(2, vec![StoreSchema::new("test", "id").with_index(index)])
    }

    #[tokio::test]
    async fn migration_is_idempotent() {
        let (_db, conn) = memory_conn().await;
        migrate_database(&conn, &v1_schema(), false, false, false)
            .await
            .expect("first migration");
        migrate_database(&conn, &v1_schema(), false, false, false)
            .await
            .expect("second migration");
        assert_eq!(read_schema_version(&conn).await.expect("version"), 1);
    }

    #[tokio::test]
    async fn older_on_disk_version_is_rejected_without_wipe() {
        let (_db, conn) = memory_conn().await;
        migrate_database(&conn, &v2_schema(false), false, false, false)
            .await
            .expect("create at v2");
        let result = migrate_database(&conn, &v1_schema(), false, false, false).await;
        assert!(matches!(result, Err(StoreError::SchemaTooNew { .. })));
    }

    #[tokio::test]
    async fn upgrade_backfills_new_column_index() {
        let (_db, conn) = memory_conn().await;
        migrate_database(&conn, &v1_schema(), false, false, false)
            .await
            .expect("create at v1");
        let store = v1_schema().stores.remove(0);
        execute_put(
            &SqlExecutor::Connection(&conn),
            &store,
            &[json!({"id": "abc", "tt": "a"})],
            false,
            false,
        )
        .await
        .expect("seed row");

        migrate_database(&conn, &v2_schema(false), false, false, false)
            .await
            .expect("upgrade to v2");

        let mut rows = conn
            .query("SELECT nsp_i_ind1 FROM test WHERE nsp_pk = 'Cabc'", ())
            .await
            .expect("query");
        let row = rows.next().await.expect("row").expect("present");
        assert_eq!(row.get_value(0).expect("value"), Value::Text("Ca".to_string()));
    }

    #[tokio::test]
    async fn do_not_backfill_index_leaves_existing_rows_unindexed() {
        let (_db, conn) = memory_conn().await;
        migrate_database(&conn, &v1_schema(), false, false, false)
            .await
            .expect("create at v1");
        let store = v1_schema().stores.remove(0);
        execute_put(
            &SqlExecutor::Connection(&conn),
            &store,
            &[json!({"id": "abc", "tt": "a"})],
            false,
            false,
        )
        .await
        .expect("seed row");

        migrate_database(&conn, &v2_schema(true), false, false, false)
            .await
            .expect("upgrade to v2");

        let mut rows = conn
            .query("SELECT nsp_i_ind1 FROM test WHERE nsp_pk = 'Cabc'", ())
            .await
            .expect("query");
        let row = rows.next().await.expect("row").expect("present");
        assert_eq!(row.get_value(0).expect("value"), Value::Null);
    }

    async fn stored_document(conn: &Connection, pk: &str) -> serde_json::Value {
        let mut rows = conn
            .query(
                "SELECT nsp_data FROM test WHERE nsp_pk = ?",
                vec![Value::Text(pk.to_string())],
            )
            .await
            .expect("query");
        let row = rows.next().await.expect("row").expect("present");
        match row.get_value(0).expect("value") {
            Value::Text(text) => serde_json::from_str(&text).expect("stored json"),
            other => panic!("unexpected nsp_data value: {other:?}"),
        }
    }

    #[tokio::test]
    async fn removing_a_column_index_migrates_in_place() {
        let (_db, conn) = memory_conn().await;
        migrate_database(&conn, &v2_schema(false), false, false, false)
            .await
            .expect("create at v2");
        let store = v2_schema(false).stores.remove(0);
        execute_put(
            &SqlExecutor::Connection(&conn),
            &store,
            &[json!({"id": "abc", "tt": "a"})],
            false,
            false,
        )
        .await
        .expect("seed row");

        let v3 = DbSchema::new(3, vec![StoreSchema::new("test", "id")]);
        migrate_database(&conn, &v3, false, false, false)
            .await
            .expect("upgrade to v3");

        let columns = read_table_columns(&conn, "test").await.expect("columns");
        assert!(!columns.contains("nsp_i_ind1"));
        assert!(
            read_index_metadata(&conn)
                .await
                .expect("metas")
                .is_empty()
        );
        assert_eq!(
            stored_document(&conn, "Cabc").await,
            json!({"id": "abc", "tt": "a"})
        );
    }

    #[tokio::test]
    async fn dropping_and_adding_no_backfill_indexes_in_one_migration() {
        let (_db, conn) = memory_conn().await;
        migrate_database(&conn, &v2_schema(false), false, false, false)
            .await
            .expect("create at v2");
        let store = v2_schema(false).stores.remove(0);
        execute_put(
            &SqlExecutor::Connection(&conn),
            &store,
            &[json!({"id": "abc", "tt": "a"})],
            false,
            false,
        )
        .await
        .expect("seed row");

        let mut column_index = IndexSchema::new("ind2", "uu");
        column_index.do_not_backfill = true;
        let mut pivot_index = IndexSchema::new("me1", "k.k");
        pivot_index.multi_entry = true;
        pivot_index.do_not_backfill = true;
        let v3 = DbSchema::new(
            3,
            vec![
                StoreSchema::new("test", "id")
                    .with_index(column_index)
                    .with_index(pivot_index),
            ],
        );
        migrate_database(&conn, &v3, false, false, false)
            .await
            .expect("upgrade to v3");

        let columns = read_table_columns(&conn, "test").await.expect("columns");
        assert!(columns.contains("nsp_i_ind2"));
        assert!(!columns.contains("nsp_i_ind1"));
        assert!(
            read_table_names(&conn)
                .await
                .expect("tables")
                .contains("test_me1")
        );

        // The surviving row came across without an entry in the new column
        let mut rows = conn
            .query("SELECT nsp_i_ind2 FROM test WHERE nsp_pk = 'Cabc'", ())
            .await
            .expect("query");
        let row = rows.next().await.expect("row").expect("present");
        assert_eq!(row.get_value(0).expect("value"), Value::Null);
        assert_eq!(
            stored_document(&conn, "Cabc").await,
            json!({"id": "abc", "tt": "a"})
        );

        let meta_keys: HashSet<String> = read_index_metadata(&conn)
            .await
            .expect("metas")
            .into_iter()
            .map(|meta| meta.key)
            .collect();
        assert_eq!(
            meta_keys,
            HashSet::from(["test_ind2".to_string(), "test_me1".to_string()])
        );
    }
}
