//! SQL engine: relational mapping of documents and indexes.
//!
//! Each store is one table `(nsp_pk, nsp_data, nsp_i_<index> ...)`; multi
//! entry indexes (and full-text indexes when FTS3 is available) pivot into a
//! `<store>_<index>` side table keyed by `nsp_refpk`. All keys are stored in
//! their order-preserving serialized form, so range queries are plain
//! comparisons on TEXT columns.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use libsql::{Builder, Connection, Rows, Value, params::IntoParams};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use docstore_common::Document;
use docstore_common::fulltext::{
    FullTextTermResolution, break_and_normalize_search_phrase, get_full_text_index_words_for_item,
};
use docstore_common::keypath::{get_key_for_keypath, serialized_index_entries};
use docstore_common::keys::{Key, form_list_of_serialized_keys, serialize_key_to_string};
use docstore_common::schema::{DbSchema, IndexSchema, StoreSchema};

use crate::api::{IndexAccess, SortOrder, StoreAccess, StoreEngine, TransactionEngine};
use crate::error::StoreError;
use crate::store_db::sql_migration::migrate_database;

/// SQLite's default host-parameter ceiling.
pub(crate) const MAX_HOST_PARAMETERS: usize = 999;
/// Hard cap on the text length of any one statement.
pub(crate) const MAX_SQL_STATEMENT_LENGTH: usize = 1_000_000;
/// LIMIT/OFFSET values beyond this are clamped.
pub(crate) const MAX_ROW_LIMIT: u64 = 1 << 32;
/// Joins tokens in the full-text fallback column; assumed to never occur in
/// normalized tokens (they are alphanumeric).
pub(crate) const FULL_TEXT_JOIN_TOKEN: &str = "^$^";

/// ### SqlStoreEngine
/// - `read_conn`: connection used for read-only statements
/// - `write_conn`: connection used for writing, behind a mutex so only one
///   writer runs at a time; writing through the read connection surfaces
///   `database is locked` errors
pub struct SqlStoreEngine {
    path: String,
    read_conn: Connection,
    write_conn: Arc<Mutex<Connection>>,
    schema: Arc<DbSchema>,
    fts_supported: bool,
    requires_unicode_replacement: bool,
}

impl Debug for SqlStoreEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SqlStoreEngine")
    }
}

impl SqlStoreEngine {
    pub async fn open(
        path: &str,
        schema: DbSchema,
        wipe_if_exists: bool,
        requires_unicode_replacement: bool,
    ) -> Result<Self, StoreError> {
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|err| StoreError::BackendUnavailable(err.to_string()))?;
        let write_conn = db.connect()?;
        // From libsql documentation:
        // Newly created connections currently have a default busy timeout of
        // 5000ms, but this may be subject to change.
        write_conn.busy_timeout(Duration::from_millis(5000))?;
        // WAL keeps readers from blocking the writer and vice versa.
        write_conn.query("PRAGMA journal_mode=WAL;", ()).await?;

        let fts_supported = probe_full_text_support(&write_conn).await;
        debug!(fts_supported, "opening sql store at {path}");
        migrate_database(
            &write_conn,
            &schema,
            fts_supported,
            wipe_if_exists,
            requires_unicode_replacement,
        )
        .await?;

        Ok(SqlStoreEngine {
            path: path.to_string(),
            read_conn: db.connect()?,
            write_conn: Arc::new(Mutex::new(write_conn)),
            schema: Arc::new(schema),
            fts_supported,
            requires_unicode_replacement,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// FTS3 module availability differs per build of the underlying library;
/// probing with a throwaway virtual table is the reliable detection.
async fn probe_full_text_support(conn: &Connection) -> bool {
    let created = conn
        .execute(
            "CREATE VIRTUAL TABLE IF NOT EXISTS nsp_fts_probe USING fts3 (nsp_content TEXT)",
            (),
        )
        .await
        .is_ok();
    if created {
        let _ = conn.execute("DROP TABLE IF EXISTS nsp_fts_probe", ()).await;
    }
    created
}

#[async_trait::async_trait]
impl StoreEngine for SqlStoreEngine {
    async fn begin_transaction(
        &self,
        store_names: &[String],
        write_needed: bool,
    ) -> Result<Box<dyn TransactionEngine>, StoreError> {
        for name in store_names {
            if self.schema.store(name).is_none() {
                return Err(StoreError::StoreNotFound(name.clone()));
            }
        }
        let write = if write_needed {
            let guard = self.write_conn.clone().lock_owned().await;
            let tx = guard.transaction().await?;
            Some(WriteState { tx, _guard: guard })
        } else {
            None
        };
        Ok(Box::new(SqlTransaction {
            schema: self.schema.clone(),
            store_names: store_names.to_vec(),
            read_conn: self.read_conn.clone(),
            fts_supported: self.fts_supported,
            requires_unicode_replacement: self.requires_unicode_replacement,
            write,
        }))
    }

    async fn close(&self) -> Result<(), StoreError> {
        // Connections close when the engine is dropped.
        Ok(())
    }

    async fn delete_database(&self) -> Result<(), StoreError> {
        let conn = self.write_conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table'",
                (),
            )
            .await?;
        let mut tables = Vec::new();
        while let Some(row) = rows.next().await? {
            let name = read_row_text(&row, 0)?;
            if !name.starts_with("sqlite_") {
                tables.push(name);
            }
        }
        for table in tables {
            conn.execute(&format!("DROP TABLE IF EXISTS {table}"), ())
                .await?;
        }
        Ok(())
    }
}

struct WriteState {
    tx: libsql::Transaction,
    _guard: OwnedMutexGuard<Connection>,
}

/// Dispatches statements either at a plain connection (reads, migration) or
/// inside an open SQL transaction (writes).
pub(crate) enum SqlExecutor<'a> {
    Connection(&'a Connection),
    Transaction(&'a libsql::Transaction),
}

impl SqlExecutor<'_> {
    pub(crate) async fn query(
        &self,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<Rows, libsql::Error> {
        match self {
            SqlExecutor::Connection(conn) => conn.query(sql, params).await,
            SqlExecutor::Transaction(tx) => tx.query(sql, params).await,
        }
    }

    pub(crate) async fn execute(
        &self,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<u64, libsql::Error> {
        match self {
            SqlExecutor::Connection(conn) => conn.execute(sql, params).await,
            SqlExecutor::Transaction(tx) => tx.execute(sql, params).await,
        }
    }
}

struct SqlTransaction {
    schema: Arc<DbSchema>,
    store_names: Vec<String>,
    read_conn: Connection,
    fts_supported: bool,
    requires_unicode_replacement: bool,
    write: Option<WriteState>,
}

impl SqlTransaction {
    fn executor(&self) -> SqlExecutor<'_> {
        match &self.write {
            Some(write) => SqlExecutor::Transaction(&write.tx),
            None => SqlExecutor::Connection(&self.read_conn),
        }
    }

    fn require_write(&self) -> Result<(), StoreError> {
        if self.write.is_some() {
            Ok(())
        } else {
            Err(StoreError::Custom(
                "write operation on a read-only transaction".to_string(),
            ))
        }
    }
}

#[async_trait::async_trait]
impl TransactionEngine for SqlTransaction {
    fn store(&self, store_name: &str) -> Result<Box<dyn StoreAccess + '_>, StoreError> {
        let store_schema = self
            .schema
            .store(store_name)
            .ok_or_else(|| StoreError::StoreNotFound(store_name.to_string()))?;
        if !self.store_names.iter().any(|name| name == store_name) {
            return Err(StoreError::Custom(format!(
                "store {store_name} is not part of this transaction"
            )));
        }
        Ok(Box::new(SqlStoreAccess {
            txn: self,
            store_schema,
        }))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        if let Some(write) = this.write {
            write.tx.commit().await?;
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        if let Some(write) = this.write {
            write.tx.rollback().await?;
        }
        Ok(())
    }
}

pub(crate) fn is_separate_table_index(index: &IndexSchema, fts_supported: bool) -> bool {
    index.multi_entry || (index.full_text && fts_supported)
}

pub(crate) fn separate_table_name(store: &StoreSchema, index: &IndexSchema) -> String {
    format!("{}_{}", store.name, index.name)
}

pub(crate) fn index_column_name(index: &IndexSchema) -> String {
    format!("nsp_i_{}", index.name)
}

pub(crate) fn column_indexes<'s>(
    store: &'s StoreSchema,
    fts_supported: bool,
) -> Vec<&'s IndexSchema> {
    store
        .indexes
        .iter()
        .filter(|index| !is_separate_table_index(index, fts_supported))
        .collect()
}

pub(crate) fn separate_table_indexes<'s>(
    store: &'s StoreSchema,
    fts_supported: bool,
) -> Vec<&'s IndexSchema> {
    store
        .indexes
        .iter()
        .filter(|index| is_separate_table_index(index, fts_supported))
        .collect()
}

/// JSON for the `nsp_data` column. U+2028/U+2029 are stripped when the host
/// platform cannot store them (`requires_unicode_replacement`).
pub(crate) fn serialize_document(
    doc: &Document,
    strip_unicode: bool,
) -> Result<String, StoreError> {
    let mut text = serde_json::to_string(doc)?;
    if strip_unicode {
        text = text.replace(['\u{2028}', '\u{2029}'], "");
    }
    Ok(text)
}

/// Value of a column-based index for one document; NULL when the key path
/// does not resolve.
fn index_column_value(
    index: &IndexSchema,
    doc: &Document,
    fts_supported: bool,
) -> Result<Option<String>, StoreError> {
    if index.full_text && !fts_supported {
        let words = get_full_text_index_words_for_item(&index.key_path, doc);
        if words.is_empty() {
            return Ok(None);
        }
        return Ok(Some(format!(
            "{FULL_TEXT_JOIN_TOKEN}{}",
            words.join(FULL_TEXT_JOIN_TOKEN)
        )));
    }
    match get_key_for_keypath(doc, &index.key_path)? {
        None => Ok(None),
        Some(key) => Ok(Some(serialize_key_to_string(&key, &index.key_path)?)),
    }
}

struct SeparateRow {
    key: String,
    refpk: String,
    data: Option<String>,
}

/// The rows one document contributes to a pivot table.
fn separate_table_rows(
    index: &IndexSchema,
    doc: &Document,
    serialized_pk: &str,
    serialized_doc: &str,
) -> Result<Vec<SeparateRow>, StoreError> {
    if index.full_text {
        // FTS3 virtual table: one row holding the space-joined token set.
        let words = get_full_text_index_words_for_item(&index.key_path, doc);
        if words.is_empty() {
            return Ok(Vec::new());
        }
        return Ok(vec![SeparateRow {
            key: words.join(" "),
            refpk: serialized_pk.to_string(),
            data: None,
        }]);
    }
    let entries = serialized_index_entries(index, doc)?;
    Ok(entries
        .into_iter()
        .map(|entry| SeparateRow {
            key: entry,
            refpk: serialized_pk.to_string(),
            data: index
                .include_data_in_index
                .then(|| serialized_doc.to_string()),
        })
        .collect())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn text_params(keys: &[String]) -> Vec<Value> {
    keys.iter().map(|key| Value::Text(key.clone())).collect()
}

/// Splits a key list so each batch fits the host-parameter ceiling and keeps
/// the statement text under the length cap.
pub(crate) fn batch_keys(keys: &[String]) -> Vec<&[String]> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut bytes = 0usize;
    for (position, key) in keys.iter().enumerate() {
        let over_count = position - start >= MAX_HOST_PARAMETERS;
        let over_length = bytes + key.len() >= MAX_SQL_STATEMENT_LENGTH / 2;
        if position > start && (over_count || over_length) {
            batches.push(&keys[start..position]);
            start = position;
            bytes = 0;
        }
        bytes += key.len();
    }
    if start < keys.len() {
        batches.push(&keys[start..]);
    }
    batches
}

/// The shared write path: computes serialized keys and index values, deletes
/// superseded pivot rows, then inserts the replacement rows. Also used by
/// the migrator to re-put documents through normal index maintenance.
pub(crate) async fn execute_put(
    executor: &SqlExecutor<'_>,
    store: &StoreSchema,
    items: &[Document],
    fts_supported: bool,
    strip_unicode: bool,
) -> Result<(), StoreError> {
    if items.is_empty() {
        return Ok(());
    }
    let columns = column_indexes(store, fts_supported);
    let separates = separate_table_indexes(store, fts_supported);

    struct MainRow {
        pk: String,
        data: String,
        column_values: Vec<Option<String>>,
    }
    let mut main_rows = Vec::new();
    let mut pivot_rows: HashMap<String, Vec<SeparateRow>> = HashMap::new();
    for item in items {
        let key = get_key_for_keypath(item, &store.primary_key_path)?.ok_or_else(|| {
            StoreError::Custom(format!(
                "document has no primary key at {:?}",
                store.primary_key_path
            ))
        })?;
        let pk = serialize_key_to_string(&key, &store.primary_key_path)?;
        let data = serialize_document(item, strip_unicode)?;
        let column_values = columns
            .iter()
            .map(|index| index_column_value(index, item, fts_supported))
            .collect::<Result<Vec<_>, _>>()?;
        for index in &separates {
            pivot_rows
                .entry(separate_table_name(store, index))
                .or_default()
                .extend(separate_table_rows(index, item, &pk, &data)?);
        }
        main_rows.push(MainRow {
            pk,
            data,
            column_values,
        });
    }

    // Pivot entries are replaced wholesale: deletes must land before the
    // fresh inserts.
    let pks: Vec<String> = main_rows.iter().map(|row| row.pk.clone()).collect();
    for index in &separates {
        let table = separate_table_name(store, index);
        for batch in batch_keys(&pks) {
            executor
                .execute(
                    &format!(
                        "DELETE FROM {table} WHERE nsp_refpk IN ({})",
                        placeholders(batch.len())
                    ),
                    text_params(batch),
                )
                .await?;
        }
    }

    let fields_per_row = 2 + columns.len();
    let rows_per_batch = (MAX_HOST_PARAMETERS / fields_per_row).max(1);
    let mut column_names = vec!["nsp_pk".to_string(), "nsp_data".to_string()];
    column_names.extend(columns.iter().map(|index| index_column_name(index)));
    let row_group = format!("({})", placeholders(fields_per_row));
    for chunk in main_rows.chunks(rows_per_batch) {
        let groups = vec![row_group.as_str(); chunk.len()].join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES {groups}",
            store.name,
            column_names.join(", ")
        );
        let mut params = Vec::with_capacity(chunk.len() * fields_per_row);
        for row in chunk {
            params.push(Value::Text(row.pk.clone()));
            params.push(Value::Text(row.data.clone()));
            for value in &row.column_values {
                params.push(match value {
                    Some(text) => Value::Text(text.clone()),
                    None => Value::Null,
                });
            }
        }
        executor.execute(&sql, params).await?;
    }

    for index in &separates {
        let table = separate_table_name(store, index);
        let Some(rows) = pivot_rows.get(&table) else {
            continue;
        };
        let with_data = index.multi_entry && index.include_data_in_index;
        let fields = if with_data { 3 } else { 2 };
        let row_group = format!("({})", placeholders(fields));
        let column_list = if with_data {
            "nsp_key, nsp_refpk, nsp_data"
        } else {
            "nsp_key, nsp_refpk"
        };
        for chunk in rows.chunks((MAX_HOST_PARAMETERS / fields).max(1)) {
            let groups = vec![row_group.as_str(); chunk.len()].join(", ");
            let sql = format!("INSERT INTO {table} ({column_list}) VALUES {groups}");
            let mut params = Vec::with_capacity(chunk.len() * fields);
            for row in chunk {
                params.push(Value::Text(row.key.clone()));
                params.push(Value::Text(row.refpk.clone()));
                if with_data {
                    params.push(match &row.data {
                        Some(data) => Value::Text(data.clone()),
                        None => Value::Null,
                    });
                }
            }
            executor.execute(&sql, params).await?;
        }
    }
    Ok(())
}

pub(crate) async fn execute_remove(
    executor: &SqlExecutor<'_>,
    store: &StoreSchema,
    serialized_pks: &[String],
    fts_supported: bool,
) -> Result<(), StoreError> {
    if serialized_pks.is_empty() {
        return Ok(());
    }
    for index in separate_table_indexes(store, fts_supported) {
        let table = separate_table_name(store, index);
        for batch in batch_keys(serialized_pks) {
            executor
                .execute(
                    &format!(
                        "DELETE FROM {table} WHERE nsp_refpk IN ({})",
                        placeholders(batch.len())
                    ),
                    text_params(batch),
                )
                .await?;
        }
    }
    for batch in batch_keys(serialized_pks) {
        executor
            .execute(
                &format!(
                    "DELETE FROM {} WHERE nsp_pk IN ({})",
                    store.name,
                    placeholders(batch.len())
                ),
                text_params(batch),
            )
            .await?;
    }
    Ok(())
}

fn read_row_text(row: &libsql::Row, index: i32) -> Result<String, StoreError> {
    match row.get_value(index)? {
        Value::Text(text) => Ok(text),
        _ => Err(StoreError::Custom(
            "unexpected column type, expected TEXT".to_string(),
        )),
    }
}

fn read_row_count(row: &libsql::Row, index: i32) -> Result<u64, StoreError> {
    match row.get_value(index)? {
        Value::Integer(count) => u64::try_from(count)
            .map_err(|err| StoreError::Custom(format!("conversion error: {err}"))),
        _ => Err(StoreError::Custom(
            "unexpected column type, expected INTEGER".to_string(),
        )),
    }
}

async fn collect_documents(mut rows: Rows) -> Result<Vec<Document>, StoreError> {
    let mut docs = Vec::new();
    while let Some(row) = rows.next().await? {
        match row.get_value(0)? {
            Value::Text(text) => docs.push(serde_json::from_str(&text)?),
            // A pivot row whose document vanished mid-query.
            Value::Null => continue,
            _ => {
                return Err(StoreError::Custom(
                    "unexpected column type for document data".to_string(),
                ));
            }
        }
    }
    Ok(docs)
}

struct SqlStoreAccess<'t> {
    txn: &'t SqlTransaction,
    store_schema: &'t StoreSchema,
}

#[async_trait::async_trait]
impl StoreAccess for SqlStoreAccess<'_> {
    async fn get(&self, key: &Key) -> Result<Option<Document>, StoreError> {
        let pk = serialize_key_to_string(key, &self.store_schema.primary_key_path)?;
        let rows = self
            .txn
            .executor()
            .query(
                &format!(
                    "SELECT nsp_data FROM {} WHERE nsp_pk = ?",
                    self.store_schema.name
                ),
                vec![Value::Text(pk)],
            )
            .await?;
        Ok(collect_documents(rows).await?.into_iter().next())
    }

    async fn get_multiple(&self, keys: &[Key]) -> Result<Vec<Document>, StoreError> {
        let pks = form_list_of_serialized_keys(keys, &self.store_schema.primary_key_path)?;
        let mut docs = Vec::new();
        for batch in batch_keys(&pks) {
            let rows = self
                .txn
                .executor()
                .query(
                    &format!(
                        "SELECT nsp_data FROM {} WHERE nsp_pk IN ({})",
                        self.store_schema.name,
                        placeholders(batch.len())
                    ),
                    text_params(batch),
                )
                .await?;
            docs.extend(collect_documents(rows).await?);
        }
        Ok(docs)
    }

    async fn put(&self, items: &[Document]) -> Result<(), StoreError> {
        self.txn.require_write()?;
        execute_put(
            &self.txn.executor(),
            self.store_schema,
            items,
            self.txn.fts_supported,
            self.txn.requires_unicode_replacement,
        )
        .await
    }

    async fn remove(&self, keys: &[Key]) -> Result<(), StoreError> {
        self.txn.require_write()?;
        let pks = form_list_of_serialized_keys(keys, &self.store_schema.primary_key_path)?;
        execute_remove(
            &self.txn.executor(),
            self.store_schema,
            &pks,
            self.txn.fts_supported,
        )
        .await
    }

    async fn clear_all_data(&self) -> Result<(), StoreError> {
        self.txn.require_write()?;
        let executor = self.txn.executor();
        for index in separate_table_indexes(self.store_schema, self.txn.fts_supported) {
            executor
                .execute(
                    &format!(
                        "DELETE FROM {}",
                        separate_table_name(self.store_schema, index)
                    ),
                    (),
                )
                .await?;
        }
        executor
            .execute(&format!("DELETE FROM {}", self.store_schema.name), ())
            .await?;
        Ok(())
    }

    fn open_index(&self, index_name: &str) -> Result<Box<dyn IndexAccess + '_>, StoreError> {
        let index = self.store_schema.index(index_name).ok_or_else(|| {
            StoreError::IndexNotFound(self.store_schema.name.clone(), index_name.to_string())
        })?;
        Ok(Box::new(SqlIndexAccess {
            txn: self.txn,
            store_schema: self.store_schema,
            index: Some(index),
        }))
    }

    fn open_primary_key(&self) -> Result<Box<dyn IndexAccess + '_>, StoreError> {
        Ok(Box::new(SqlIndexAccess {
            txn: self.txn,
            store_schema: self.store_schema,
            index: None,
        }))
    }
}

struct SqlIndexAccess<'t> {
    txn: &'t SqlTransaction,
    store_schema: &'t StoreSchema,
    /// `None` queries the primary key.
    index: Option<&'t IndexSchema>,
}

struct QueryView {
    table: String,
    key_column: String,
    data_column: String,
}

impl SqlIndexAccess<'_> {
    fn key_path(&self) -> &docstore_common::schema::KeyPath {
        match self.index {
            Some(index) => &index.key_path,
            None => &self.store_schema.primary_key_path,
        }
    }

    /// Table / column selection per index kind: pivot tables join back to
    /// the main table unless they carry the data themselves.
    fn view(&self) -> QueryView {
        let store = &self.store_schema.name;
        match self.index {
            None => QueryView {
                table: store.clone(),
                key_column: "nsp_pk".to_string(),
                data_column: "nsp_data".to_string(),
            },
            Some(index) if is_separate_table_index(index, self.txn.fts_supported) => {
                if index.multi_entry && index.include_data_in_index {
                    QueryView {
                        table: separate_table_name(self.store_schema, index),
                        key_column: "nsp_key".to_string(),
                        data_column: "nsp_data".to_string(),
                    }
                } else {
                    QueryView {
                        table: format!(
                            "{} mi LEFT JOIN {store} ON mi.nsp_refpk = {store}.nsp_pk",
                            separate_table_name(self.store_schema, index)
                        ),
                        key_column: "mi.nsp_key".to_string(),
                        data_column: format!("{store}.nsp_data"),
                    }
                }
            }
            Some(index) => QueryView {
                table: store.clone(),
                key_column: index_column_name(index),
                data_column: "nsp_data".to_string(),
            },
        }
    }

    fn paging_clause(sort_column: Option<(&str, SortOrder)>, limit: Option<u64>, offset: Option<u64>) -> String {
        let mut clause = String::new();
        if let Some((column, sort)) = sort_column {
            match sort {
                SortOrder::Forward => clause.push_str(&format!(" ORDER BY {column} ASC")),
                SortOrder::Reverse => clause.push_str(&format!(" ORDER BY {column} DESC")),
                SortOrder::None => {}
            }
        }
        match (limit, offset) {
            (Some(limit), Some(offset)) => clause.push_str(&format!(
                " LIMIT {} OFFSET {}",
                limit.min(MAX_ROW_LIMIT),
                offset.min(MAX_ROW_LIMIT)
            )),
            (Some(limit), None) => {
                clause.push_str(&format!(" LIMIT {}", limit.min(MAX_ROW_LIMIT)))
            }
            (None, Some(offset)) => clause.push_str(&format!(
                " LIMIT -1 OFFSET {}",
                offset.min(MAX_ROW_LIMIT)
            )),
            (None, None) => {}
        }
        clause
    }

    async fn query_range(
        &self,
        key_low: &Key,
        key_high: &Key,
        low_exclusive: bool,
        high_exclusive: bool,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
        count_only: bool,
    ) -> Result<(Option<u64>, Vec<Document>), StoreError> {
        let low = serialize_key_to_string(key_low, self.key_path())?;
        let high = serialize_key_to_string(key_high, self.key_path())?;
        let view = self.view();
        let select = if count_only {
            "COUNT(*)".to_string()
        } else {
            view.data_column.clone()
        };
        let sql = format!(
            "SELECT {select} FROM {} WHERE {key} {low_op} ? AND {key} {high_op} ?{paging}",
            view.table,
            key = view.key_column,
            low_op = if low_exclusive { ">" } else { ">=" },
            high_op = if high_exclusive { "<" } else { "<=" },
            paging = Self::paging_clause(
                (!count_only).then_some((view.key_column.as_str(), sort)),
                limit,
                offset
            ),
        );
        let rows = self
            .txn
            .executor()
            .query(&sql, vec![Value::Text(low), Value::Text(high)])
            .await?;
        if count_only {
            let mut rows = rows;
            let count = match rows.next().await? {
                Some(row) => read_row_count(&row, 0)?,
                None => 0,
            };
            Ok((Some(count), Vec::new()))
        } else {
            Ok((None, collect_documents(rows).await?))
        }
    }
}

#[async_trait::async_trait]
impl IndexAccess for SqlIndexAccess<'_> {
    async fn get_all(
        &self,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        let view = self.view();
        let sql = format!(
            "SELECT {} FROM {}{}",
            view.data_column,
            view.table,
            Self::paging_clause(Some((view.key_column.as_str(), sort)), limit, offset),
        );
        let rows = self.txn.executor().query(&sql, ()).await?;
        collect_documents(rows).await
    }

    async fn get_only(
        &self,
        key: &Key,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.get_range(key, key, false, false, sort, limit, offset)
            .await
    }

    async fn get_range(
        &self,
        key_low: &Key,
        key_high: &Key,
        low_exclusive: bool,
        high_exclusive: bool,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        let (_, docs) = self
            .query_range(
                key_low,
                key_high,
                low_exclusive,
                high_exclusive,
                sort,
                limit,
                offset,
                false,
            )
            .await?;
        Ok(docs)
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        let view = self.view();
        let mut rows = self
            .txn
            .executor()
            .query(&format!("SELECT COUNT(*) FROM {}", view.table), ())
            .await?;
        match rows.next().await? {
            Some(row) => read_row_count(&row, 0),
            None => Ok(0),
        }
    }

    async fn count_only(&self, key: &Key) -> Result<u64, StoreError> {
        self.count_range(key, key, false, false).await
    }

    async fn count_range(
        &self,
        key_low: &Key,
        key_high: &Key,
        low_exclusive: bool,
        high_exclusive: bool,
    ) -> Result<u64, StoreError> {
        let (count, _) = self
            .query_range(
                key_low,
                key_high,
                low_exclusive,
                high_exclusive,
                SortOrder::None,
                None,
                None,
                true,
            )
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn full_text_search(
        &self,
        search_phrase: &str,
        resolution: FullTextTermResolution,
        limit: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        let Some(index) = self.index.filter(|index| index.full_text) else {
            return Err(StoreError::Custom(
                "full text search requires a full-text index".to_string(),
            ));
        };
        let terms = break_and_normalize_search_phrase(search_phrase);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let store = &self.store_schema.name;
        let limit_clause = Self::paging_clause(None, limit, None);

        let (sql, params) = if self.txn.fts_supported {
            let table = separate_table_name(self.store_schema, index);
            match resolution {
                FullTextTermResolution::And => {
                    let match_expr = terms
                        .iter()
                        .map(|term| format!("{term}*"))
                        .collect::<Vec<_>>()
                        .join(" ");
                    (
                        format!(
                            "SELECT {store}.nsp_data FROM {table} fti LEFT JOIN {store} \
                             ON fti.nsp_refpk = {store}.nsp_pk WHERE fti.nsp_key MATCH ?{limit_clause}"
                        ),
                        vec![Value::Text(match_expr)],
                    )
                }
                FullTextTermResolution::Or => {
                    let union = terms
                        .iter()
                        .map(|_| format!("SELECT nsp_refpk FROM {table} WHERE nsp_key MATCH ?"))
                        .collect::<Vec<_>>()
                        .join(" UNION ");
                    (
                        format!(
                            "SELECT {store}.nsp_data FROM ({union}) matches LEFT JOIN {store} \
                             ON matches.nsp_refpk = {store}.nsp_pk{limit_clause}"
                        ),
                        terms
                            .iter()
                            .map(|term| Value::Text(format!("{term}*")))
                            .collect(),
                    )
                }
            }
        } else {
            let column = index_column_name(index);
            let joiner = match resolution {
                FullTextTermResolution::And => " AND ",
                FullTextTermResolution::Or => " OR ",
            };
            let predicate = terms
                .iter()
                .map(|_| format!("{column} LIKE ?"))
                .collect::<Vec<_>>()
                .join(joiner);
            (
                format!("SELECT nsp_data FROM {store} WHERE {predicate}{limit_clause}"),
                terms
                    .iter()
                    .map(|term| Value::Text(format!("%{FULL_TEXT_JOIN_TOKEN}{term}%")))
                    .collect(),
            )
        };
        let rows = self.txn.executor().query(&sql, params).await?;
        collect_documents(rows).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use docstore_common::schema::StoreSchema;

    use super::*;

    fn test_schema() -> DbSchema {
        let column_index = IndexSchema::new("ind1", "tt");
        let mut multi_entry = IndexSchema::new("key", "k.k");
        multi_entry.multi_entry = true;
        DbSchema::new(
            1,
            vec![
                StoreSchema::new("test", "id")
                    .with_index(column_index)
                    .with_index(multi_entry),
            ],
        )
    }

    #[tokio::test]
    async fn creates_expected_tables_and_columns() -> anyhow::Result<()> {
        let engine = SqlStoreEngine::open(":memory:", test_schema(), false, false).await?;
        let conn = engine.write_conn.lock().await;

        let mut main_columns = Vec::new();
        let mut rows = conn.query("PRAGMA table_info(test)", ()).await?;
        while let Some(row) = rows.next().await? {
            main_columns.push(row.get_str(1)?.to_string());
        }
        assert_eq!(main_columns, vec!["nsp_pk", "nsp_data", "nsp_i_ind1"]);

        let mut pivot_columns = Vec::new();
        let mut rows = conn.query("PRAGMA table_info(test_key)", ()).await?;
        while let Some(row) = rows.next().await? {
            pivot_columns.push(row.get_str(1)?.to_string());
        }
        assert_eq!(pivot_columns, vec!["nsp_key", "nsp_refpk"]);
        Ok(())
    }

    #[tokio::test]
    async fn batches_split_on_host_parameter_ceiling() {
        let keys: Vec<String> = (0..2500).map(|i| format!("C{i}")).collect();
        let batches = batch_keys(&keys);
        assert!(batches.len() >= 3);
        assert!(batches.iter().all(|batch| batch.len() <= MAX_HOST_PARAMETERS));
        let total: usize = batches.iter().map(|batch| batch.len()).sum();
        assert_eq!(total, keys.len());
    }

    #[tokio::test]
    async fn put_and_read_back_through_a_transaction() -> anyhow::Result<()> {
        let engine = SqlStoreEngine::open(":memory:", test_schema(), false, false).await?;
        let names = vec!["test".to_string()];

        let txn = engine.begin_transaction(&names, true).await?;
        txn.store("test")?
            .put(&[json!({"id": "abc", "tt": "a", "k": {"k": ["w", "x"]}})])
            .await?;
        txn.commit().await?;

        let txn = engine.begin_transaction(&names, true).await?;
        let doc = txn.store("test")?.get(&Key::from("abc")).await?;
        assert_eq!(doc, Some(json!({"id": "abc", "tt": "a", "k": {"k": ["w", "x"]}})));
        txn.commit().await?;
        Ok(())
    }
}
