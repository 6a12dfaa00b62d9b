use std::fs;

use serde_json::json;

use docstore::{
    DbSchema, EngineType, FullTextTermResolution, IndexSchema, Key, Provider, ProviderOptions,
    SortOrder, StoreSchema, TransactionStatus,
};

#[tokio::test]
async fn test_in_memory_store() {
    test_store_suite(EngineType::InMemory).await;
}

#[tokio::test]
async fn test_sql_store() {
    test_store_suite(EngineType::Sql).await;
}

// Creates an empty store, runs the test and then removes the store (if needed)
async fn run_test<F, Fut>(schema: DbSchema, test_func: F, engine_type: EngineType)
where
    F: FnOnce(Provider) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let nonce: u64 = rand::random();
    let path = format!("docstore-test-db-{nonce}");
    // Remove preexistent DBs in case of a failed previous test
    if !matches!(engine_type, EngineType::InMemory) {
        remove_test_dbs(&path);
    }
    let provider = Provider::open(&path, engine_type, schema, false, ProviderOptions::default())
        .await
        .expect("Failed to create test db");
    test_func(provider).await;
    if !matches!(engine_type, EngineType::InMemory) {
        remove_test_dbs(&path);
    }
}

fn remove_test_dbs(path: &str) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = fs::remove_file(format!("{path}{suffix}"));
    }
}

async fn test_store_suite(engine_type: EngineType) {
    run_test(basic_schema(), test_basic_crud, engine_type).await;
    run_test(basic_schema(), test_counts_match_ranges, engine_type).await;
    run_test(basic_schema(), test_reverse_order, engine_type).await;
    run_test(numeric_schema(), test_numeric_keys, engine_type).await;
    run_test(compound_schema(), test_compound_primary_keys, engine_type).await;
    run_test(multi_entry_schema(), test_multi_entry_index, engine_type).await;
    run_test(fts_schema(), test_full_text_search, engine_type).await;
    run_test(basic_schema(), test_write_locks_serialize, engine_type).await;
    run_test(basic_schema(), test_abort_discards_writes, engine_type).await;
}

fn basic_schema() -> DbSchema {
    DbSchema::new(
        1,
        vec![StoreSchema::new("test", "id").with_index(IndexSchema::new("ind1", "tt"))],
    )
}

fn numeric_schema() -> DbSchema {
    DbSchema::new(1, vec![StoreSchema::new("test", "n")])
}

fn compound_schema() -> DbSchema {
    DbSchema::new(1, vec![StoreSchema::new("test", vec!["a", "b"])])
}

fn multi_entry_schema() -> DbSchema {
    let mut index = IndexSchema::new("key", "k.k");
    index.multi_entry = true;
    DbSchema::new(1, vec![StoreSchema::new("test", "id").with_index(index)])
}

fn fts_schema() -> DbSchema {
    let mut index = IndexSchema::new("i", "txt");
    index.full_text = true;
    DbSchema::new(1, vec![StoreSchema::new("test", "id").with_index(index)])
}

async fn test_basic_crud(provider: Provider) {
    provider
        .put(
            "test",
            &[
                json!({"id": "a", "tt": "x", "val": "val-a"}),
                json!({"id": "b", "tt": "y", "val": "val-b"}),
            ],
        )
        .await
        .expect("put");

    let doc = provider.get("test", "a").await.expect("get");
    assert_eq!(doc, Some(json!({"id": "a", "tt": "x", "val": "val-a"})));
    assert_eq!(provider.get("test", "missing").await.expect("get"), None);

    let docs = provider
        .get_multiple("test", &[Key::from("a"), Key::from("b"), Key::from("zz")])
        .await
        .expect("get_multiple");
    assert_eq!(docs.len(), 2);

    // put is idempotent with respect to the primary key
    provider
        .put("test", &[json!({"id": "a", "tt": "x", "val": "val-a2"})])
        .await
        .expect("second put");
    assert_eq!(provider.count_all("test", None).await.expect("count"), 2);
    let doc = provider.get("test", "a").await.expect("get");
    assert_eq!(doc, Some(json!({"id": "a", "tt": "x", "val": "val-a2"})));

    provider
        .remove("test", &[Key::from("a")])
        .await
        .expect("remove");
    assert_eq!(provider.get("test", "a").await.expect("get"), None);
    assert_eq!(provider.count_all("test", None).await.expect("count"), 1);

    provider.clear_all_data("test").await.expect("clear");
    assert_eq!(provider.count_all("test", None).await.expect("count"), 0);
}

async fn test_counts_match_ranges(provider: Provider) {
    let items: Vec<_> = ["a", "b", "c", "d", "e"]
        .iter()
        .map(|id| json!({"id": id, "tt": format!("t-{id}")}))
        .collect();
    provider.put("test", &items).await.expect("put");

    let in_range = provider
        .get_range("test", None, "b", "d", false, false, SortOrder::None, None, None)
        .await
        .expect("get_range");
    assert_eq!(in_range.len(), 3);
    let counted = provider
        .count_range("test", None, "b", "d", false, false)
        .await
        .expect("count_range");
    assert_eq!(counted, in_range.len() as u64);

    let exclusive = provider
        .get_range("test", None, "b", "d", true, true, SortOrder::None, None, None)
        .await
        .expect("get_range exclusive");
    assert_eq!(exclusive, vec![json!({"id": "c", "tt": "t-c"})]);

    // get_only(k) behaves exactly like get_range(k, k, false, false)
    let only = provider
        .get_only("test", Some("ind1"), "t-c", SortOrder::None, None, None)
        .await
        .expect("get_only");
    let range = provider
        .get_range(
            "test",
            Some("ind1"),
            "t-c",
            "t-c",
            false,
            false,
            SortOrder::None,
            None,
            None,
        )
        .await
        .expect("get_range");
    assert_eq!(only, range);
    assert_eq!(
        provider
            .count_only("test", Some("ind1"), "t-c")
            .await
            .expect("count_only"),
        1
    );
}

async fn test_reverse_order(provider: Provider) {
    let items: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|id| json!({"id": id, "tt": id}))
        .collect();
    provider.put("test", &items).await.expect("put");

    let reversed = provider
        .get_all("test", None, SortOrder::Reverse, None, None)
        .await
        .expect("get_all");
    let ids: Vec<_> = reversed
        .iter()
        .map(|doc| doc["id"].as_str().expect("id").to_string())
        .collect();
    assert_eq!(ids, vec!["c", "b", "a"]);

    let limited = provider
        .get_all("test", None, SortOrder::Forward, Some(2), Some(1))
        .await
        .expect("get_all paged");
    let ids: Vec<_> = limited
        .iter()
        .map(|doc| doc["id"].as_str().expect("id").to_string())
        .collect();
    assert_eq!(ids, vec!["b", "c"]);
}

async fn test_numeric_keys(provider: Provider) {
    let items: Vec<_> = [-10.0, -1.5, 0.0, 2.0, 10.0, 100.0]
        .iter()
        .map(|n| json!({"n": n}))
        .collect();
    provider.put("test", &items).await.expect("put");

    let in_range = provider
        .get_range("test", None, -1.5, 10.0, false, false, SortOrder::Forward, None, None)
        .await
        .expect("get_range");
    let ns: Vec<f64> = in_range
        .iter()
        .map(|doc| doc["n"].as_f64().expect("n"))
        .collect();
    assert_eq!(ns, vec![-1.5, 0.0, 2.0, 10.0]);

    let doc = provider.get("test", 2.0).await.expect("get");
    assert_eq!(doc, Some(json!({"n": 2.0})));
}

async fn test_compound_primary_keys(provider: Provider) {
    let items: Vec<_> = (1..=5)
        .map(|i| json!({"a": format!("indexa{i}"), "b": format!("indexb{i}"), "val": format!("val{i}")}))
        .collect();
    provider.put("test", &items).await.expect("put");

    let only = provider
        .get_only(
            "test",
            None,
            Key::compound(["indexa3", "indexb3"]),
            SortOrder::None,
            None,
            None,
        )
        .await
        .expect("get_only");
    assert_eq!(only.len(), 1);
    assert_eq!(only[0]["val"], json!("val3"));

    let in_range = provider
        .get_range(
            "test",
            None,
            Key::compound(["indexa2", "indexb2"]),
            Key::compound(["indexa4", "indexb3"]),
            false,
            false,
            SortOrder::Forward,
            None,
            None,
        )
        .await
        .expect("get_range");
    let vals: Vec<_> = in_range
        .iter()
        .map(|doc| doc["val"].as_str().expect("val").to_string())
        .collect();
    assert_eq!(vals, vec!["val2", "val3"]);
}

async fn test_multi_entry_index(provider: Provider) {
    provider
        .put(
            "test",
            &[json!({"id": "a", "val": "b", "k": {"k": ["w", "x", "y", "z"]}})],
        )
        .await
        .expect("put");

    let page = provider
        .get_all("test", Some("key"), SortOrder::Forward, Some(2), Some(1))
        .await
        .expect("get_all");
    assert_eq!(page.len(), 2);
    for doc in &page {
        assert_eq!(doc["val"], json!("b"));
    }
    assert_eq!(
        provider.count_all("test", Some("key")).await.expect("count"),
        4
    );

    // Replacing the document replaces its whole entry set
    provider
        .put("test", &[json!({"id": "a", "val": "b", "k": {"k": ["z"]}})])
        .await
        .expect("second put");
    let gone = provider
        .get_range(
            "test",
            Some("key"),
            "x",
            "y",
            false,
            false,
            SortOrder::None,
            None,
            None,
        )
        .await
        .expect("get_range");
    assert_eq!(gone.len(), 0);
    let still_there = provider
        .get_range(
            "test",
            Some("key"),
            "x",
            "z",
            false,
            false,
            SortOrder::None,
            None,
            None,
        )
        .await
        .expect("get_range");
    assert_eq!(still_there.len(), 1);
}

async fn test_full_text_search(provider: Provider) {
    provider
        .put(
            "test",
            &[
                json!({"id": "a1", "txt": "the quick brown fox jumps over the lzy dog"}),
                json!({"id": "a2", "txt": "bob likes his dog"}),
            ],
        )
        .await
        .expect("put");

    let both = provider
        .full_text_search("test", "i", "dog", FullTextTermResolution::And, None)
        .await
        .expect("search dog");
    assert_eq!(both.len(), 2);

    let typo = provider
        .full_text_search("test", "i", "lzy", FullTextTermResolution::And, None)
        .await
        .expect("search lzy");
    assert_eq!(typo.len(), 1);
    assert_eq!(typo[0]["id"], json!("a1"));

    let all_terms = provider
        .full_text_search("test", "i", "lzy dog", FullTextTermResolution::And, None)
        .await
        .expect("search lzy dog");
    assert_eq!(all_terms.len(), 1);
    assert_eq!(all_terms[0]["id"], json!("a1"));

    // "b" prefix-matches brown and bob; "z" matches nothing
    let either = provider
        .full_text_search("test", "i", "b z", FullTextTermResolution::Or, None)
        .await
        .expect("search b z");
    assert_eq!(either.len(), 2);

    // And results are always a subset of Or results
    let and_docs = provider
        .full_text_search("test", "i", "his dog", FullTextTermResolution::And, None)
        .await
        .expect("search and");
    let or_docs = provider
        .full_text_search("test", "i", "his dog", FullTextTermResolution::Or, None)
        .await
        .expect("search or");
    assert!(and_docs.len() <= or_docs.len());
    for doc in &and_docs {
        assert!(or_docs.contains(doc));
    }

    let empty = provider
        .full_text_search("test", "i", "  !! ", FullTextTermResolution::And, None)
        .await
        .expect("empty phrase");
    assert!(empty.is_empty());
}

async fn test_write_locks_serialize(provider: Provider) {
    let txn = provider
        .open_transaction(&["test"], true)
        .await
        .expect("first transaction");
    {
        let store = txn.get_store("test").expect("store");
        store
            .put(&[json!({"id": "abc", "a": "b", "tt": "t"})])
            .await
            .expect("put");
    }

    let concurrent = provider.clone();
    let second = tokio::spawn(async move {
        let txn = concurrent
            .open_transaction(&["test"], true)
            .await
            .expect("second transaction");
        let doc = {
            let store = txn.get_store("test").expect("store");
            store.get("abc").await.expect("get")
        };
        txn.commit().await.expect("commit");
        doc
    });

    // The second writer must stay parked until the first commits.
    tokio::task::yield_now().await;
    assert!(!second.is_finished());

    txn.commit().await.expect("commit first");
    let seen = second.await.expect("join");
    assert_eq!(seen, Some(json!({"id": "abc", "a": "b", "tt": "t"})));
}

async fn test_abort_discards_writes(provider: Provider) {
    provider
        .put("test", &[json!({"id": "kept", "tt": "old"})])
        .await
        .expect("seed");

    let txn = provider
        .open_transaction(&["test"], true)
        .await
        .expect("transaction");
    {
        let store = txn.get_store("test").expect("store");
        store
            .put(&[json!({"id": "discarded", "tt": "new"})])
            .await
            .expect("put");
    }
    let completion = txn.completion();
    txn.abort().await.expect("abort");
    assert_eq!(completion.wait().await, TransactionStatus::Aborted);

    assert_eq!(provider.get("test", "discarded").await.expect("get"), None);
    // Index state also rolls back
    let via_index = provider
        .get_only("test", Some("ind1"), "new", SortOrder::None, None, None)
        .await
        .expect("get_only");
    assert!(via_index.is_empty());
    let kept = provider
        .get_only("test", Some("ind1"), "old", SortOrder::None, None, None)
        .await
        .expect("get_only");
    assert_eq!(kept.len(), 1);
}

#[tokio::test]
async fn test_sql_schema_upgrade_backfills_new_index() {
    let nonce: u64 = rand::random();
    let path = format!("docstore-test-db-{nonce}");
    remove_test_dbs(&path);

    let v1 = DbSchema::new(1, vec![StoreSchema::new("test", "id")]);
    let provider = Provider::open(&path, EngineType::Sql, v1, false, ProviderOptions::default())
        .await
        .expect("open v1");
    provider
        .put("test", &[json!({"id": "abc", "tt": "a"})])
        .await
        .expect("put");
    provider.close().await.expect("close");
    drop(provider);

    let v2 = DbSchema::new(
        2,
        vec![StoreSchema::new("test", "id").with_index(IndexSchema::new("ind1", "tt"))],
    );
    let provider = Provider::open(&path, EngineType::Sql, v2, false, ProviderOptions::default())
        .await
        .expect("open v2");
    let docs = provider
        .get_only("test", Some("ind1"), "a", SortOrder::None, None, None)
        .await
        .expect("get_only");
    assert_eq!(docs, vec![json!({"id": "abc", "tt": "a"})]);

    remove_test_dbs(&path);
}

#[tokio::test]
async fn test_sql_schema_upgrade_without_backfill() {
    let nonce: u64 = rand::random();
    let path = format!("docstore-test-db-{nonce}");
    remove_test_dbs(&path);

    let v1 = DbSchema::new(1, vec![StoreSchema::new("test", "id")]);
    let provider = Provider::open(&path, EngineType::Sql, v1, false, ProviderOptions::default())
        .await
        .expect("open v1");
    provider
        .put("test", &[json!({"id": "abc", "tt": "a"})])
        .await
        .expect("put");
    provider.close().await.expect("close");
    drop(provider);

    let mut index = IndexSchema::new("ind1", "tt");
    index.do_not_backfill = true;
    let v2 = DbSchema::new(2, vec![StoreSchema::new("test", "id").with_index(index)]);
    let provider = Provider::open(&path, EngineType::Sql, v2, false, ProviderOptions::default())
        .await
        .expect("open v2");

    // The pre-existing row was not backfilled into the index
    let old = provider
        .get_only("test", Some("ind1"), "a", SortOrder::None, None, None)
        .await
        .expect("get_only");
    assert!(old.is_empty());

    // A fresh put after the upgrade is indexed
    provider
        .put("test", &[json!({"id": "def", "tt": "a"})])
        .await
        .expect("put");
    let fresh = provider
        .get_only("test", Some("ind1"), "a", SortOrder::None, None, None)
        .await
        .expect("get_only");
    assert_eq!(fresh, vec![json!({"id": "def", "tt": "a"})]);

    remove_test_dbs(&path);
}

#[tokio::test]
async fn test_sql_migration_is_idempotent() {
    let nonce: u64 = rand::random();
    let path = format!("docstore-test-db-{nonce}");
    remove_test_dbs(&path);

    let schema = basic_schema();
    let provider = Provider::open(
        &path,
        EngineType::Sql,
        schema.clone(),
        false,
        ProviderOptions::default(),
    )
    .await
    .expect("first open");
    provider
        .put("test", &[json!({"id": "a", "tt": "x"})])
        .await
        .expect("put");
    provider.close().await.expect("close");
    drop(provider);

    let provider = Provider::open(&path, EngineType::Sql, schema, false, ProviderOptions::default())
        .await
        .expect("second open");
    assert_eq!(provider.count_all("test", None).await.expect("count"), 1);
    let via_index = provider
        .get_only("test", Some("ind1"), "x", SortOrder::None, None, None)
        .await
        .expect("get_only");
    assert_eq!(via_index.len(), 1);

    remove_test_dbs(&path);
}

#[tokio::test]
async fn test_open_list_of_providers_falls_through() {
    let schema = basic_schema();
    let provider = docstore::open_list_of_providers(
        &[EngineType::Sql, EngineType::InMemory],
        "/nonexistent-docstore-dir/db",
        &schema,
        false,
        &ProviderOptions::default(),
    )
    .await
    .expect("fall through to the in-memory engine");
    provider
        .put("test", &[json!({"id": "a", "tt": "x"})])
        .await
        .expect("put");

    let failure = docstore::open_list_of_providers(
        &[EngineType::Sql],
        "/nonexistent-docstore-dir/db",
        &schema,
        false,
        &ProviderOptions::default(),
    )
    .await;
    assert!(failure.is_err());
}
