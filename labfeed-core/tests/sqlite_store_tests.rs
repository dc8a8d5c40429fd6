//! SQLite store: persistence, filtering and change-log streams.

use futures::StreamExt;
use labfeed_core::{
    ChangeRelay, Collection, CollectionNames, Document, DocumentStore, QueryService, Recorder,
    SqliteStore, StoreError,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const POLL: Duration = Duration::from_millis(10);

fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap()
}

async fn ready_store(dir: &tempfile::TempDir) -> SqliteStore {
    let store = SqliteStore::new(dir.path().join("lab.db"), CollectionNames::default(), POLL);
    let mut session = store.open_session().await.unwrap();
    session.ensure_collections().await.unwrap();
    store
}

#[tokio::test]
async fn ensure_collections_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = ready_store(&dir).await;
    let mut session = store.open_session().await.unwrap();
    session.ensure_collections().await.unwrap();
    session.ensure_collections().await.unwrap();
    assert!(session.scan(Collection::Experiments).await.unwrap().is_empty());
}

#[tokio::test]
async fn insert_get_scan_and_filter() {
    let dir = tempfile::tempdir().unwrap();
    let store = ready_store(&dir).await;
    let mut session = store.open_session().await.unwrap();

    let generated = session
        .insert(Collection::Experiments, doc(json!({"createdAt": 1})))
        .await
        .unwrap();
    assert!(uuid::Uuid::parse_str(&generated).is_ok());
    session
        .insert(Collection::Experiments, doc(json!({"id": "e1", "createdAt": 2})))
        .await
        .unwrap();

    let rows = session.scan(Collection::Experiments).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], json!(generated));
    assert_eq!(rows[1]["id"], "e1");

    let e1 = session.get(Collection::Experiments, "e1").await.unwrap().unwrap();
    assert_eq!(e1["createdAt"], 2);
    assert!(session.get(Collection::Experiments, "nope").await.unwrap().is_none());

    for (id, exp) in [("t1", "e1"), ("t2", "e2"), ("t3", "e1")] {
        session
            .insert(
                Collection::Transformations,
                doc(json!({"id": id, "experiment_id": exp})),
            )
            .await
            .unwrap();
    }
    let matched = session
        .filter_eq(Collection::Transformations, "experiment_id", &json!("e1"))
        .await
        .unwrap();
    let ids: Vec<&Value> = matched.iter().map(|d| &d["id"]).collect();
    assert_eq!(ids, [&json!("t1"), &json!("t3")]);
}

#[tokio::test]
async fn duplicate_id_is_a_query_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = ready_store(&dir).await;
    let mut session = store.open_session().await.unwrap();
    session
        .insert(Collection::Tests, doc(json!({"id": "x1"})))
        .await
        .unwrap();
    let err = session
        .insert(Collection::Tests, doc(json!({"id": "x1"})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::QueryFailed {
            collection: Collection::Tests,
            ..
        }
    ));
}

#[tokio::test]
async fn change_stream_sees_writes_from_other_sessions_only_after_subscribing() {
    let dir = tempfile::tempdir().unwrap();
    let store = ready_store(&dir).await;

    let mut writer = store.open_session().await.unwrap();
    writer
        .insert(Collection::Analytics, doc(json!({"id": "before"})))
        .await
        .unwrap();

    let mut reader = store.open_session().await.unwrap();
    let mut stream = reader.changes(Collection::Analytics).await.unwrap();

    writer
        .insert(Collection::Analytics, doc(json!({"id": "after"})))
        .await
        .unwrap();
    writer
        .upsert(Collection::Analytics, "after", doc(json!({"score": 2})))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(first.old_value.is_none());
    assert_eq!(first.new_value.unwrap()["id"], "after");

    let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second.old_value.unwrap()["id"], "after");
    assert_eq!(second.new_value.unwrap()["score"], 2);
}

#[tokio::test]
async fn unparsable_change_row_is_reported_after_earlier_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = ready_store(&dir).await;
    let mut session = store.open_session().await.unwrap();
    let mut stream = session.changes(Collection::Tests).await.unwrap();

    let mut raw = rusqlite::Connection::open(store.path()).unwrap();
    let tx = raw.transaction().unwrap();
    for body in [r#"{"id":"good"}"#, "{broken"] {
        tx.execute(
            "INSERT INTO _changes (collection, old_body, new_body) VALUES ('tests', NULL, ?1)",
            [body],
        )
        .unwrap();
    }
    tx.commit().unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.new_value.unwrap()["id"], "good");

    let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        second,
        Err(StoreError::SubscriptionFailed {
            collection: Collection::Tests,
            ..
        })
    ));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn change_stream_ignores_other_collections() {
    let dir = tempfile::tempdir().unwrap();
    let store = ready_store(&dir).await;
    let mut session = store.open_session().await.unwrap();
    let mut stream = session.changes(Collection::Tests).await.unwrap();

    session
        .insert(Collection::Experiments, doc(json!({"id": "e1"})))
        .await
        .unwrap();
    session
        .insert(Collection::Tests, doc(json!({"id": "x1"})))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.new_value.unwrap()["id"], "x1");
}

#[tokio::test]
async fn custom_table_names_keep_logical_names_on_the_feed() {
    let dir = tempfile::tempdir().unwrap();
    let names = CollectionNames {
        tests: "test_runs".into(),
        ..CollectionNames::default()
    };
    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::new(dir.path().join("lab.db"), names, POLL));
    store
        .open_session()
        .await
        .unwrap()
        .ensure_collections()
        .await
        .unwrap();

    let relay = ChangeRelay::new(Arc::clone(&store));
    let (tx, mut rx) = mpsc::channel(8);
    let mut conn = relay.attach(tx).await;

    let recorder = Recorder::new(Arc::clone(&store));
    let id = recorder
        .add_test("e1", "v1", json!({"results": [{"correct": true}]}))
        .await
        .unwrap();

    let feed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(feed.table, Collection::Tests);
    assert_eq!(feed.value["id"], json!(id));
    assert_eq!(
        serde_json::to_value(&feed).unwrap()["table"],
        json!("tests")
    );
    conn.close().await;

    let detail = QueryService::new(store).get_experiment("e1").await.unwrap();
    assert!(detail.is_none());
}

#[tokio::test]
async fn missing_directory_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(
        dir.path().join("no").join("such").join("dir.db"),
        CollectionNames::default(),
        POLL,
    );
    let err = store.open_session().await.err().unwrap();
    assert!(matches!(err, StoreError::Unavailable { .. }));

    let query = QueryService::new(Arc::new(store));
    assert!(matches!(
        query.list_experiments().await,
        Err(StoreError::Unavailable { .. })
    ));
}

#[tokio::test]
async fn data_survives_reopening() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = ready_store(&dir).await;
        Recorder::new(Arc::new(store))
            .add_experiment(json!({"id": "kept"}))
            .await
            .unwrap();
    }
    let store = ready_store(&dir).await;
    let rows = QueryService::new(Arc::new(store))
        .list_experiments()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], "kept");
}
