use idn_adapters::{FileStore, LocalStore};
use serde_json::json;

#[tokio::test]
async fn records_survive_reopening() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = tempfile::tempdir().unwrap();

    {
        let store = FileStore::new(dir.path());
        let drafts = store.table("drafts");
        drafts.put("b", json!({ "status": "Draft" })).await.unwrap();
        drafts.put("a", json!({ "status": "Publishing" })).await.unwrap();
        drafts.update("b", json!({ "title": "second" })).await.unwrap();
    }

    let store = FileStore::new(dir.path());
    let drafts = store.table("drafts");
    let all = drafts.all().await.unwrap();
    let ids: Vec<&str> = all.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(
        drafts.get("b").await.unwrap(),
        Some(json!({ "status": "Draft", "title": "second" }))
    );
    assert!(dir.path().join("drafts.json").exists());

    assert!(drafts.delete("a").await.unwrap());
    assert!(drafts.get("a").await.unwrap().is_none());
}

#[tokio::test]
async fn table_names_cannot_escape_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("tables"));

    store.table("../settings").put("node", json!({ "url": "local" })).await.unwrap();
    assert!(dir.path().join("tables").join("___settings.json").exists());
    assert!(!dir.path().join("settings.json").exists());
}

#[tokio::test]
async fn missing_table_reads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    assert!(store.table("nothing").all().await.unwrap().is_empty());
    assert!(!store.table("nothing").delete("x").await.unwrap());
}
