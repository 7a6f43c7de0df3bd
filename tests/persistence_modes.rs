use lexbulk::action::Action;
use lexbulk::condition::{Condition, Op};
use lexbulk::executor::Executor;
use lexbulk::persist::{PersistenceMode, SqliteStore};
use lexbulk::record::{Record, Relation};
use lexbulk::request::BulkRequest;
use lexbulk::store::RecordStore;
use serde_json::json;

fn seed(store: &SqliteStore) {
    store
        .put(&Record::new("a").with_fields(json!({"grammatical_info": {"trait": "verb"}})))
        .expect("put a");
    store
        .put(&Record::new("b").with_relation(Relation::new("synonym", "a")))
        .expect("put b");
}

fn retag() -> BulkRequest {
    BulkRequest::new(
        Condition::field("grammatical_info.trait", Op::Equals, Some(json!("verb"))).unwrap(),
        vec![Action::Set { path: "grammatical_info.trait".parse().unwrap(), value: json!("noun") }],
    )
}

#[test]
fn in_memory_mode_allows_bulk_runs() {
    let store = SqliteStore::open(PersistenceMode::InMemory).expect("store");
    seed(&store);
    let result = Executor::new(&store).execute(&retag()).expect("run");
    assert_eq!(result.succeeded, 1);
    assert_eq!(store.revision("a").unwrap(), Some(2));
    // unmatched records are not rewritten
    assert_eq!(store.revision("b").unwrap(), Some(1));
}

#[test]
fn file_mode_persists_across_reopen() {
    let path = "test_lexbulk_temp.db".to_string();
    // Ensure clean start
    let _ = std::fs::remove_file(&path);
    {
        let store = SqliteStore::open(PersistenceMode::File(path.clone())).expect("store");
        seed(&store);
        Executor::new(&store).execute(&retag()).expect("run");
    }
    let reopened = SqliteStore::open(PersistenceMode::File(path.clone())).expect("reopen");
    assert_eq!(reopened.len().unwrap(), 2);
    let a = reopened.get("a").unwrap().expect("a persisted");
    assert_eq!(a.fields["grammatical_info"]["trait"], json!("noun"));
    let b = reopened.get("b").unwrap().expect("b persisted");
    assert_eq!(b.relations, vec![Relation::new("synonym", "a")]);
    // a dry run against the reopened file leaves revisions alone
    let preview = Executor::new(&reopened)
        .execute(&BulkRequest::for_ids(vec!["a".into()], vec![Action::Clear { path: "grammatical_info".parse().unwrap() }]).dry_run(true))
        .expect("dry run");
    assert_eq!(preview.succeeded, 1);
    assert_eq!(reopened.revision("a").unwrap(), Some(2));
    drop(reopened);
    // Clean up
    let _ = std::fs::remove_file(&path);
}
