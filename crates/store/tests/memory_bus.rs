#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use quire_core::{ChangeBus, ChangeRequest, IdentityKey, PageSort, Query, RepositoryError, SortDirection};
use quire_store::{MemoryBus, MemoryRepository, PageWindow};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct Contact {
    name: String,
    age: u32,
    team: String,
}

fn contact(name: &str, age: u32, team: &str) -> Contact {
    Contact { name: name.into(), age, team: team.into() }
}

fn seeded() -> Arc<MemoryRepository<Contact>> {
    let repo = Arc::new(MemoryRepository::new());
    repo.insert(Some(IdentityKey::from("c1")), contact("Cleo", 41, "red")).unwrap();
    repo.insert(Some(IdentityKey::from("a1")), contact("Ann", 29, "red")).unwrap();
    repo.insert(Some(IdentityKey::from("b1")), contact("Bob", 35, "blue")).unwrap();
    repo.insert(Some(IdentityKey::from("d1")), contact("Dora", 22, "red")).unwrap();
    repo
}

fn names(v: &[Arc<quire_core::Entity<Contact>>]) -> Vec<String> {
    v.iter().map(|e| e.model().name.clone()).collect()
}

#[tokio::test]
async fn execute_filters_and_echoes_sequence() {
    let bus = MemoryBus::new(seeded(), Query::new().filter("team", "red")).unwrap();
    let seq = bus.change_stream().next_seq();
    let waiter = bus.change_stream().wait_for_results(seq);
    bus.execute(&bus.query(), seq);
    let ev = waiter.await.expect("refresh");
    assert_eq!(ev.seq, Some(seq));
    assert_eq!(ev.count, Some(3));
    assert_eq!(names(ev.results.as_deref().unwrap()), vec!["Cleo", "Ann", "Dora"]);
    assert_eq!(ev.results_all.as_ref().map(|v| v.len()), Some(3));
}

#[tokio::test]
async fn change_request_acks_synchronously_then_refreshes_page() {
    let bus = MemoryBus::new(seeded(), Query::new()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    let _sub = bus.change_stream().subscribe(move |ev| l.lock().unwrap().push(ev.is_refresh()));

    let seq = bus.change_stream().next_seq();
    let waiter = bus.change_stream().wait_for_results(seq);
    bus.update_change_request(ChangeRequest {
        seq,
        page_index: Some(1),
        page_size: Some(2),
        page_sort: Some(PageSort::new("age", SortDirection::Desc)),
    });
    assert_eq!(*log.lock().unwrap(), vec![false]);

    let ev = waiter.await.expect("refresh");
    assert_eq!(*log.lock().unwrap(), vec![false, true]);
    // ages desc: 41, 35, 29, 22 -> page 1 of size 2
    assert_eq!(names(ev.results.as_deref().unwrap()), vec!["Ann", "Dora"]);
    assert_eq!(ev.count, Some(4));
    assert_eq!(bus.window(), PageWindow { index: 1, size: 2, sort: PageSort::new("age", SortDirection::Desc) });
}

#[tokio::test]
async fn queued_executions_coalesce_into_one_refresh() {
    let bus = MemoryBus::new(seeded(), Query::new()).unwrap();
    let refreshes = Arc::new(Mutex::new(Vec::new()));
    let r = refreshes.clone();
    let _sub = bus.change_stream().subscribe(move |ev| {
        if ev.is_refresh() {
            r.lock().unwrap().push(ev.seq);
        }
    });
    let q = bus.query();
    let seqs: Vec<_> = (0..3).map(|_| bus.change_stream().next_seq()).collect();
    let waiter = bus.change_stream().wait_for_results(seqs[2]);
    for s in &seqs {
        bus.execute(&q, *s);
    }
    waiter.await.expect("refresh");
    assert_eq!(*refreshes.lock().unwrap(), vec![Some(seqs[2])]);
}

#[tokio::test]
async fn create_applies_context_then_data() {
    let repo = seeded();
    let bus = MemoryBus::new(repo.clone(), Query::new().filter("team", "green")).unwrap();
    let ctx = bus.parsed_create_context(&bus.query());
    let mut data = serde_json::Map::new();
    data.insert("name".into(), json!("Eve"));
    data.insert("__uuid".into(), json!("ignored"));

    let created = bus.repository().create(Some(data), Some(IdentityKey::from("e1")), Some(ctx)).await.unwrap();
    assert_eq!(created.identity().as_str(), "e1");
    assert_eq!(created.model(), &contact("Eve", 0, "green"));
    assert_eq!(repo.len(), 5);

    let dup = bus.repository().create(None, Some(IdentityKey::from("e1")), None).await;
    assert!(matches!(dup, Err(RepositoryError::Conflict(_))));
}

#[tokio::test]
async fn load_plain_takes_identity_from_internal_field() {
    let repo: MemoryRepository<Contact> = MemoryRepository::new();
    let n = repo
        .load_plain(json!([
            {"name": "Ann", "age": 29, "team": "red", "__uuid": "a1"},
            {"name": "Bob", "age": 35, "team": "blue"}
        ]))
        .unwrap();
    assert_eq!(n, 2);
    let snap = repo.snapshot();
    assert_eq!(snap[0].identity().as_str(), "a1");
    assert!(!snap[1].identity().as_str().is_empty());
    assert!(repo.load_plain(json!({"name": "x"})).is_err());
    assert!(repo.load_plain(json!([{"__uuid": 5}])).is_err());
}
