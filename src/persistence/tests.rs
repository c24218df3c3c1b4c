use tempfile::TempDir;

use super::{MessageStore, StoredEnvelope};
use crate::broker::envelope::Envelope;
use crate::broker::topology::Topic;
use crate::broker::topology::{BindingSpec, Declaration};

fn stored(id: u64, body: &str) -> StoredEnvelope {
    StoredEnvelope {
        id,
        exchange: "report".to_string(),
        routing_key: String::new(),
        redelivered: false,
        envelope: Envelope::new(body.as_bytes().to_vec()).persistent(),
    }
}

#[test]
fn test_messages_come_back_in_id_order() {
    let dir = TempDir::new().unwrap();
    let store = MessageStore::open(dir.path()).unwrap();

    store.put_message("report", &stored(300, "c")).unwrap();
    store.put_message("report", &stored(2, "a")).unwrap();
    store.put_message("report", &stored(17, "b")).unwrap();

    let ids: Vec<u64> = store.messages("report").unwrap().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![2, 17, 300]);
}

#[test]
fn test_remove_message() {
    let dir = TempDir::new().unwrap();
    let store = MessageStore::open(dir.path()).unwrap();
    store.put_message("report", &stored(1, "a")).unwrap();
    store.put_message("report", &stored(2, "b")).unwrap();

    store.remove_message("report", 1).unwrap();

    let remaining = store.messages("report").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].envelope.payload(), b"b");
}

#[test]
fn test_queues_are_isolated() {
    let dir = TempDir::new().unwrap();
    let store = MessageStore::open(dir.path()).unwrap();
    store.put_message("report", &stored(1, "a")).unwrap();

    assert!(store.messages("report_deadletter").unwrap().is_empty());
}

#[test]
fn test_topology_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let topic = Topic::named("report");
    {
        let store = MessageStore::open(dir.path()).unwrap();
        for declaration in topic.declarations() {
            match declaration {
                Declaration::Exchange(spec) => store.save_exchange(&spec).unwrap(),
                Declaration::Queue(spec) => store.save_queue(&spec).unwrap(),
                Declaration::Binding(spec) => store.save_binding(&spec).unwrap(),
            }
        }
        store.flush().unwrap();
    }

    let store = MessageStore::open(dir.path()).unwrap();
    assert_eq!(store.exchanges().unwrap().len(), 3);
    assert_eq!(store.queues().unwrap().len(), 3);
    assert!(
        store
            .bindings()
            .unwrap()
            .contains(&BindingSpec::new("report_deadletter", "report_deadletter"))
    );
}
