mod common;

use std::sync::Arc;

use common::*;
use ignition_hub::bus::{Bus, BusMessage};
use ignition_hub::jar::HealOutcome;
use ignition_hub::transform::Passthrough;

#[test]
fn export_then_import_into_a_fresh_store_restores_the_slot() {
    let a = open_store(&scratch("snap-a"), Bus::new());
    a.switch_slot("personal").unwrap();
    a.set_cookie("example.com", "sid", "abc", "/", None).unwrap();
    a.set_cookie("news.test", "pref", "compact", "/feed", None).unwrap();
    a.set_aux("scroll", serde_json::json!(420)).unwrap();
    let snap = a.export_snapshot().unwrap();

    let b = open_store(&scratch("snap-b"), Bus::new());
    assert_eq!(b.import_snapshot(&snap).unwrap(), 2);
    assert_eq!(b.current_slot(), "personal");

    let again = b.export_snapshot().unwrap();
    let key = |s: &ignition_hub::jar::SessionSnapshot| {
        let mut v: Vec<_> = s
            .cookies
            .iter()
            .map(|c| (c.composite_key.clone(), c.value.clone(), c.path.clone()))
            .collect();
        v.sort();
        v
    };
    assert_eq!(key(&again), key(&snap));
    assert_eq!(again.auxiliary_state, snap.auxiliary_state);
}

#[test]
fn import_merges_without_deleting() {
    let store = open_store(&scratch("snap-merge"), Bus::new());
    store.set_cookie("example.com", "keep", "1", "/", None).unwrap();
    store.set_cookie("example.com", "sid", "old", "/", None).unwrap();
    let mut snap = store.export_snapshot().unwrap();
    snap.cookies.retain(|c| c.name == "sid");
    snap.cookies[0].value = "new".to_string();

    store.import_snapshot(&snap).unwrap();

    let mut cookies: Vec<_> = store
        .get_cookies("example.com")
        .unwrap()
        .into_iter()
        .map(|c| (c.name, c.value))
        .collect();
    cookies.sort();
    assert_eq!(
        cookies,
        vec![
            ("keep".to_string(), "1".to_string()),
            ("sid".to_string(), "new".to_string())
        ]
    );
}

#[tokio::test]
async fn import_announces_the_slot_to_siblings() {
    let bus = Bus::new();
    let sibling = bus.sibling();
    let mut rx = sibling.subscribe();
    let store = open_store(&scratch("snap-bus"), bus);

    let mut snap = store.export_snapshot().unwrap();
    snap.slot_id = "travel".to_string();
    store.import_snapshot(&snap).unwrap();

    let (origin, msg) = rx.recv().await.unwrap();
    assert_ne!(origin, sibling.instance());
    assert_eq!(
        msg,
        BusMessage::SlotSwitch {
            slot_id: "travel".to_string()
        }
    );
}

#[tokio::test]
async fn activation_heals_a_lost_database_from_the_vault() {
    let dir = scratch("snap-heal");
    {
        let hub = build_hub(&dir, ScriptedTransport::refusing(), Arc::new(Passthrough), &[]);
        hub.store()
            .set_cookie("example.com", "sid", "abc", "/", None)
            .unwrap();
        let handle = hub.activate();
        assert_eq!(handle.heal, Some(HealOutcome::Refreshed { records: 1 }));
        handle.shutdown().await;
    }

    std::fs::remove_file(dir.join("hub.db")).unwrap();

    let hub = build_hub(&dir, ScriptedTransport::refusing(), Arc::new(Passthrough), &[]);
    let handle = hub.activate();
    assert_eq!(handle.heal, Some(HealOutcome::RestoredFromVault { records: 1 }));
    handle.shutdown().await;
    assert_eq!(hub.store().get_cookies("example.com").unwrap()[0].value, "abc");
}
