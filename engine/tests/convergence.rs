//! Multi-device convergence tests for msync-engine
//!
//! Each test drives two or three stores with manual clocks and exchanges
//! bundles between them the way hosts do.

use msync_engine::{
    parse_bundle, ConflictType, EntityType, ExportOptions, Hlc, HybridClock, LocalDevice,
    ManualTime, MoneyField, Resolution, Store, StoreSnapshot,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

const PASSPHRASE: &str = "coral-orbit-haze-prism";

struct Device {
    store: Store,
    time: ManualTime,
}

impl Device {
    fn new(id: &str, start_ms: i64) -> Self {
        let time = ManualTime::new(start_ms);
        let store = Store::new(
            LocalDevice::new(id, format!("{id} device"), "2024-01-01T00:00:00.000Z"),
            Arc::new(time.clone()),
        );
        Self { store, time }
    }

    /// Export pending local operations as cleartext bundle JSON.
    fn export(&mut self) -> Vec<u8> {
        let bundle = self
            .store
            .prepare_export(&ExportOptions::default())
            .expect("nothing to export");
        self.store.mark_exported(&bundle);
        bundle.to_json().unwrap()
    }

    fn import(&mut self, bundle: &[u8]) -> msync_engine::ImportSummary {
        self.store.import_decoded(parse_bundle(bundle).unwrap())
    }
}

fn transaction(status: &str) -> Value {
    json!({
        "kind": "income",
        "status": status,
        "title": "Logo design",
        "amountMinor": 10000,
        "currency": "USD",
        "occurredAt": "2024-03-01"
    })
}

fn visible_money(store: &Store, id: &str) -> Vec<Value> {
    let record = store.get(&EntityType::Transaction, id).unwrap();
    MoneyField::ALL
        .iter()
        .map(|f| record.field(f.name()).clone())
        .collect()
}

// ============================================================================
// Clock Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_compare_is_antisymmetric(
        pt_a in 0i64..1_000_000, c_a in 0u32..100, n_a in "[a-c]{1,2}",
        pt_b in 0i64..1_000_000, c_b in 0u32..100, n_b in "[a-c]{1,2}",
    ) {
        let a = Hlc::new(pt_a, c_a, n_a);
        let b = Hlc::new(pt_b, c_b, n_b);
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        prop_assert_eq!(a.to_string().cmp(&b.to_string()), a.cmp(&b));
    }

    #[test]
    fn prop_receive_dominates_both_inputs(
        local_wall in 0i64..1_000_000,
        remote_pt in 0i64..2_000_000,
        remote_counter in 0u32..1_000,
        ticks in 0usize..5,
    ) {
        let time = ManualTime::new(local_wall);
        let mut clock = HybridClock::new("local", Arc::new(time));
        for _ in 0..ticks {
            clock.tick();
        }
        let before = clock.last().clone();
        let remote = Hlc::new(remote_pt, remote_counter, "remote");

        let received = clock.receive(&remote);
        prop_assert!(received > before);
        prop_assert!((received.physical_time, received.counter) > (remote.physical_time, remote.counter));

        let next = clock.tick();
        prop_assert!(next > received);
    }
}

// ============================================================================
// End-to-End Scenarios
// ============================================================================

#[test]
fn client_created_on_a_appears_once_on_b() {
    let mut a = Device::new("device-a", 1_700_000_000_000);
    let mut b = Device::new("device-b", 1_700_000_500_000);
    a.store
        .capture_create(EntityType::Client, "client-1", json!({"name": "Acme"}))
        .unwrap();
    let bundle = a.export();

    let summary = b.import(&bundle);
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.skipped, 0);

    let clients = b.store.query(&EntityType::Client).unwrap().all();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].field("name"), "Acme");
    assert_eq!(b.store.pending_ops_count(), 0);

    let again = b.import(&bundle);
    assert!(again.already_imported);
    assert_eq!(again.applied, 0);
    assert_eq!(again.skipped, 1);
    assert_eq!(b.store.query(&EntityType::Client).unwrap().count(), 1);
    assert_eq!(b.store.op_count(), 1);
}

#[test]
fn offline_payments_conflict_on_both_devices() {
    let mut a = Device::new("device-a", 1_700_000_000_000);
    let mut b = Device::new("device-b", 1_700_000_000_000);
    a.store
        .capture_create(EntityType::Transaction, "tx-1", transaction("unpaid"))
        .unwrap();
    let base = a.export();
    b.import(&base);

    // A marks it paid by editing the status; B records the payment later
    a.time.advance(60_000);
    a.store
        .capture_update(EntityType::Transaction, "tx-1", json!({"status": "paid"}))
        .unwrap();
    b.time.advance(120_000);
    b.store
        .capture_mark_paid("tx-1", Some("2024-03-05T10:00:00Z"))
        .unwrap();

    let a_before = visible_money(&a.store, "tx-1");
    let b_before = visible_money(&b.store, "tx-1");

    let from_a = a.export();
    let from_b = b.export();
    assert_eq!(a.import(&from_b).conflicts, 1);
    assert_eq!(b.import(&from_a).conflicts, 1);

    for device in [&a, &b] {
        let open = device
            .store
            .open_conflicts(Some((&EntityType::Transaction, "tx-1")));
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].conflict_type, ConflictType::MoneyVersion);
        let paid_ats: Vec<&Value> = open[0].candidates.iter().map(|c| &c.value["paidAt"]).collect();
        assert!(paid_ats.contains(&&Value::Null));
        assert!(paid_ats.contains(&&json!("2024-03-05T10:00:00Z")));
    }
    // Neither side was silently overwritten by the later clock value
    assert_eq!(visible_money(&a.store, "tx-1"), a_before);
    assert_eq!(visible_money(&b.store, "tx-1"), b_before);
}

// ============================================================================
// Convergence
// ============================================================================

#[test]
fn concurrent_plain_edits_converge_to_higher_clock() {
    let mut a = Device::new("device-a", 1_700_000_000_000);
    let mut b = Device::new("device-b", 1_700_000_000_000);
    a.store
        .capture_create(EntityType::Project, "p-1", json!({"name": "Website"}))
        .unwrap();
    b.import(&a.export());

    a.time.advance(5_000);
    b.time.advance(9_000);
    a.store
        .capture_update(EntityType::Project, "p-1", json!({"notes": "from A"}))
        .unwrap();
    b.store
        .capture_update(EntityType::Project, "p-1", json!({"notes": "from B"}))
        .unwrap();

    let from_a = a.export();
    let from_b = b.export();
    a.import(&from_b);
    b.import(&from_a);

    for device in [&a, &b] {
        let project = device.store.get(&EntityType::Project, "p-1").unwrap();
        assert_eq!(project.field("notes"), "from B");
        assert_eq!(device.store.open_conflicts_count(), 0);
    }
}

#[test]
fn different_fields_of_one_record_both_survive() {
    let mut a = Device::new("device-a", 1_700_000_000_000);
    let mut b = Device::new("device-b", 1_700_000_000_000);
    a.store
        .capture_create(EntityType::Client, "c-1", json!({"name": "Acme"}))
        .unwrap();
    b.import(&a.export());

    a.time.advance(1);
    b.time.advance(1);
    a.store
        .capture_update(EntityType::Client, "c-1", json!({"email": "ap@acme.test"}))
        .unwrap();
    b.store
        .capture_update(EntityType::Client, "c-1", json!({"phone": "+1 555 0100"}))
        .unwrap();

    let from_a = a.export();
    let from_b = b.export();
    a.import(&from_b);
    b.import(&from_a);

    for device in [&a, &b] {
        let client = device.store.get(&EntityType::Client, "c-1").unwrap();
        assert_eq!(client.field("email"), "ap@acme.test");
        assert_eq!(client.field("phone"), "+1 555 0100");
    }
}

#[test]
fn resolution_on_a_closes_conflict_on_b() {
    let mut a = Device::new("device-a", 1_700_000_000_000);
    let mut b = Device::new("device-b", 1_700_000_000_000);
    a.store
        .capture_create(EntityType::Transaction, "tx-1", transaction("unpaid"))
        .unwrap();
    b.import(&a.export());

    a.time.advance(10);
    b.time.advance(10);
    a.store
        .capture_update(EntityType::Transaction, "tx-1", json!({"amountMinor": 12500}))
        .unwrap();
    b.store
        .capture_update(EntityType::Transaction, "tx-1", json!({"amountMinor": 9900}))
        .unwrap();
    let from_a = a.export();
    let from_b = b.export();
    a.import(&from_b);
    b.import(&from_a);
    assert_eq!(a.store.open_conflicts_count(), 1);
    assert_eq!(b.store.open_conflicts_count(), 1);

    let conflict = a.store.open_conflicts(None)[0].clone();
    let pick = conflict
        .candidates
        .iter()
        .position(|c| c.value["amountMinor"] == 9900)
        .unwrap();
    a.time.advance(1_000);
    a.store
        .resolve_conflict(&conflict.id, Resolution::Candidate(pick))
        .unwrap();

    let summary = b.import(&a.export());
    assert_eq!(summary.applied, 1);
    assert_eq!(b.store.open_conflicts_count(), 0);
    assert_eq!(visible_money(&a.store, "tx-1"), visible_money(&b.store, "tx-1"));
    assert_eq!(
        b.store
            .get(&EntityType::Transaction, "tx-1")
            .unwrap()
            .field("amountMinor"),
        9900
    );
}

#[test]
fn relay_through_third_device() {
    let mut a = Device::new("device-a", 1_700_000_000_000);
    let mut b = Device::new("device-b", 1_700_000_000_000);
    let mut c = Device::new("device-c", 1_700_000_000_000);
    a.store
        .capture_create(EntityType::Category, "cat-1", json!({"kind": "expense", "name": "Rent"}))
        .unwrap();
    b.import(&a.export());

    let relay = b
        .store
        .prepare_export(&ExportOptions::full_backup())
        .unwrap()
        .to_json()
        .unwrap();
    let summary = c.import(&relay);
    assert_eq!(summary.applied, 1);
    assert_eq!(
        c.store.get(&EntityType::Category, "cat-1").unwrap().field("name"),
        "Rent"
    );
}

#[test]
fn delete_wins_over_concurrent_edit() {
    let mut a = Device::new("device-a", 1_700_000_000_000);
    let mut b = Device::new("device-b", 1_700_000_000_000);
    a.store
        .capture_create(EntityType::Client, "c-1", json!({"name": "Acme"}))
        .unwrap();
    b.import(&a.export());

    b.time.advance(1);
    b.store.capture_delete(EntityType::Client, "c-1").unwrap();
    a.time.advance(60_000);
    a.store
        .capture_update(EntityType::Client, "c-1", json!({"name": "Acme Inc"}))
        .unwrap();

    let from_a = a.export();
    let from_b = b.export();
    a.import(&from_b);
    b.import(&from_a);

    assert!(a.store.get(&EntityType::Client, "c-1").is_none());
    assert!(b.store.get(&EntityType::Client, "c-1").is_none());
    assert_eq!(a.store.op_count(), b.store.op_count());
}

// ============================================================================
// Sealed Bundles and Persistence
// ============================================================================

#[test]
fn sealed_bundle_exchange_is_idempotent() {
    let mut a = Device::new("device-a", 1_700_000_000_000);
    let mut b = Device::new("device-b", 1_700_000_000_000);
    a.store
        .capture_create(EntityType::Client, "c-1", json!({"name": "Acme"}))
        .unwrap();
    a.store
        .capture_create(EntityType::Client, "c-2", json!({"name": "Globex"}))
        .unwrap();
    let exported = a
        .store
        .create_bundle(PASSPHRASE, &ExportOptions::default())
        .unwrap();

    let preview = b.store.preview_bundle(&exported.data, PASSPHRASE).unwrap();
    assert_eq!(preview.new_ops_count, 2);
    assert_eq!(preview.manifest.created_by_device_id, "device-a");

    let first = b.store.import_bundle(&exported.data, PASSPHRASE).unwrap();
    let second = b.store.import_bundle(&exported.data, PASSPHRASE).unwrap();
    assert_eq!(first.applied, 2);
    assert_eq!(second.applied, 0);
    assert_eq!(second.skipped, exported.manifest.op_count);
}

#[test]
fn snapshot_restores_merge_state() {
    let mut a = Device::new("device-a", 1_700_000_000_000);
    let mut b = Device::new("device-b", 1_700_000_000_000);
    a.store
        .capture_create(EntityType::Transaction, "tx-1", transaction("unpaid"))
        .unwrap();
    b.import(&a.export());
    a.time.advance(10);
    b.time.advance(10);
    a.store.capture_mark_paid("tx-1", Some("2024-03-02")).unwrap();
    b.store
        .capture_update(EntityType::Transaction, "tx-1", json!({"amountMinor": 1}))
        .unwrap();
    b.import(&a.export());

    let json = b.store.export_state().to_json().unwrap();
    let mut restored = Device::new("device-b", 1_700_000_000_000);
    restored
        .store
        .import_state(StoreSnapshot::from_json(&json).unwrap())
        .unwrap();

    assert_eq!(restored.store.op_count(), b.store.op_count());
    assert_eq!(restored.store.open_conflicts_count(), 1);
    assert_eq!(restored.store.money_versions("tx-1").len(), 3);
    assert_eq!(restored.store.pending_ops_count(), b.store.pending_ops_count());
    assert!(restored.store.clock() >= b.store.clock());

    // The restored clock keeps issuing values after everything logged
    let op = restored
        .store
        .capture_update(EntityType::Transaction, "tx-1", json!({"title": "Logo"}))
        .unwrap();
    assert!(op[0].hlc > *b.store.clock());
}
