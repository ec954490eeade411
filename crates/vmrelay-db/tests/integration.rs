//! Integration tests for vmrelay-db
//!
//! Tests store operations with a real SQLite in-memory database

use vmrelay_db::entities::virtual_machine::{InboundRule, RuleProtocol, VmStatus};
use vmrelay_db::{connect, migrate, NewVm, StoreError, VmStore};

/// Helper to create a test store
async fn setup_test_store() -> VmStore {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    VmStore::new(db)
}

fn ssh_rule(remote_port: u16) -> InboundRule {
    InboundRule {
        protocol: RuleProtocol::Tcp,
        vm_port: 22,
        description: "SSH access".to_string(),
        remote_port,
    }
}

fn new_vm(name: &str, private_ip: &str, owner_id: &str, rules: Vec<InboundRule>) -> NewVm {
    NewVm {
        name: name.to_string(),
        key_name: "default".to_string(),
        ram: 1024,
        cpu: 2,
        image: "generic/ubuntu2204".to_string(),
        private_ip: private_ip.to_string(),
        inbound_rules: rules,
        owner_id: owner_id.to_string(),
    }
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let result = migrate(&db).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_insert_starts_in_provisioning() {
    let store = setup_test_store().await;

    let vm = store
        .insert(new_vm("alpha", "192.168.56.11", "owner-1", vec![ssh_rule(2222)]))
        .await
        .expect("Failed to insert");

    assert_eq!(vm.name, "alpha");
    assert_eq!(vm.private_ip, "192.168.56.11");
    assert_eq!(vm.status, VmStatus::Provisioning);
    assert_eq!(vm.inbound_rules.0.len(), 1);
    assert_eq!(vm.inbound_rules.0[0].remote_port, 2222);
}

#[tokio::test]
async fn test_duplicate_name_is_conflict() {
    let store = setup_test_store().await;

    store
        .insert(new_vm("alpha", "192.168.56.11", "owner-1", vec![]))
        .await
        .expect("Failed to insert");

    let result = store
        .insert(new_vm("alpha", "192.168.56.12", "owner-2", vec![]))
        .await;

    assert!(matches!(result, Err(StoreError::Conflict(_))));
}

#[tokio::test]
async fn test_duplicate_ip_is_conflict() {
    let store = setup_test_store().await;

    store
        .insert(new_vm("alpha", "192.168.56.11", "owner-1", vec![]))
        .await
        .expect("Failed to insert");

    let result = store
        .insert(new_vm("beta", "192.168.56.11", "owner-1", vec![]))
        .await;

    assert!(matches!(result, Err(StoreError::Conflict(_))));
}

#[tokio::test]
async fn test_find_owned_filters_by_owner() {
    let store = setup_test_store().await;

    store
        .insert(new_vm("alpha", "192.168.56.11", "owner-1", vec![]))
        .await
        .expect("Failed to insert");

    let found = store
        .find_owned("alpha", "owner-1")
        .await
        .expect("Failed to query");
    assert!(found.is_some());

    let not_yours = store
        .find_owned("alpha", "owner-2")
        .await
        .expect("Failed to query");
    assert!(not_yours.is_none());
}

#[tokio::test]
async fn test_list_for_owner() {
    let store = setup_test_store().await;

    store
        .insert(new_vm("alpha", "192.168.56.11", "owner-1", vec![]))
        .await
        .expect("Failed to insert");
    store
        .insert(new_vm("beta", "192.168.56.12", "owner-1", vec![]))
        .await
        .expect("Failed to insert");
    store
        .insert(new_vm("gamma", "192.168.56.13", "owner-2", vec![]))
        .await
        .expect("Failed to insert");

    let vms = store.list_for_owner("owner-1").await.expect("Failed to query");
    assert_eq!(vms.len(), 2);
    assert!(vms.iter().all(|vm| vm.owner_id == "owner-1"));
}

#[tokio::test]
async fn test_used_ips() {
    let store = setup_test_store().await;

    store
        .insert(new_vm("alpha", "192.168.56.11", "owner-1", vec![]))
        .await
        .expect("Failed to insert");
    store
        .insert(new_vm("beta", "192.168.56.12", "owner-1", vec![]))
        .await
        .expect("Failed to insert");

    let ips = store.used_ips().await.expect("Failed to query");
    assert_eq!(ips.len(), 2);
    assert!(ips.contains("192.168.56.11"));
    assert!(ips.contains("192.168.56.12"));
}

#[tokio::test]
async fn test_used_ports_flattens_all_rule_lists() {
    let store = setup_test_store().await;

    store
        .insert(new_vm(
            "alpha",
            "192.168.56.11",
            "owner-1",
            vec![
                ssh_rule(2222),
                InboundRule {
                    protocol: RuleProtocol::Tcp,
                    vm_port: 80,
                    description: "web".to_string(),
                    remote_port: 2223,
                },
            ],
        ))
        .await
        .expect("Failed to insert");
    store
        .insert(new_vm("beta", "192.168.56.12", "owner-2", vec![ssh_rule(2224)]))
        .await
        .expect("Failed to insert");

    let ports = store.used_ports().await.expect("Failed to query");
    assert_eq!(ports.len(), 3);
    assert!(ports.contains(&2222));
    assert!(ports.contains(&2223));
    assert!(ports.contains(&2224));
}

#[tokio::test]
async fn test_update_rules() {
    let store = setup_test_store().await;

    let vm = store
        .insert(new_vm("alpha", "192.168.56.11", "owner-1", vec![ssh_rule(2222)]))
        .await
        .expect("Failed to insert");

    let mut rules = vm.inbound_rules.0.clone();
    rules.push(InboundRule {
        protocol: RuleProtocol::Tcp,
        vm_port: 8080,
        description: "app".to_string(),
        remote_port: 2223,
    });

    let updated = store.update_rules(vm, rules).await.expect("Failed to update");
    assert_eq!(updated.inbound_rules.0.len(), 2);

    // Rule order is preserved
    assert_eq!(updated.inbound_rules.0[0].vm_port, 22);
    assert_eq!(updated.inbound_rules.0[1].vm_port, 8080);
}

#[tokio::test]
async fn test_set_status() {
    let store = setup_test_store().await;

    let vm = store
        .insert(new_vm("alpha", "192.168.56.11", "owner-1", vec![]))
        .await
        .expect("Failed to insert");

    store
        .set_status(vm.id, VmStatus::Active)
        .await
        .expect("Failed to set status");

    let found = store
        .find_by_id(vm.id)
        .await
        .expect("Failed to query")
        .expect("VM not found");
    assert_eq!(found.status, VmStatus::Active);
}

#[tokio::test]
async fn test_set_status_unknown_id_is_not_found() {
    let store = setup_test_store().await;

    let result = store.set_status(9999, VmStatus::Active).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_delete() {
    let store = setup_test_store().await;

    let vm = store
        .insert(new_vm("alpha", "192.168.56.11", "owner-1", vec![]))
        .await
        .expect("Failed to insert");

    store.delete(vm.id).await.expect("Failed to delete");

    let found = store.find_by_name("alpha").await.expect("Failed to query");
    assert!(found.is_none());

    // The IP is free again
    let ips = store.used_ips().await.expect("Failed to query");
    assert!(ips.is_empty());
}

#[tokio::test]
async fn test_rule_serialization_round_trip() {
    let store = setup_test_store().await;

    let rule = InboundRule {
        protocol: RuleProtocol::Udp,
        vm_port: 5353,
        description: "mDNS".to_string(),
        remote_port: 2500,
    };

    let vm = store
        .insert(new_vm("alpha", "192.168.56.11", "owner-1", vec![rule.clone()]))
        .await
        .expect("Failed to insert");

    let found = store
        .find_by_id(vm.id)
        .await
        .expect("Failed to query")
        .expect("VM not found");
    assert_eq!(found.inbound_rules.0, vec![rule]);
}
