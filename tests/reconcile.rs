mod common;

use std::fs;

use chrono::Local;
use common::{harness, peer, Harness, ReloadFailure, SERVER_HEADER};
use wg_peer_manager::{
    keys::{KeyPairProvider, NativeKeys},
    lifecycle::ReconcileAction,
    peer::{PeerRecord, PeerRequest, ProvisionState},
    registry::ClientRegistry,
    Stage,
};

fn create(h: &Harness, name: &str) -> PeerRecord {
    h.manager.create(PeerRequest::new(peer(name))).unwrap().record
}

fn edit(h: &Harness, name: &str, change: impl FnOnce(&mut PeerRecord)) {
    let mut record = h.record(name).unwrap();
    change(&mut record);
    h.registry.update(record).unwrap();
}

fn drop_stanza_by_hand(h: &Harness, name: &str) {
    let mut doc = h.server_doc();
    doc.remove_stanza(name, None);
    fs::write(&h.cfg.server_config_path, doc.render()).unwrap();
}

#[test]
fn consistent_state_needs_no_action() {
    let h = harness();
    create(&h, "alice");
    h.manager.block(&peer("alice")).unwrap();
    create(&h, "bob");
    let report = h.manager.reconcile().unwrap();
    assert!(report.is_clean(), "{:?}", report.actions);
    assert!(!report.reloaded);
}

#[test]
fn pending_record_with_all_artifacts_is_committed() {
    let h = harness();
    create(&h, "alice");
    edit(&h, "alice", |r| {
        r.provision = ProvisionState::Pending;
        r.is_active = false;
    });

    let report = h.manager.reconcile().unwrap();
    assert_eq!(report.actions, vec![ReconcileAction::CommittedPending("alice".into())]);
    let record = h.record("alice").unwrap();
    assert_eq!(record.provision, ProvisionState::Committed);
    assert!(record.is_active);
}

#[test]
fn pending_record_without_client_file_is_rolled_back() {
    let h = harness();
    create(&h, "alice");
    fs::remove_file(h.client_path("alice")).unwrap();
    edit(&h, "alice", |r| r.provision = ProvisionState::Pending);
    let reloads = h.control.reloads();

    let report = h.manager.reconcile().unwrap();
    assert_eq!(report.actions, vec![ReconcileAction::RolledBackPending("alice".into())]);
    assert!(report.reloaded);
    assert_eq!(h.control.reloads(), reloads + 1);
    assert_eq!(h.server_text(), SERVER_HEADER);
    assert!(h.record("alice").is_none());
}

#[test]
fn pending_record_without_stanza_is_rolled_back() {
    let h = harness();
    create(&h, "alice");
    drop_stanza_by_hand(&h, "alice");
    edit(&h, "alice", |r| r.provision = ProvisionState::Pending);

    let report = h.manager.reconcile().unwrap();
    assert_eq!(report.actions, vec![ReconcileAction::RolledBackPending("alice".into())]);
    assert!(!report.reloaded);
    assert!(h.record("alice").is_none());
    assert!(!h.client_path("alice").exists());
}

#[test]
fn active_record_without_stanza_is_quarantined() {
    let h = harness();
    create(&h, "alice");
    drop_stanza_by_hand(&h, "alice");

    let report = h.manager.reconcile().unwrap();
    assert_eq!(report.actions, vec![ReconcileAction::Quarantined("alice".into())]);
    let record = h.record("alice").unwrap();
    assert!(!record.is_active);
    assert!(h.client_path("alice").exists());
}

#[test]
fn blocked_record_loses_its_stanza() {
    let h = harness();
    create(&h, "alice");
    create(&h, "bob");
    edit(&h, "alice", |r| r.is_blocked = true);

    let report = h.manager.reconcile().unwrap();
    assert_eq!(report.actions, vec![ReconcileAction::BlockedStanzaRemoved("alice".into())]);
    assert!(report.reloaded);
    assert!(h.server_doc().find("alice").is_none());
    assert!(h.server_doc().find("bob").is_some());
}

#[test]
fn inactive_record_with_stanza_follows_the_server_config() {
    let h = harness();
    create(&h, "alice");
    edit(&h, "alice", |r| r.is_active = false);

    let report = h.manager.reconcile().unwrap();
    assert_eq!(report.actions, vec![ReconcileAction::Reactivated("alice".into())]);
    assert!(h.record("alice").unwrap().is_active);
}

#[test]
fn orphans_and_key_mismatches_are_reported_not_repaired() {
    let h = harness();
    create(&h, "alice");
    edit(&h, "alice", |r| {
        r.public_key = NativeKeys.generate_keypair().unwrap().public_key;
    });
    let mut doc = h.server_doc();
    let ghost = NativeKeys.generate_keypair().unwrap();
    doc.append_stanza("ghost", &ghost.public_key, "10.0.0.9/32", Local::now());
    fs::write(&h.cfg.server_config_path, doc.render()).unwrap();
    let before = h.server_text();

    let report = h.manager.reconcile().unwrap();
    assert_eq!(
        report.actions,
        vec![
            ReconcileAction::KeyMismatch("alice".into()),
            ReconcileAction::OrphanStanza("ghost".into()),
        ]
    );
    assert!(!report.reloaded);
    assert_eq!(h.server_text(), before);
    assert!(h.record("alice").unwrap().is_active);
}

#[test]
fn failed_reload_leaves_every_artifact_in_place() {
    let h = harness();
    create(&h, "alice");
    edit(&h, "alice", |r| r.is_blocked = true);
    create(&h, "carol");
    edit(&h, "carol", |r| r.provision = ProvisionState::Pending);
    drop_stanza_by_hand(&h, "carol");
    let before = h.server_text();
    h.control.fail_reloads(ReloadFailure::Tool);

    let err = h.manager.reconcile().unwrap_err();
    assert_eq!(err.failed_stage(), Some(Stage::InterfaceReloaded));
    assert_eq!(h.server_text(), before);
    assert!(h.server_doc().find("alice").is_some());
    assert!(h.record("alice").unwrap().is_blocked);
    assert_eq!(h.record("carol").unwrap().provision, ProvisionState::Pending);
    assert!(h.client_path("carol").exists());

    h.control.heal();
    let report = h.manager.reconcile().unwrap();
    assert!(report.reloaded);
    assert!(h.server_doc().find("alice").is_none());
    assert!(h.record("carol").is_none());
    assert!(!h.client_path("carol").exists());
}
