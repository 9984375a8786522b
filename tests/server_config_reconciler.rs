mod common;

use std::{fs, sync::Arc};

use common::{FakeControl, ReloadFailure, SERVER_HEADER};
use wg_peer_manager::{
    keys::{KeyPairProvider, NativeKeys},
    lock::ConfigLock,
    reconciler::{RemoveOutcome, ServerConfigReconciler},
    Error,
};

fn setup(initial: &str) -> (tempfile::TempDir, Arc<FakeControl>, ServerConfigReconciler, ConfigLock) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wg0.conf");
    fs::write(&path, initial).unwrap();
    let control = Arc::new(FakeControl::default());
    let reconciler = ServerConfigReconciler::new(&path, control.clone());
    let lock = ConfigLock::for_file(&path);
    (dir, control, reconciler, lock)
}

#[test]
fn add_then_remove_restores_the_file_exactly() {
    let initial = format!("{SERVER_HEADER}PostUp = iptables -A FORWARD -i wg0 -j ACCEPT\n");
    let (_dir, control, reconciler, lock) = setup(&initial);
    let key = NativeKeys.generate_keypair().unwrap().public_key;

    let guard = lock.acquire().unwrap();
    reconciler.add_peer(&guard, &key, "10.0.0.2/32", "alice").unwrap();
    let text = fs::read_to_string(reconciler.path()).unwrap();
    assert!(text.starts_with(&initial));
    assert!(text.contains(&format!("PublicKey = {key}\nAllowedIPs = 10.0.0.2/32\n")));
    assert_eq!(control.reloads(), 1);

    let outcome = reconciler.remove_peer(&guard, "alice", &key).unwrap();
    assert_eq!(outcome, RemoveOutcome::Removed);
    assert_eq!(fs::read_to_string(reconciler.path()).unwrap(), initial);
    assert_eq!(control.reloads(), 2);

    // Absent peer: nothing written, nothing reloaded.
    assert_eq!(
        reconciler.remove_peer(&guard, "alice", &key).unwrap(),
        RemoveOutcome::NotFound
    );
    assert_eq!(control.reloads(), 2);
}

#[test]
fn removal_needs_the_matching_key() {
    let (_dir, _control, reconciler, lock) = setup(SERVER_HEADER);
    let key = NativeKeys.generate_keypair().unwrap().public_key;
    let other = NativeKeys.generate_keypair().unwrap().public_key;
    let guard = lock.acquire().unwrap();
    reconciler.append_stanza(&guard, &key, "10.0.0.2/32", "alice").unwrap();

    assert_eq!(
        reconciler.remove_stanza(&guard, "alice", &other).unwrap(),
        RemoveOutcome::NotFound
    );
    assert!(reconciler.read(&guard).unwrap().find("alice").is_some());
}

#[test]
fn duplicate_label_or_key_is_refused() {
    let (_dir, _control, reconciler, lock) = setup(SERVER_HEADER);
    let key = NativeKeys.generate_keypair().unwrap().public_key;
    let guard = lock.acquire().unwrap();
    reconciler.append_stanza(&guard, &key, "10.0.0.2/32", "alice").unwrap();
    let before = fs::read_to_string(reconciler.path()).unwrap();

    assert!(matches!(
        reconciler.append_stanza(&guard, "b3RoZXI=", "10.0.0.3/32", "alice"),
        Err(Error::DuplicateName { .. })
    ));
    assert!(matches!(
        reconciler.append_stanza(&guard, &key, "10.0.0.3/32", "bob"),
        Err(Error::Validation(_))
    ));
    assert_eq!(fs::read_to_string(reconciler.path()).unwrap(), before);
}

#[test]
fn reload_failure_surfaces_after_the_write() {
    let (_dir, control, reconciler, lock) = setup(SERVER_HEADER);
    control.fail_reloads(ReloadFailure::Tool);
    let key = NativeKeys.generate_keypair().unwrap().public_key;
    let guard = lock.acquire().unwrap();

    let before = reconciler.read(&guard).unwrap();
    assert!(reconciler.add_peer(&guard, &key, "10.0.0.2/32", "alice").is_err());
    assert!(reconciler.read(&guard).unwrap().find("alice").is_some());

    reconciler.restore(&guard, &before).unwrap();
    assert_eq!(fs::read_to_string(reconciler.path()).unwrap(), SERVER_HEADER);
}

#[test]
fn used_addresses_come_from_peer_stanzas() {
    let (_dir, _control, reconciler, lock) = setup(SERVER_HEADER);
    let guard = lock.acquire().unwrap();
    for (i, name) in ["a", "b"].iter().enumerate() {
        let key = NativeKeys.generate_keypair().unwrap().public_key;
        reconciler
            .append_stanza(&guard, &key, &format!("10.0.0.{}/32", i + 2), name)
            .unwrap();
    }
    let used = reconciler
        .used_addresses(&guard, &"10.0.0.0/24".parse().unwrap())
        .unwrap();
    let used: Vec<String> = used.iter().map(ToString::to_string).collect();
    assert_eq!(used, vec!["10.0.0.2", "10.0.0.3"]);
}

#[test]
fn missing_server_config_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(FakeControl::default());
    let reconciler = ServerConfigReconciler::new(dir.path().join("absent.conf"), control);
    assert!(matches!(reconciler.snapshot(), Err(Error::Io(_))));
}
