use std::fs;

use wg_peer_manager::{
    config::{load_manager_config, KeyBackend, ReloadMode, StatusBackend},
    Error,
};

#[test]
fn default_config_is_written_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("wg-peer-manager.toml");
    let cfg = load_manager_config(Some(&p)).unwrap();
    assert!(p.exists());
    assert_eq!(cfg.interface_name, "wg0");
    assert_eq!(cfg.service_unit, "wg-quick@wg0");
    assert_eq!(cfg.subnet.to_string(), "10.0.0.0/24");
    assert_eq!(cfg.server_address.to_string(), "10.0.0.1");
    assert_eq!(cfg.persistent_keepalive, 25);
    assert_eq!(cfg.default_expiry_days, Some(30));
    assert_eq!(cfg.sessions_path.to_str(), Some("sessions.json"));
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("manager.toml");
    load_manager_config(Some(&p)).unwrap();
    let text = fs::read_to_string(&p)
        .unwrap()
        .replace("endpoint_host = \"127.0.0.1\"", "endpoint_host = \"vpn.example.com\"")
        .replace("key_backend = \"wg-tool\"", "key_backend = \"native\"")
        .replace("reload_mode = \"restart\"", "reload_mode = \"syncconf\"")
        .replace("status_backend = \"wg-show\"", "status_backend = \"netlink\"");
    fs::write(&p, text).unwrap();

    let cfg = load_manager_config(Some(&p)).unwrap();
    assert_eq!(cfg.endpoint(), "vpn.example.com:51820");
    assert_eq!(cfg.key_backend, KeyBackend::Native);
    assert_eq!(cfg.reload_mode, ReloadMode::Syncconf);
    assert_eq!(cfg.status_backend, StatusBackend::Netlink);
}

#[test]
fn invalid_values_are_rejected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("manager.toml");
    load_manager_config(Some(&p)).unwrap();
    let text = fs::read_to_string(&p)
        .unwrap()
        .replace("server_address = \"10.0.0.1\"", "server_address = \"192.168.7.1\"");
    fs::write(&p, text).unwrap();
    assert!(matches!(load_manager_config(Some(&p)), Err(Error::Config(_))));

    fs::write(&p, "interface_name = [").unwrap();
    assert!(matches!(load_manager_config(Some(&p)), Err(Error::Config(_))));
}
