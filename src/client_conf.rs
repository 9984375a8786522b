use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use ipnet::Ipv4Net;
use log::debug;

use crate::{
    atomic,
    error::{Error, Result},
    peer::PeerName,
};

const CATCH_ALL: &str = "0.0.0.0/0, ::/0";

/// Client half of a peer: what only the client may know.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub private_key: String,
    pub address: Ipv4Net,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("private_key", &"<redacted>")
            .field("address", &self.address)
            .finish()
    }
}

/// Server parameters every client config points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParams {
    pub public_key: String,
    pub endpoint: String,
    pub dns: String,
    pub persistent_keepalive: u16,
}

/**
 * @brief Render a client configuration document.
 * Pure and deterministic: identical inputs give byte-identical text.
 * @param peer Client private key and assigned address.
 * @param server Server public key, endpoint, DNS and keepalive.
 * @return WireGuard INI text.
 */
pub fn render_client_config(peer: &ClientIdentity, server: &ServerParams) -> String {
    let mut content = String::new();
    content.push_str("[Interface]\n");
    push_kv_line(&mut content, "PrivateKey", &peer.private_key);
    push_kv_line(&mut content, "Address", peer.address);
    let dns = server.dns.trim();
    if !dns.is_empty() {
        push_kv_line(&mut content, "DNS", dns);
    }
    content.push('\n');
    content.push_str("[Peer]\n");
    push_kv_line(&mut content, "PublicKey", &server.public_key);
    push_kv_line(&mut content, "AllowedIPs", CATCH_ALL);
    push_kv_line(&mut content, "Endpoint", &server.endpoint);
    if server.persistent_keepalive > 0 {
        push_kv_line(&mut content, "PersistentKeepalive", server.persistent_keepalive);
    }
    content
}

fn push_kv_line(content: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(content, "{key} = {value}");
}

/// `<clients_dir>/<name>/<name>.conf`
#[derive(Debug, Clone)]
pub struct ClientStore {
    pub root: PathBuf,
}

impl ClientStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, name: &PeerName) -> PathBuf {
        self.root.join(name.as_str())
    }

    pub fn path(&self, name: &PeerName) -> PathBuf {
        self.dir(name).join(format!("{name}.conf"))
    }

    pub fn exists(&self, name: &PeerName) -> bool {
        self.path(name).is_file()
    }

    /// Write the file atomically with owner-only permissions.
    pub fn write(&self, name: &PeerName, content: &str) -> Result<PathBuf> {
        let dir = self.dir(name);
        fs::create_dir_all(&dir)?;
        let path = self.path(name);
        let staged = atomic::stage(&path, content.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(staged.temp_path(), fs::Permissions::from_mode(0o600))?;
        }
        staged.commit()?;
        debug!("wrote {}", path.display());
        Ok(path)
    }

    pub fn read(&self, name: &PeerName) -> Result<String> {
        let path = self.path(name);
        fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound {
                name: format!("{name} (client config {})", path.display()),
            },
            _ => e.into(),
        })
    }

    /// Recover the client identity from an existing file.
    pub fn read_identity(&self, name: &PeerName) -> Result<ClientIdentity> {
        let content = self.read(name)?;
        parse_identity(&content).ok_or_else(|| {
            Error::Drift(format!(
                "client config {} has no usable PrivateKey/Address",
                self.path(name).display()
            ))
        })
    }

    /**
     * @brief Remove the peer's config file and its directory when left empty.
     * @return Whether a file was removed.
     */
    pub fn remove(&self, name: &PeerName) -> Result<bool> {
        let path = self.path(name);
        let removed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        // Directory may hold other user files; only drop it when empty.
        let _ = fs::remove_dir(self.dir(name));
        Ok(removed)
    }
}

fn parse_identity(content: &str) -> Option<ClientIdentity> {
    let mut in_interface = false;
    let mut private_key = None;
    let mut address = None;
    for line in content.lines().map(str::trim) {
        if line.starts_with('[') && line.ends_with(']') {
            in_interface = line.eq_ignore_ascii_case("[Interface]");
            continue;
        }
        if !in_interface {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let (k, v) = (k.trim(), v.trim());
        if k.eq_ignore_ascii_case("PrivateKey") {
            private_key = Some(v.to_string());
        } else if k.eq_ignore_ascii_case("Address") {
            address = v.split(',').find_map(|a| a.trim().parse::<Ipv4Net>().ok());
        }
    }
    Some(ClientIdentity {
        private_key: private_key?,
        address: address?,
    })
}
