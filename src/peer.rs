use std::fmt;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 64;

/// Peer name: ASCII letters, digits and `_`. Used verbatim in file names and marker comments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerName(String);

impl PeerName {
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Peer name is required".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::Validation(format!(
                "Peer name is longer than {MAX_NAME_LEN} characters"
            )));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Validation(
                "Peer name may only contain letters, digits and '_'".into(),
            ));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PeerName> for String {
    fn from(value: PeerName) -> Self {
        value.0
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    /// Intent recorded; artifacts may be partially written.
    Pending,
    Committed,
}

/// Registry view of a peer. The private key is deliberately absent: it lives only in the
/// peer's client config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub name: PeerName,
    pub public_key: String,
    pub address: Ipv4Net,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_blocked: bool,
    pub data_used: u64,
    pub data_limit: Option<u64>,
    pub last_connection: Option<DateTime<Utc>>,
    pub owner_id: Option<i64>,
    pub email: Option<String>,
    pub provision: ProvisionState,
    /// Last rx+tx counter seen on the interface, for usage deltas.
    #[serde(default)]
    pub counter_snapshot: Option<u64>,
    /// Bumped by the registry on every successful update.
    #[serde(default)]
    pub revision: u64,
}

impl PeerRecord {
    /// Traffic should be routed: active and not blocked. Blocking wins.
    pub fn is_routable(&self) -> bool {
        self.is_active && !self.is_blocked
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    pub fn over_limit(&self) -> bool {
        self.data_limit
            .is_some_and(|limit| limit > 0 && self.data_used >= limit)
    }

    /**
     * @brief Add transferred bytes to the usage counter.
     * @param bytes Bytes transferred since the last accounting.
     * @param at Time of the observation, recorded as last connection.
     */
    pub fn add_usage(&mut self, bytes: u64, at: DateTime<Utc>) {
        self.data_used = self.data_used.saturating_add(bytes);
        if bytes > 0 {
            self.last_connection = Some(at);
        }
    }

    pub fn state_label(&self) -> &'static str {
        match (self.provision, self.is_active, self.is_blocked) {
            (ProvisionState::Pending, _, _) => "pending",
            (_, _, true) => "blocked",
            (_, true, false) => "active",
            (_, false, false) => "inactive",
        }
    }
}

/// Administrative request to provision a new peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRequest {
    pub name: PeerName,
    pub owner_id: Option<i64>,
    pub email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub data_limit: Option<u64>,
}

impl PeerRequest {
    pub fn new(name: PeerName) -> Self {
        Self {
            name,
            owner_id: None,
            email: None,
            expires_at: None,
            data_limit: None,
        }
    }
}
