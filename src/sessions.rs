//! Connection history per peer.
//!
//! The monitor opens a session when a peer's handshake turns fresh and closes it when the
//! handshake goes stale. Each session remembers the interface counters at connect time so
//! the bytes moved during the session survive counter resets between polls.

use std::{fs, path::PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    atomic,
    error::{Error, Result},
    lock::ConfigLock,
    peer::PeerName,
};

/// Days covered by [`OverallStats::daily`], today included.
pub const DAILY_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub peer: PeerName,
    pub endpoint: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    rx_at_connect: u64,
    tx_at_connect: u64,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.disconnected_at.is_none()
    }

    /// Length of the session; open sessions are measured up to `now`.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        let end = self.disconnected_at.unwrap_or(now);
        (end - self.connected_at).max(Duration::zero())
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_received.saturating_add(self.bytes_sent)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub received: u64,
    pub sent: u64,
}

impl Usage {
    fn add(&mut self, s: &Session) {
        self.received = self.received.saturating_add(s.bytes_received);
        self.sent = self.sent.saturating_add(s.bytes_sent);
    }

    pub fn total(&self) -> u64 {
        self.received.saturating_add(self.sent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyStats {
    pub day: NaiveDate,
    pub connections: usize,
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OverallStats {
    pub connections: usize,
    pub usage: Usage,
    pub active_sessions: usize,
    /// Newest day first; days without connections are left out.
    pub daily: Vec<DailyStats>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    sessions: Vec<Session>,
}

/// Session history kept as one JSON document next to the registry.
pub struct SessionLog {
    path: PathBuf,
    lock: ConfigLock,
}

impl SessionLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock: ConfigLock::for_file(&path),
            path,
        }
    }

    fn load(&self) -> Result<SessionFile> {
        match fs::read_to_string(&self.path) {
            Ok(s) if s.trim().is_empty() => Ok(SessionFile::default()),
            Ok(s) => serde_json::from_str(&s)
                .map_err(|e| Error::Sessions(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SessionFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn modify<T>(&self, f: impl FnOnce(&mut SessionFile) -> T) -> Result<T> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let _guard = self.lock.acquire()?;
        let mut file = self.load()?;
        let out = f(&mut file);
        let body = serde_json::to_vec_pretty(&file).map_err(|e| Error::Sessions(e.to_string()))?;
        atomic::write(&self.path, &body)?;
        Ok(out)
    }

    /**
     * @brief Open a session for `peer` unless one is already open.
     * @param rx Interface receive counter at connect time.
     * @param tx Interface send counter at connect time.
     * @return Id of the open session.
     */
    pub fn log_connection(
        &self,
        peer: &PeerName,
        endpoint: Option<&str>,
        at: DateTime<Utc>,
        rx: u64,
        tx: u64,
    ) -> Result<u64> {
        self.modify(|file| {
            if let Some(open) = file.sessions.iter().find(|s| &s.peer == peer && s.is_open()) {
                return open.id;
            }
            file.next_id += 1;
            let id = file.next_id;
            file.sessions.push(Session {
                id,
                peer: peer.clone(),
                endpoint: endpoint.map(str::to_string),
                connected_at: at,
                disconnected_at: None,
                bytes_received: 0,
                bytes_sent: 0,
                rx_at_connect: rx,
                tx_at_connect: tx,
            });
            debug!("sessions: opened #{id} for {peer}");
            id
        })
    }

    /**
     * @brief Close the open session of `peer`.
     * @param counters Current interface counters, when the peer is still listed.
     * @return The closed session, or `None` when nothing was open.
     */
    pub fn log_disconnection(
        &self,
        peer: &PeerName,
        at: DateTime<Utc>,
        counters: Option<(u64, u64)>,
    ) -> Result<Option<Session>> {
        self.modify(|file| {
            let open = file
                .sessions
                .iter_mut()
                .find(|s| &s.peer == peer && s.is_open())?;
            open.disconnected_at = Some(at.max(open.connected_at));
            if let Some((rx, tx)) = counters {
                open.bytes_received = moved(open.rx_at_connect, rx);
                open.bytes_sent = moved(open.tx_at_connect, tx);
            }
            debug!("sessions: closed #{} for {peer}", open.id);
            Some(open.clone())
        })
    }

    /// Drop the whole history of a peer. Returns how many sessions went.
    pub fn purge(&self, peer: &PeerName) -> Result<usize> {
        self.modify(|file| {
            let before = file.sessions.len();
            file.sessions.retain(|s| &s.peer != peer);
            before - file.sessions.len()
        })
    }

    /// Most recent sessions of `peer`, newest first.
    pub fn history(&self, peer: &PeerName, limit: usize) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .load()?
            .sessions
            .into_iter()
            .filter(|s| &s.peer == peer)
            .collect();
        sessions.sort_by(|a, b| b.connected_at.cmp(&a.connected_at).then(b.id.cmp(&a.id)));
        sessions.truncate(limit);
        Ok(sessions)
    }

    pub fn usage_total(&self, peer: &PeerName) -> Result<Usage> {
        let mut usage = Usage::default();
        for s in self.load()?.sessions.iter().filter(|s| &s.peer == peer) {
            usage.add(s);
        }
        Ok(usage)
    }

    /// Usage of sessions of `peer` that started within `[from, to)`.
    pub fn usage_between(&self, peer: &PeerName, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Usage> {
        let mut usage = Usage::default();
        for s in self
            .load()?
            .sessions
            .iter()
            .filter(|s| &s.peer == peer && s.connected_at >= from && s.connected_at < to)
        {
            usage.add(s);
        }
        Ok(usage)
    }

    /// Totals across every peer plus a per-day breakdown of the last [`DAILY_WINDOW_DAYS`].
    pub fn overall(&self, now: DateTime<Utc>) -> Result<OverallStats> {
        let file = self.load()?;
        let first_day = (now - Duration::days(DAILY_WINDOW_DAYS - 1)).date_naive();
        let mut stats = OverallStats {
            connections: file.sessions.len(),
            active_sessions: file.sessions.iter().filter(|s| s.is_open()).count(),
            ..Default::default()
        };

        for s in &file.sessions {
            stats.usage.add(s);
            let day = s.connected_at.date_naive();
            if day < first_day || day > now.date_naive() {
                continue;
            }
            match stats.daily.iter_mut().find(|d| d.day == day) {
                Some(d) => {
                    d.connections += 1;
                    d.usage.add(s);
                }
                None => {
                    let mut usage = Usage::default();
                    usage.add(s);
                    stats.daily.push(DailyStats {
                        day,
                        connections: 1,
                        usage,
                    });
                }
            }
        }
        stats.daily.sort_by(|a, b| b.day.cmp(&a.day));
        Ok(stats)
    }
}

/// Bytes moved since `start`; a lower reading means the interface restarted in between.
fn moved(start: u64, now: u64) -> u64 {
    if now >= start {
        now - start
    } else {
        now
    }
}
