//! Periodic usage accounting and policy enforcement.
//!
//! Each poll reads the live peer counters, folds them into the registry, opens or closes
//! connection sessions as handshakes turn fresh or stale, then deactivates expired peers
//! and blocks peers over their data limit through the lifecycle manager.

use std::{
    collections::{HashMap, HashSet},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    lifecycle::{CancelToken, PeerLifecycleManager},
    peer::PeerName,
    status::PeerStatus,
};

const SLEEP_STEP: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub accounted: usize,
    pub connected: Vec<PeerName>,
    pub disconnected: Vec<PeerName>,
    pub deactivated: Vec<PeerName>,
    pub blocked: Vec<PeerName>,
    pub failures: usize,
}

pub struct Monitor<'a> {
    manager: &'a PeerLifecycleManager,
    connected: HashSet<PeerName>,
}

impl<'a> Monitor<'a> {
    pub fn new(manager: &'a PeerLifecycleManager) -> Self {
        Self {
            manager,
            connected: HashSet::new(),
        }
    }

    /**
     * @brief One accounting and enforcement pass.
     * @param now Reference time for expiry checks.
     * @return What changed; per-peer failures are logged and counted, not returned.
     */
    pub fn poll_once(&mut self, now: DateTime<Utc>) -> Result<MonitorReport> {
        let live: HashMap<String, PeerStatus> = self
            .manager
            .status()
            .list_active_peers()?
            .into_iter()
            .map(|p| (p.public_key.clone(), p))
            .collect();
        let mut report = MonitorReport::default();

        for record in self.manager.registry().list()? {
            let name = record.name.clone();
            let peer = live.get(&record.public_key);
            if let Err(e) = self.track_connection(&name, peer, now, &mut report) {
                error!("session tracking for {name}: {e}");
                report.failures += 1;
            }
            if let Some(peer) = peer {
                let total = peer.total_bytes();
                if record.counter_snapshot != Some(total) {
                    match self.manager.account_counters(&name, total, now) {
                        Ok(_) => report.accounted += 1,
                        Err(e) => {
                            error!("usage accounting for {name}: {e}");
                            report.failures += 1;
                        }
                    }
                }
            }

            let Some(record) = self.manager.registry().get(&name)? else {
                continue;
            };
            if record.is_routable() && record.is_expired(now) {
                info!("{name} expired, deactivating");
                match self.manager.deactivate(&name) {
                    Ok(_) => report.deactivated.push(name.clone()),
                    Err(e) => {
                        error!("deactivating expired {name}: {e}");
                        report.failures += 1;
                    }
                }
            }
            if !record.is_blocked && record.over_limit() {
                info!("{name} reached its data limit, blocking");
                match self.manager.block(&name) {
                    Ok(_) => report.blocked.push(name),
                    Err(e) => {
                        error!("blocking {name}: {e}");
                        report.failures += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    fn track_connection(
        &mut self,
        name: &PeerName,
        peer: Option<&PeerStatus>,
        now: DateTime<Utc>,
        report: &mut MonitorReport,
    ) -> Result<()> {
        let was = self.connected.contains(name);
        let online = peer.is_some_and(|p| p.is_online(now));
        let sessions = self.manager.sessions();
        match (was, online, peer) {
            (false, true, Some(peer)) => {
                let endpoint = peer.endpoint.as_deref();
                info!("Client connected: {name} ({})", endpoint.unwrap_or("unknown"));
                sessions.log_connection(name, endpoint, now, peer.bytes_received, peer.bytes_sent)?;
                self.connected.insert(name.clone());
                report.connected.push(name.clone());
            }
            (true, false, _) => {
                info!("Client disconnected: {name}");
                let counters = peer.map(|p| (p.bytes_received, p.bytes_sent));
                sessions.log_disconnection(name, now, counters)?;
                self.connected.remove(name);
                report.disconnected.push(name.clone());
            }
            _ => {}
        }
        Ok(())
    }

    /**
     * @brief Poll until cancelled.
     * A failed poll is logged and retried on the next tick.
     */
    pub fn run(&mut self, interval: Duration, cancel: &CancelToken) -> Result<()> {
        info!("monitoring every {}s", interval.as_secs());
        while !cancel.is_cancelled() {
            match self.poll_once(Utc::now()) {
                Ok(r) => debug!("poll: {r:?}"),
                Err(e) => warn!("poll failed: {e}"),
            }
            let started = Instant::now();
            while started.elapsed() < interval && !cancel.is_cancelled() {
                thread::sleep(SLEEP_STEP.min(interval));
            }
        }
        info!("monitor stopped");
        Ok(())
    }
}

/// Cancel `token` on Ctrl+C. In-flight operations stop at their next stage boundary.
pub fn cancel_on_ctrlc(token: &CancelToken) -> Result<()> {
    let t = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, stopping...");
        t.cancel();
    })
    .map_err(|e| Error::Io(std::io::Error::other(e)))
}
