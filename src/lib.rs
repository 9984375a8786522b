/* \page PeerManagerOverview Peer Manager Overview
WireGuard peer lifecycle and server configuration reconciliation.

- Configuration loading and validation (`config.rs`).
- Peer names, records and requests (`peer.rs`), persisted by the registry (`registry.rs`).
- Key generation through `wg` or natively (`keys.rs`), external commands with timeouts (`exec.rs`).
- Address allocation from the VPN subnet (`allocator.rs`).
- Client config rendering and storage (`client_conf.rs`).
- Server config parsing with tagged peer stanzas (`server_conf.rs`), atomic writes (`atomic.rs`),
  locking (`lock.rs`) and the guarded reconciler on top (`reconciler.rs`).
- Interface supervision (`control.rs`) and live peer status (`status.rs`).
- Create/delete/update state machines with rollback and startup reconciliation (`lifecycle.rs`).
- Usage accounting, expiry and data-limit enforcement (`monitor.rs`), with per-peer
  connection history and traffic statistics (`sessions.rs`).
- Audit trail of committed operations (`audit.rs`).
*/
pub mod allocator;
pub mod atomic;
pub mod audit;
pub mod client_conf;
pub mod config;
pub mod control;
pub mod error;
pub mod exec;
pub mod keys;
pub mod lifecycle;
pub mod lock;
pub mod monitor;
pub mod peer;
pub mod reconciler;
pub mod registry;
pub mod server_conf;
pub mod sessions;
pub mod status;

pub use error::{Error, Result};
pub use lifecycle::{CancelToken, Operation, PeerLifecycleManager, Stage};
