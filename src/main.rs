use std::{fs, path::PathBuf, process::ExitCode};

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use log::error;

use wg_peer_manager::{
    config::{load_manager_config, ManagerConfig},
    control::missing_dependencies,
    keys,
    lifecycle::{CancelToken, PeerLifecycleManager},
    monitor::{cancel_on_ctrlc, Monitor},
    peer::{PeerName, PeerRequest},
    Error, Result,
};

#[derive(Parser)]
#[command(name = "wg-peer-manager")]
#[command(version, about = "WireGuard peer lifecycle manager")]
struct Cli {
    /// Manager configuration file (written with defaults when missing).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Write the default configuration and prepare the client directory.
    Init,
    Create {
        name: String,
        #[arg(long)]
        user_id: Option<i64>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long, conflicts_with = "no_expiry")]
        expires_in_days: Option<u32>,
        #[arg(long)]
        no_expiry: bool,
        /// Bytes; 0 or absent means unlimited.
        #[arg(long)]
        data_limit: Option<u64>,
    },
    Delete { name: String },
    Activate { name: String },
    Deactivate { name: String },
    Block { name: String },
    Unblock { name: String },
    List,
    /// Print a peer's client config.
    Show { name: String },
    /// Rewrite a peer's client config file from current settings.
    Regenerate { name: String },
    Status,
    /// Connection history of one peer, or totals for all of them.
    Stats {
        name: Option<String>,
        /// Sessions to list.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Only count sessions started in the last N days.
        #[arg(long)]
        days: Option<u32>,
    },
    Reconcile,
    Monitor {
        /// Run a single poll and exit.
        #[arg(long)]
        once: bool,
    },
    Start,
    Stop,
    Restart,
    /// Report missing external tools.
    Doctor,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_user_facing() => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e:?}");
            eprintln!("Operation failed: {e}. See the log for details.");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cfg = load_manager_config(cli.config.as_deref())?;
    if let Cmd::Init = cli.cmd {
        return init(&cfg);
    }
    if let Cmd::Doctor = cli.cmd {
        return doctor(&cfg);
    }

    let cancel = CancelToken::default();
    let manager = PeerLifecycleManager::from_config(cfg.clone()).with_cancel(cancel.clone());

    match cli.cmd {
        Cmd::Init | Cmd::Doctor => {}
        Cmd::Create {
            name,
            user_id,
            email,
            expires_in_days,
            no_expiry,
            data_limit,
        } => {
            let mut req = PeerRequest::new(PeerName::parse(&name)?);
            req.owner_id = user_id;
            req.email = email;
            req.data_limit = data_limit.filter(|l| *l > 0);
            let days = if no_expiry {
                None
            } else {
                expires_in_days.or(cfg.default_expiry_days)
            };
            req.expires_at = days.map(|d| Utc::now() + ChronoDuration::days(i64::from(d)));
            cancel_on_ctrlc(&cancel)?;
            let created = manager.create(req)?;
            println!(
                "Created {} at {} ({})",
                created.record.name,
                created.record.address,
                created.config_path.display()
            );
        }
        Cmd::Delete { name } => {
            let report = manager.delete(&PeerName::parse(&name)?)?;
            println!("Deleted {}", report.record.name);
        }
        Cmd::Activate { name } => print_state(&manager.activate(&PeerName::parse(&name)?)?),
        Cmd::Deactivate { name } => print_state(&manager.deactivate(&PeerName::parse(&name)?)?),
        Cmd::Block { name } => print_state(&manager.block(&PeerName::parse(&name)?)?),
        Cmd::Unblock { name } => print_state(&manager.unblock(&PeerName::parse(&name)?)?),
        Cmd::List => {
            for r in manager.registry().list()? {
                println!(
                    "{:<20} {:<18} {:<9} {:>12} {}",
                    r.name.as_str(),
                    r.address.to_string(),
                    r.state_label(),
                    r.data_used,
                    r.expires_at
                        .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d").to_string()),
                );
            }
        }
        Cmd::Show { name } => print!("{}", manager.client_config(&PeerName::parse(&name)?)?),
        Cmd::Regenerate { name } => {
            let path = manager.regenerate(&PeerName::parse(&name)?)?;
            println!("Rewrote {}", path.display());
        }
        Cmd::Status => {
            let service = manager.status().service_status()?;
            println!(
                "{}: {}",
                cfg.service_unit,
                if service.is_active { "active" } else { "inactive" }
            );
            for (name, p) in manager.peer_statuses()? {
                println!(
                    "{:<20} {}... {} {} KB {} KB",
                    name.as_ref().map_or("<unknown>", PeerName::as_str),
                    keys::short(&p.public_key),
                    p.latest_handshake.as_deref().unwrap_or("never"),
                    p.bytes_received / 1024,
                    p.bytes_sent / 1024
                );
            }
        }
        Cmd::Stats { name: Some(name), limit, days } => {
            let name = PeerName::parse(&name)?;
            manager.registry().require(&name)?;
            let sessions = manager.sessions();
            let now = Utc::now();
            for s in sessions.history(&name, limit)? {
                println!(
                    "{} {:<8} {:>6}s {:>10} B in {:>10} B out {}",
                    s.connected_at.format("%Y-%m-%d %H:%M:%S"),
                    if s.is_open() { "open" } else { "closed" },
                    s.duration(now).num_seconds(),
                    s.bytes_received,
                    s.bytes_sent,
                    s.endpoint.as_deref().unwrap_or("-"),
                );
            }
            let usage = match days {
                Some(d) => sessions.usage_between(&name, now - ChronoDuration::days(i64::from(d)), now)?,
                None => sessions.usage_total(&name)?,
            };
            println!("total: {} B in, {} B out", usage.received, usage.sent);
        }
        Cmd::Stats { name: None, .. } => {
            let stats = manager.sessions().overall(Utc::now())?;
            println!(
                "connections {} active {} received {} B sent {} B",
                stats.connections, stats.active_sessions, stats.usage.received, stats.usage.sent
            );
            for d in &stats.daily {
                println!(
                    "{} {:>4} connections {:>12} B in {:>12} B out",
                    d.day, d.connections, d.usage.received, d.usage.sent
                );
            }
        }
        Cmd::Reconcile => {
            let report = manager.reconcile()?;
            if report.is_clean() {
                println!("Registry and server config agree");
            }
            for action in &report.actions {
                println!("{action}");
            }
        }
        Cmd::Monitor { once } => {
            let mut monitor = Monitor::new(&manager);
            if once {
                let report = monitor.poll_once(Utc::now())?;
                println!(
                    "accounted {} connected {} disconnected {} deactivated {} blocked {} failures {}",
                    report.accounted,
                    report.connected.len(),
                    report.disconnected.len(),
                    report.deactivated.len(),
                    report.blocked.len(),
                    report.failures
                );
            } else {
                cancel_on_ctrlc(&cancel)?;
                monitor.run(cfg.poll_interval(), &cancel)?;
            }
        }
        Cmd::Start => manager.control().start()?,
        Cmd::Stop => manager.control().stop()?,
        Cmd::Restart => manager.control().restart()?,
    }
    Ok(())
}

fn print_state(record: &wg_peer_manager::peer::PeerRecord) {
    println!("{} is {} ({})", record.name, record.state_label(), record.address);
}

fn init(cfg: &ManagerConfig) -> Result<()> {
    fs::create_dir_all(&cfg.clients_dir)?;
    println!("Clients directory: {}", cfg.clients_dir.display());
    match cfg.server_public_key() {
        Ok(key) => println!("Server public key: {key}"),
        Err(e) => eprintln!("Server key not available yet: {e}"),
    }
    doctor(cfg)
}

fn doctor(cfg: &ManagerConfig) -> Result<()> {
    let missing = missing_dependencies();
    if missing.is_empty() {
        println!("All required tools found");
    } else {
        println!("Missing tools: {}", missing.join(", "));
    }
    if !cfg.server_config_path.exists() {
        println!("Server config {} does not exist", cfg.server_config_path.display());
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "install {} before managing peers",
            missing.join(", ")
        )))
    }
}
