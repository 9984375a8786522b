use std::{io::Write, path::PathBuf, time::Duration};

use log::{debug, info};
use serde::Serialize;

use crate::{
    config::{ManagerConfig, ReloadMode},
    error::{Error, Result},
    exec,
};

const CMD_SYSTEMCTL: &str = "systemctl";
const CMD_WG: &str = "wg";
const CMD_WG_QUICK: &str = "wg-quick";
const ACTIVE_MARKER: &str = "Active: active";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub is_active: bool,
    pub detail: String,
}

/// Everything the core needs from the WireGuard toolset and the service supervisor.
/// Tests substitute a fake; production uses [`SystemdInterface`].
pub trait InterfaceControl: Send + Sync {
    /// Apply the on-disk server configuration to the live interface.
    /// Fails unless the service reports active afterwards.
    fn reload(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn restart(&self) -> Result<()>;
    fn service_status(&self) -> Result<ServiceStatus>;
    /// Text of `wg show <iface>`.
    fn peer_dump(&self) -> Result<String>;
}

/// `wg-quick@<iface>` managed by systemd.
#[derive(Debug, Clone)]
pub struct SystemdInterface {
    pub interface: String,
    pub unit: String,
    pub config_path: PathBuf,
    pub reload_mode: ReloadMode,
    pub timeout: Duration,
}

impl SystemdInterface {
    pub fn from_config(cfg: &ManagerConfig) -> Self {
        Self {
            interface: cfg.interface_name.clone(),
            unit: cfg.service_unit.clone(),
            config_path: cfg.server_config_path.clone(),
            reload_mode: cfg.reload_mode,
            timeout: cfg.command_timeout(),
        }
    }

    fn systemctl(&self, action: &str) -> Result<()> {
        exec::run_checked(CMD_SYSTEMCTL, &[action, &self.unit], None, self.timeout)?;
        Ok(())
    }

    fn syncconf(&self) -> Result<()> {
        let config_path = self.config_path.to_string_lossy();
        let stripped = exec::run_checked(CMD_WG_QUICK, &["strip", &config_path], None, self.timeout)?;
        let mut temp = tempfile::Builder::new()
            .prefix("wg-peer-manager-")
            .suffix(".stripped")
            .tempfile()?;
        temp.write_all(&stripped.stdout)?;
        temp.as_file().sync_all()?;
        let temp_path = temp.path().to_string_lossy().into_owned();
        exec::run_checked(
            CMD_WG,
            &["syncconf", &self.interface, &temp_path],
            None,
            self.timeout,
        )?;
        Ok(())
    }
}

impl InterfaceControl for SystemdInterface {
    fn reload(&self) -> Result<()> {
        match self.reload_mode {
            ReloadMode::Restart => self.restart()?,
            ReloadMode::Syncconf => {
                if self.service_status()?.is_active {
                    self.syncconf()?;
                } else {
                    debug!("{} is down, starting instead of syncconf", self.unit);
                    self.start()?;
                }
            }
        }
        let status = self.service_status()?;
        if !status.is_active {
            return Err(Error::ExternalTool {
                command: format!("reload {}", self.unit),
                detail: status.detail,
            });
        }
        info!("Reloaded {}", self.interface);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.systemctl("start")
    }

    fn stop(&self) -> Result<()> {
        self.systemctl("stop")
    }

    fn restart(&self) -> Result<()> {
        self.systemctl("restart")
    }

    fn service_status(&self) -> Result<ServiceStatus> {
        // `systemctl status` exits non-zero for inactive units; that is a status, not a failure.
        let output = exec::run(CMD_SYSTEMCTL, &["status", &self.unit], None, self.timeout)?;
        Ok(parse_service_status(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    fn peer_dump(&self) -> Result<String> {
        let output = exec::run_checked(CMD_WG, &["show", &self.interface], None, self.timeout)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub fn parse_service_status(stdout: &str, stderr: &str) -> ServiceStatus {
    let is_active = stdout.contains(ACTIVE_MARKER);
    let detail = stdout
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("Active:"))
        .map(str::to_string)
        .or_else(|| {
            let e = stderr.trim();
            (!e.is_empty()).then(|| e.to_string())
        })
        .unwrap_or_else(|| "no status reported".to_string());
    ServiceStatus { is_active, detail }
}

/// Required executables that are not on PATH.
#[must_use]
pub fn missing_dependencies() -> Vec<&'static str> {
    [CMD_WG, CMD_WG_QUICK, CMD_SYSTEMCTL]
        .into_iter()
        .filter(|cmd| which::which(cmd).is_err())
        .collect()
}
