//! WiFi capability on a Linux host.
//!
//! The OS supplicant (wpa_supplicant / NetworkManager) owns association;
//! the node only observes it. [`SysfsInterface`] reports an interface as
//! associated when `/sys/class/net/<iface>/operstate` reads `up`.

use crate::link::{LinkError, WifiRadio};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct SysfsInterface {
    interface: String,
    operstate: PathBuf,
}

impl SysfsInterface {
    pub fn new(interface: &str) -> Self {
        Self::with_root(interface, "/sys/class/net")
    }

    /// Read state from `<root>/<iface>/operstate` instead of `/sys/class/net`.
    pub fn with_root(interface: &str, root: impl Into<PathBuf>) -> Self {
        let operstate = root.into().join(interface).join("operstate");
        Self {
            interface: interface.to_string(),
            operstate,
        }
    }
}

impl WifiRadio for SysfsInterface {
    fn begin(&mut self, ssid: &str, _password: &str) -> Result<(), LinkError> {
        if !self.operstate.exists() {
            warn!(interface = %self.interface, "network interface not present");
            return Err(LinkError::Radio(format!(
                "no such interface: {}",
                self.interface
            )));
        }
        info!(interface = %self.interface, ssid, "waiting for supplicant association");
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        match fs::read_to_string(&self.operstate) {
            Ok(state) => state.trim() == "up",
            Err(e) => {
                debug!(error = %e, "operstate unreadable");
                false
            }
        }
    }
}

/// Always-associated uplink for dry runs and development hosts.
#[derive(Default)]
pub struct StaticUplink;

impl WifiRadio for StaticUplink {
    fn begin(&mut self, _ssid: &str, _password: &str) -> Result<(), LinkError> {
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        true
    }
}
