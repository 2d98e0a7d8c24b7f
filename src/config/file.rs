use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;

use serde::Deserialize;

struct Defaults {}

impl Defaults {
    fn ovnnb_db() -> String {
        "unix:/var/run/ovn/ovnnb_db.sock".to_string()
    }

    fn ovnsb_db() -> String {
        "unix:/var/run/ovn/ovnsb_db.sock".to_string()
    }

    fn unixctl() -> SocketAddr {
        "127.0.0.1:8541".parse().expect("valid default socket")
    }

    fn poll_interval_ms() -> u64 {
        500
    }

    fn paused() -> bool {
        false
    }
}

/// Config (toml) representation of the daemon config
#[derive(Debug, Deserialize)]
pub(super) struct DaemonConfigSpec {
    // Northbound / southbound database locations
    #[serde(default = "Defaults::ovnnb_db")]
    pub(super) ovnnb_db: String,
    #[serde(default = "Defaults::ovnsb_db")]
    pub(super) ovnsb_db: String,

    // Control API socket
    #[serde(default = "Defaults::unixctl")]
    pub(super) unixctl: SocketAddr,

    // Main-loop poll interval
    #[serde(default = "Defaults::poll_interval_ms")]
    pub(super) poll_interval_ms: u64,

    // Start in the paused (standby) state
    #[serde(default = "Defaults::paused")]
    pub(super) paused: bool,
}

impl Default for DaemonConfigSpec {
    fn default() -> Self {
        DaemonConfigSpec {
            ovnnb_db: Defaults::ovnnb_db(),
            ovnsb_db: Defaults::ovnsb_db(),
            unixctl: Defaults::unixctl(),
            poll_interval_ms: Defaults::poll_interval_ms(),
            paused: Defaults::paused(),
        }
    }
}

impl DaemonConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        toml::from_str(&contents).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let spec: DaemonConfigSpec = toml::from_str("").unwrap();
        assert_eq!(spec.poll_interval_ms, 500);
        assert!(!spec.paused);
        assert!(spec.ovnnb_db.contains("ovnnb"));
    }

    #[test]
    fn test_partial_file() {
        let spec: DaemonConfigSpec =
            toml::from_str("unixctl = \"127.0.0.1:9000\"\npaused = true\n").unwrap();
        assert_eq!(spec.unixctl.port(), 9000);
        assert!(spec.paused);
        assert_eq!(spec.poll_interval_ms, 500);
    }
}
