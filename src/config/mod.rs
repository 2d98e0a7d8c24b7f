mod file;

use std::io::Result;
use std::net::SocketAddr;

/// Runtime daemon configuration, assembled from the optional TOML file
/// with CLI flags layered on top
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub ovnnb_db: String,
    pub ovnsb_db: String,
    pub unixctl: SocketAddr,
    pub poll_interval_ms: u64,
    pub start_paused: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig::from_spec(file::DaemonConfigSpec::default())
    }
}

impl DaemonConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        Ok(DaemonConfig::from_spec(file::DaemonConfigSpec::from_file(
            path,
        )?))
    }

    fn from_spec(spec: file::DaemonConfigSpec) -> Self {
        DaemonConfig {
            ovnnb_db: spec.ovnnb_db,
            ovnsb_db: spec.ovnsb_db,
            unixctl: spec.unixctl,
            poll_interval_ms: spec.poll_interval_ms,
            start_paused: spec.paused,
        }
    }
}
