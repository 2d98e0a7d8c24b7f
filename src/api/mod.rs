mod handler;
pub mod rpc;

use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::http_server::{HttpServerBuilder, HttpServerHandle};
use log::info;

pub use handler::ControlApi;
pub use rpc::{ControlClient, ControlServer, StatusSummary};

use crate::handler::ControlState;

/// Serve the control API (exit/pause/resume/is-paused/status) on the
/// unixctl address
pub async fn serve(
    addr: SocketAddr,
    state: Arc<ControlState>,
) -> Result<HttpServerHandle, jsonrpsee::core::Error> {
    let server = HttpServerBuilder::default().build(addr).await?;
    let handle = server.start(ControlApi::new(state).into_rpc())?;
    info!("control API listening on {}", addr);
    Ok(handle)
}
