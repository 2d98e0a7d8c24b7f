use std::sync::Arc;

use jsonrpsee::core::{async_trait, RpcResult};
use log::info;

use super::rpc::{ControlServer, StatusSummary};
use crate::handler::ControlState;

/// Control-API server backed by the daemon's shared state
pub struct ControlApi {
    state: Arc<ControlState>,
}

impl ControlApi {
    pub fn new(state: Arc<ControlState>) -> Self {
        ControlApi { state }
    }
}

#[async_trait]
impl ControlServer for ControlApi {
    async fn exit(&self) -> RpcResult<()> {
        info!("exit requested via control socket");
        self.state.request_exit();
        Ok(())
    }

    async fn pause(&self) -> RpcResult<()> {
        info!("pause requested via control socket");
        self.state.set_paused(true);
        Ok(())
    }

    async fn resume(&self) -> RpcResult<()> {
        info!("resume requested via control socket");
        self.state.set_paused(false);
        Ok(())
    }

    async fn is_paused(&self) -> RpcResult<bool> {
        Ok(self.state.is_paused())
    }

    async fn status(&self) -> RpcResult<StatusSummary> {
        Ok(self.state.summary())
    }
}
