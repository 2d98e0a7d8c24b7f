use chrono::{DateTime, Utc};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{Deserialize, Serialize};

#[rpc(client, server)]
pub trait Control {
    /// Stop the daemon after the in-flight iteration
    #[method(name = "exit")]
    async fn exit(&self) -> RpcResult<()>;

    /// Keep reading the databases but stop committing
    #[method(name = "pause")]
    async fn pause(&self) -> RpcResult<()>;

    #[method(name = "resume")]
    async fn resume(&self) -> RpcResult<()>;

    #[method(name = "is_paused")]
    async fn is_paused(&self) -> RpcResult<bool>;

    #[method(name = "status")]
    async fn status(&self) -> RpcResult<StatusSummary>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusSummary {
    pub paused: bool,
    pub has_lock: bool,
    pub exiting: bool,
    pub iterations: u64,
    /// Row operations committed by the most recent iteration
    pub last_nb_ops: usize,
    pub last_sb_ops: usize,
    pub started_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}
