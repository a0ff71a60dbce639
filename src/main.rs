use std::net::SocketAddr;

use futures::future::join_all;
use thiserror::Error;

use crate::util::telemetry;

mod api;
mod db;
mod leaderboard;
mod settlement;
mod util;
mod wager;

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Server(#[from] api::server::ServerError),

    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error>),
}

type Result<T> = core::result::Result<T, RunnerErr>;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry_registry = telemetry::Telemetry::new().await?.register()?;

    tracing::info!("starting main application");

    let (tx_server_ready, rx_server_ready) = tokio::sync::mpsc::unbounded_channel::<SocketAddr>();
    let handles = api::server::start_server(tx_server_ready, rx_server_ready).await?;

    _ = join_all(handles).await;

    telemetry_registry.shutdown();
    Ok(())
}
