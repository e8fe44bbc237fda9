//! Server start-up for the emulated OLT.
//!
//! The `Openolt` and `Simulator` services run on their own listeners and stop
//! when the shared cancellation token fires. Each has a variant taking an
//! already bound listener so tests can use ephemeral ports.

use crate::config::SimConfig;
use crate::devices::olt::OltDevice;
use crate::error::SimResult;
use crate::grpc::{ApiService, OpenoltServer, OpenoltService, SimulatorServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info};

/// Serve `Openolt` for `olt` on `addr` until `cancel` fires
pub async fn serve_openolt(
    olt: Arc<OltDevice>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> SimResult<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_openolt_on(olt, listener, cancel).await
}

/// Serve `Openolt` on a bound listener until `cancel` fires
pub async fn serve_openolt_on(
    olt: Arc<OltDevice>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> SimResult<()> {
    info!(address = %listener.local_addr()?, "Openolt gRPC server listening");
    Server::builder()
        .add_service(OpenoltServer::new(OpenoltService::new(olt)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), cancel.cancelled())
        .await?;
    info!("Openolt gRPC server stopped");
    Ok(())
}

/// Serve the admin API for `olt` on `addr` until `cancel` fires
pub async fn serve_api(
    olt: Arc<OltDevice>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> SimResult<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_api_on(olt, listener, cancel).await
}

/// Serve the admin API on a bound listener until `cancel` fires
pub async fn serve_api_on(
    olt: Arc<OltDevice>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> SimResult<()> {
    info!(address = %listener.local_addr()?, "Admin gRPC server listening");
    Server::builder()
        .add_service(SimulatorServer::new(ApiService::new(olt)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), cancel.cancelled())
        .await?;
    info!("Admin gRPC server stopped");
    Ok(())
}

/// Build the OLT described by `config` and serve both APIs until `cancel` fires.
///
/// Workers are stopped after both servers have returned.
pub async fn run_olt(config: &SimConfig, cancel: CancellationToken) -> SimResult<()> {
    let openolt_addr = config.server.openolt_addr()?;
    let api_addr = config.server.api_addr()?;
    let olt = Arc::new(OltDevice::new(&config.olt, &config.server, &cancel));

    tokio::join!(
        cancel_on_error(
            "Openolt",
            serve_openolt(olt.clone(), openolt_addr, cancel.clone()),
            &cancel,
        ),
        cancel_on_error("Admin", serve_api(olt.clone(), api_addr, cancel.clone()), &cancel),
    );

    olt.shutdown().await
}

/// One listener down takes the other with it.
async fn cancel_on_error(
    name: &str,
    server: impl std::future::Future<Output = SimResult<()>>,
    cancel: &CancellationToken,
) {
    if let Err(err) = server.await {
        error!(error = %err, "{name} server failed");
        cancel.cancel();
    }
}
