//! gRPC surfaces of the emulator
//!
//! Two services run side by side on separate addresses:
//! - `Openolt`, the controller-facing protocol: the indication stream and the
//!   unary calls that drive ONU activation, OMCI, packet-out and flows
//! - `Simulator`, the administrative API: read-only device views and a few
//!   control calls
//!
//! Both stop on the same cancellation token.
//!
//! # Example
//! ```no_run
//! use rust_bbsim::config::SimConfig;
//! use rust_bbsim::grpc::run_olt;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SimConfig::default();
//!     run_olt(&config, CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
pub mod api_service;
pub mod openolt_service;
pub mod server;

/// Protocol Buffer definitions of the controller-facing protocol
pub mod openolt {
    //! Generated from `proto/openolt.proto`

    tonic::include_proto!("openolt");
}

/// Protocol Buffer definitions of the administrative API
pub mod admin {
    //! Generated from `proto/admin.proto`

    tonic::include_proto!("admin");
}

pub use api_service::ApiService;
pub use openolt_service::OpenoltService;
pub use server::{run_olt, serve_api, serve_api_on, serve_openolt, serve_openolt_on};

pub use admin::simulator_client::SimulatorClient;
pub use admin::simulator_server::{Simulator, SimulatorServer};
pub use openolt::openolt_client::OpenoltClient;
pub use openolt::openolt_server::{Openolt, OpenoltServer};
