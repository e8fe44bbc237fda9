//! # Rust BBSim Core Library
//!
//! An emulated broadband access network: one OLT with its PON ports and the
//! ONUs behind them, driven by a controller over the Openolt gRPC protocol.
//! Each ONU is a protocol state machine running in its own worker task,
//! stepping through discovery, activation, OMCI provisioning, EAPOL
//! authentication and DHCP.
//!
//! ## Crate Structure
//!
//! - **`fsm`**: Generic state machine with an explicit transition table,
//!   guards and ordered entry callbacks.
//! - **`devices`**: The ONU lifecycle and operational machines, the per-ONU
//!   dispatch loop, flow classification, the OMCI session driver, the
//!   indication emitter, PON ports and the OLT.
//! - **`omci`**: OMCI baseline frame codec and the ONU-side responder.
//! - **`responders`**: EAPOL and DHCP exchanges, both peer roles.
//! - **`grpc`**: The `Openolt` and `Simulator` services and server start-up.
//! - **`bbr`**: Bulk test runner driving a remote emulator as its controller.
//! - **`config`**: Figment-based configuration loading and validation.
//! - **`logging`**: `tracing` subscriber set-up.
//! - **`error`**: The `SimError` and `OnuError` enums.

pub mod bbr;
pub mod config;
pub mod devices;
pub mod error;
pub mod fsm;
pub mod grpc;
pub mod logging;
pub mod omci;
pub mod responders;
