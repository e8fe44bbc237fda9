//! Emulated devices.
//!
//! - [`onu`] the ONU and its dispatch loop, one worker task per device
//! - [`lifecycle`] and [`oper_state`] the two state machines every ONU carries
//! - [`flows`] classification of controller-installed rules
//! - [`omci_session`] the controller side of OMCI provisioning (bulk runner)
//! - [`indications`] the indication emitter
//! - [`pon`] and [`olt`] ownership of ONUs and the OLT enable sequence

pub mod controller;
pub mod flows;
pub mod identity;
pub mod indications;
pub mod lifecycle;
pub mod messages;
pub mod olt;
pub mod omci_session;
pub mod onu;
pub mod oper_state;
pub mod pon;

pub use olt::OltDevice;
pub use onu::{Onu, OnuConfig, OnuHandle, OnuSnapshot, OnuTransport};
