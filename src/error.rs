//! Error types for the emulator.
//!
//! Two layers of errors exist:
//!
//! - **`SimError`** is the crate-level error returned by configuration
//!   loading, server start-up, OLT lookups and the gRPC services. It converts
//!   into a `tonic::Status` with a semantic code, so service handlers can use
//!   `?` directly.
//! - **`OnuError`** is raised inside a device worker. Each variant is either
//!   recoverable (logged, the device carries on in its current state) or fatal
//!   (the worker for that one device stops). See [`OnuError::is_fatal`].
//!
//! Rejected state-machine transitions use [`crate::fsm::TransitionError`].

use crate::devices::identity::OnuIdentity;
use crate::omci::OmciError;
use crate::responders::ResponderError;
use thiserror::Error;
use tonic::{Code, Status};

/// Convenience alias for results using the crate error type.
pub type SimResult<T> = std::result::Result<T, SimError>;

/// Crate-level error.
#[derive(Error, Debug)]
pub enum SimError {
    /// Configuration file or environment could not be parsed
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Configuration parsed but is semantically invalid
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket address could not be parsed
    #[error("Invalid address: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// gRPC transport failure
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A remote gRPC call failed
    #[error("gRPC call failed: {0}")]
    Status(Box<Status>),

    /// No ONU with this id on this PON port
    #[error("ONU {onu_id} not found on PON port {intf_id}")]
    UnknownOnu {
        /// PON port id
        intf_id: u32,
        /// ONU id
        onu_id: u32,
    },

    /// No ONU with this serial number
    #[error("ONU with serial number {0} not found")]
    UnknownSerial(String),

    /// No PON port with this id
    #[error("PON port {0} not found")]
    UnknownPonPort(u32),

    /// The device worker is gone
    #[error("ONU {onu} is not accepting messages")]
    QueueClosed {
        /// Identity of the device
        onu: String,
    },

    /// `EnableIndication` called twice
    #[error("OLT {0} is already enabled")]
    AlreadyEnabled(u32),

    /// An operation needs the indication stream first
    #[error("OLT {0} is not enabled")]
    NotEnabled(u32),

    /// A packet-out frame that is neither EAPOL nor DHCP
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Device workers did not stop in time
    #[error("{pending} ONU workers did not stop within the shutdown timeout")]
    ShutdownTimeout {
        /// Number of workers still running
        pending: usize,
    },
}

impl From<figment::Error> for SimError {
    fn from(err: figment::Error) -> Self {
        SimError::Config(Box::new(err))
    }
}

impl From<Status> for SimError {
    fn from(status: Status) -> Self {
        SimError::Status(Box::new(status))
    }
}

impl From<SimError> for Status {
    fn from(err: SimError) -> Self {
        match err {
            SimError::Config(_) | SimError::Configuration(_) | SimError::AddrParse(_) => {
                Status::new(Code::InvalidArgument, err.to_string())
            }
            SimError::InvalidPacket(_) => Status::new(Code::InvalidArgument, err.to_string()),
            SimError::UnknownOnu { .. }
            | SimError::UnknownSerial(_)
            | SimError::UnknownPonPort(_) => {
                Status::new(Code::NotFound, err.to_string())
            }
            SimError::AlreadyEnabled(_) | SimError::NotEnabled(_) => {
                Status::new(Code::FailedPrecondition, err.to_string())
            }
            SimError::QueueClosed { .. } | SimError::Transport(_) => {
                Status::new(Code::Unavailable, err.to_string())
            }
            SimError::Status(status) => *status,
            SimError::Io(_) | SimError::ShutdownTimeout { .. } => {
                Status::new(Code::Internal, err.to_string())
            }
        }
    }
}

/// Error raised while a device worker handles an event.
#[derive(Error, Debug)]
pub enum OnuError {
    /// Writing to the indication stream failed
    #[error("failed to send {kind} for {onu}: stream closed")]
    IndicationSend {
        /// Indication kind
        kind: &'static str,
        /// Device identity
        onu: OnuIdentity,
    },

    /// The device has no indication stream to write to
    #[error("no indication stream for {onu}")]
    NoIndicationStream {
        /// Device identity
        onu: OnuIdentity,
    },

    /// An OMCI request from the controller could not be answered
    #[error("error handling OMCI message for {onu}: {source}")]
    OmciRequest {
        /// Device identity
        onu: OnuIdentity,
        /// Decode or responder failure
        #[source]
        source: OmciError,
    },

    /// A packet the responders could not act on
    #[error("unhandled packet for {onu}: {source}")]
    Packet {
        /// Device identity
        onu: OnuIdentity,
        /// Responder failure
        #[source]
        source: ResponderError,
    },

    /// Unexpected management response; the OMCI session cannot continue
    #[error("OMCI session out of sync for {onu}: {reason}")]
    OmciDesync {
        /// Device identity
        onu: OnuIdentity,
        /// What was received
        reason: String,
    },

    /// A unary call to the controller failed
    #[error("controller call {call} failed for {onu}: {status}")]
    Controller {
        /// RPC name
        call: &'static str,
        /// Device identity
        onu: OnuIdentity,
        /// Returned status
        status: Box<Status>,
    },

    /// The device was asked to call the controller but has no client
    #[error("no controller connection for {onu}")]
    NoController {
        /// Device identity
        onu: OnuIdentity,
    },
}

impl OnuError {
    /// Fatal errors end the device's worker; the rest are logged and ignored.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OnuError::OmciDesync { .. }
                | OnuError::Controller { .. }
                | OnuError::NoController { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::identity::SerialNumber;

    fn identity() -> OnuIdentity {
        OnuIdentity {
            onu_id: 1,
            pon_port_id: 0,
            serial_number: SerialNumber::new(0, 0, 1),
        }
    }

    #[test]
    fn test_status_mapping() {
        let status: Status = SimError::UnknownOnu {
            intf_id: 0,
            onu_id: 9,
        }
        .into();
        assert_eq!(status.code(), Code::NotFound);

        let status: Status = SimError::AlreadyEnabled(0).into();
        assert_eq!(status.code(), Code::FailedPrecondition);

        let status: Status = SimError::InvalidPacket("arp".into()).into();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status: Status = SimError::from(Status::aborted("gone")).into();
        assert_eq!(status.code(), Code::Aborted);
    }

    #[test]
    fn test_fatality() {
        let onu = identity();
        assert!(!OnuError::IndicationSend {
            kind: "OnuIndication",
            onu
        }
        .is_fatal());
        assert!(!OnuError::NoIndicationStream { onu }.is_fatal());
        assert!(OnuError::OmciDesync {
            onu,
            reason: "GetResponse".into()
        }
        .is_fatal());
        assert!(OnuError::NoController { onu }.is_fatal());
        assert!(OnuError::Controller {
            call: "FlowAdd",
            onu,
            status: Box::new(Status::unavailable("down")),
        }
        .is_fatal());
    }

    #[test]
    fn test_errors_carry_identity() {
        let err = OnuError::NoController { onu: identity() };
        assert_eq!(
            err.to_string(),
            "no controller connection for intf_id=0 onu_id=1 onu_sn=BBSM00000001"
        );
    }
}
