//! ONU lifecycle state machine.
//!
//! Tracks which protocol phase a device is in: discovery and activation, the
//! EAPOL authentication exchange, the DHCP exchange, and the reduced
//! flow-pushing path used by the bulk runner.
//!
//! # State Machine
//!
//! ```text
//! created ──discover──> discovered ──enable──> enabled
//!                                                 │
//!                  ┌──receive_eapol_flow──────────┼──add_gem_port──┐
//!                  ▼                              │                ▼
//!          eapol_flow_received <──────────────────┴──────> gem_port_added
//!                  │                                               │
//!                  └───────────────start_auth──────────────────────┘
//!                                    │
//!                                    ▼
//!   auth_started ─> eap_start_sent ─> eap_response_identity_sent
//!        ─> eap_response_challenge_sent ─> eap_response_success_received
//!                                    │
//!                                start_dhcp (guarded)
//!                                    ▼
//!   dhcp_started ─> dhcp_discovery_sent ─> dhcp_request_sent ─> dhcp_ack_received
//!
//! bulk runner: created ─send_eapol_flow─> eapol_flow_sent ─send_dhcp_flow─> dhcp_flow_sent
//! ```
//!
//! Failure states `auth_failed` and `dhcp_failed` are reachable from every
//! in-progress step of their exchange; `disabled` is reachable from every
//! terminal success or failure state.
//!
//! Side effects live in entry callbacks registered here, so a phase change and
//! the event it produces happen together: entering `enabled`/`disabled` queues
//! an ONU indication, `auth_started` queues the EAPOL start, `dhcp_started`
//! queues the DHCP start, and the two bulk-runner states queue their flow
//! installs.

use crate::devices::identity::OnuIdentity;
use crate::devices::messages::OnuMessage;
use crate::devices::oper_state::OperState;
use crate::fsm::{StateMachine, Transition, TransitionError};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, error};

/// Lifecycle states of an emulated ONU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnuState {
    /// Created at emulator start-up
    Created,
    /// Discovery indication sent
    Discovered,
    /// Activated by the controller
    Enabled,
    /// EAPOL trap flow installed, no GEM port yet
    EapolFlowReceived,
    /// GEM port created, no EAPOL flow yet
    GemPortAdded,
    /// Authentication requested
    AuthStarted,
    /// EAPOL-Start sent
    EapStartSent,
    /// EAP identity response sent
    EapResponseIdentitySent,
    /// EAP challenge response sent
    EapResponseChallengeSent,
    /// EAP success received
    EapResponseSuccessReceived,
    /// Authentication failed
    AuthFailed,
    /// DHCP requested
    DhcpStarted,
    /// DHCP discover sent
    DhcpDiscoverySent,
    /// DHCP request sent
    DhcpRequestSent,
    /// DHCP ack received
    DhcpAckReceived,
    /// DHCP failed
    DhcpFailed,
    /// Deactivated by the controller
    Disabled,
    /// EAPOL flow pushed to the controller (bulk runner)
    EapolFlowSent,
    /// DHCP flow pushed to the controller (bulk runner)
    DhcpFlowSent,
}

impl OnuState {
    /// State name as reported by the admin API and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            OnuState::Created => "created",
            OnuState::Discovered => "discovered",
            OnuState::Enabled => "enabled",
            OnuState::EapolFlowReceived => "eapol_flow_received",
            OnuState::GemPortAdded => "gem_port_added",
            OnuState::AuthStarted => "auth_started",
            OnuState::EapStartSent => "eap_start_sent",
            OnuState::EapResponseIdentitySent => "eap_response_identity_sent",
            OnuState::EapResponseChallengeSent => "eap_response_challenge_sent",
            OnuState::EapResponseSuccessReceived => "eap_response_success_received",
            OnuState::AuthFailed => "auth_failed",
            OnuState::DhcpStarted => "dhcp_started",
            OnuState::DhcpDiscoverySent => "dhcp_discovery_sent",
            OnuState::DhcpRequestSent => "dhcp_request_sent",
            OnuState::DhcpAckReceived => "dhcp_ack_received",
            OnuState::DhcpFailed => "dhcp_failed",
            OnuState::Disabled => "disabled",
            OnuState::EapolFlowSent => "eapol_flow_sent",
            OnuState::DhcpFlowSent => "dhcp_flow_sent",
        }
    }

    /// Every state, in declaration order
    pub const ALL: [OnuState; 19] = [
        OnuState::Created,
        OnuState::Discovered,
        OnuState::Enabled,
        OnuState::EapolFlowReceived,
        OnuState::GemPortAdded,
        OnuState::AuthStarted,
        OnuState::EapStartSent,
        OnuState::EapResponseIdentitySent,
        OnuState::EapResponseChallengeSent,
        OnuState::EapResponseSuccessReceived,
        OnuState::AuthFailed,
        OnuState::DhcpStarted,
        OnuState::DhcpDiscoverySent,
        OnuState::DhcpRequestSent,
        OnuState::DhcpAckReceived,
        OnuState::DhcpFailed,
        OnuState::Disabled,
        OnuState::EapolFlowSent,
        OnuState::DhcpFlowSent,
    ];

    /// Whether DHCP has been started and has not failed
    pub fn is_dhcp_in_progress(&self) -> bool {
        matches!(
            self,
            OnuState::DhcpStarted
                | OnuState::DhcpDiscoverySent
                | OnuState::DhcpRequestSent
                | OnuState::DhcpAckReceived
        )
    }
}

impl fmt::Display for OnuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnuEvent {
    /// `created -> discovered`
    Discover,
    /// `discovered|disabled -> enabled`
    Enable,
    /// EAPOL flow observed
    ReceiveEapolFlow,
    /// GEM port created through OMCI
    AddGemPort,
    /// Deactivate from a terminal state
    Disable,
    /// Start the EAPOL exchange
    StartAuth,
    /// EAPOL-Start transmitted
    EapStartSent,
    /// Identity response transmitted
    EapResponseIdentitySent,
    /// Challenge response transmitted
    EapResponseChallengeSent,
    /// Success received
    EapResponseSuccessReceived,
    /// Authentication failed
    AuthFailed,
    /// Start the DHCP exchange (guarded)
    StartDhcp,
    /// Discover transmitted
    DhcpDiscoverySent,
    /// Request transmitted
    DhcpRequestSent,
    /// Ack received
    DhcpAckReceived,
    /// DHCP failed
    DhcpFailed,
    /// Push the EAPOL flow (bulk runner)
    SendEapolFlow,
    /// Push the DHCP flow (bulk runner)
    SendDhcpFlow,
}

impl OnuEvent {
    /// Event name as used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            OnuEvent::Discover => "discover",
            OnuEvent::Enable => "enable",
            OnuEvent::ReceiveEapolFlow => "receive_eapol_flow",
            OnuEvent::AddGemPort => "add_gem_port",
            OnuEvent::Disable => "disable",
            OnuEvent::StartAuth => "start_auth",
            OnuEvent::EapStartSent => "eap_start_sent",
            OnuEvent::EapResponseIdentitySent => "eap_response_identity_sent",
            OnuEvent::EapResponseChallengeSent => "eap_response_challenge_sent",
            OnuEvent::EapResponseSuccessReceived => "eap_response_success_received",
            OnuEvent::AuthFailed => "auth_failed",
            OnuEvent::StartDhcp => "start_dhcp",
            OnuEvent::DhcpDiscoverySent => "dhcp_discovery_sent",
            OnuEvent::DhcpRequestSent => "dhcp_request_sent",
            OnuEvent::DhcpAckReceived => "dhcp_ack_received",
            OnuEvent::DhcpFailed => "dhcp_failed",
            OnuEvent::SendEapolFlow => "send_eapol_flow",
            OnuEvent::SendDhcpFlow => "send_dhcp_flow",
        }
    }

    /// Every event, in declaration order
    pub const ALL: [OnuEvent; 18] = [
        OnuEvent::Discover,
        OnuEvent::Enable,
        OnuEvent::ReceiveEapolFlow,
        OnuEvent::AddGemPort,
        OnuEvent::Disable,
        OnuEvent::StartAuth,
        OnuEvent::EapStartSent,
        OnuEvent::EapResponseIdentitySent,
        OnuEvent::EapResponseChallengeSent,
        OnuEvent::EapResponseSuccessReceived,
        OnuEvent::AuthFailed,
        OnuEvent::StartDhcp,
        OnuEvent::DhcpDiscoverySent,
        OnuEvent::DhcpRequestSent,
        OnuEvent::DhcpAckReceived,
        OnuEvent::DhcpFailed,
        OnuEvent::SendEapolFlow,
        OnuEvent::SendDhcpFlow,
    ];
}

impl fmt::Display for OnuEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection returned by the lifecycle machine.
pub type LifecycleError = TransitionError<OnuState, OnuEvent>;

/// Device data the lifecycle guard and entry callbacks operate on.
#[derive(Debug)]
pub struct OnuContext {
    /// Identity reported in failure logs and queued indications
    pub identity: OnuIdentity,
    /// Whether the DHCP trap flow has been observed for this device
    pub dhcp_flow_received: bool,
    /// Events posted by entry callbacks, drained by the dispatch loop before
    /// the next inbound message
    pub pending: VecDeque<OnuMessage>,
}

impl OnuContext {
    /// Fresh context with no flows observed and nothing pending
    pub fn new(identity: OnuIdentity) -> Self {
        Self {
            identity,
            dhcp_flow_received: false,
            pending: VecDeque::new(),
        }
    }
}

/// Lifecycle state machine of an ONU.
pub type OnuStateMachine = StateMachine<OnuState, OnuEvent, OnuContext>;

/// The lifecycle transition table.
pub fn transitions() -> Vec<Transition<OnuState, OnuEvent>> {
    use OnuEvent as E;
    use OnuState as S;

    vec![
        // Device lifecycle
        Transition::new(E::Discover, &[S::Created], S::Discovered),
        Transition::new(E::Enable, &[S::Discovered, S::Disabled], S::Enabled),
        Transition::new(
            E::ReceiveEapolFlow,
            &[S::Enabled, S::GemPortAdded],
            S::EapolFlowReceived,
        ),
        Transition::new(
            E::AddGemPort,
            &[S::Enabled, S::EapolFlowReceived],
            S::GemPortAdded,
        ),
        Transition::new(
            E::Disable,
            &[
                S::EapResponseSuccessReceived,
                S::AuthFailed,
                S::DhcpAckReceived,
                S::DhcpFailed,
            ],
            S::Disabled,
        ),
        // EAPOL
        Transition::new(
            E::StartAuth,
            &[
                S::EapolFlowReceived,
                S::GemPortAdded,
                S::EapResponseSuccessReceived,
                S::AuthFailed,
                S::DhcpAckReceived,
                S::DhcpFailed,
            ],
            S::AuthStarted,
        ),
        Transition::new(E::EapStartSent, &[S::AuthStarted], S::EapStartSent),
        Transition::new(
            E::EapResponseIdentitySent,
            &[S::EapStartSent],
            S::EapResponseIdentitySent,
        ),
        Transition::new(
            E::EapResponseChallengeSent,
            &[S::EapResponseIdentitySent],
            S::EapResponseChallengeSent,
        ),
        Transition::new(
            E::EapResponseSuccessReceived,
            &[S::EapResponseChallengeSent],
            S::EapResponseSuccessReceived,
        ),
        Transition::new(
            E::AuthFailed,
            &[
                S::AuthStarted,
                S::EapStartSent,
                S::EapResponseIdentitySent,
                S::EapResponseChallengeSent,
            ],
            S::AuthFailed,
        ),
        // DHCP
        Transition::new(
            E::StartDhcp,
            &[
                S::EapResponseSuccessReceived,
                S::DhcpDiscoverySent,
                S::DhcpRequestSent,
                S::DhcpAckReceived,
                S::DhcpFailed,
            ],
            S::DhcpStarted,
        ),
        Transition::new(E::DhcpDiscoverySent, &[S::DhcpStarted], S::DhcpDiscoverySent),
        Transition::new(E::DhcpRequestSent, &[S::DhcpDiscoverySent], S::DhcpRequestSent),
        Transition::new(E::DhcpAckReceived, &[S::DhcpRequestSent], S::DhcpAckReceived),
        Transition::new(
            E::DhcpFailed,
            &[S::DhcpStarted, S::DhcpDiscoverySent, S::DhcpRequestSent],
            S::DhcpFailed,
        ),
        // Bulk runner
        Transition::new(E::SendEapolFlow, &[S::Created], S::EapolFlowSent),
        Transition::new(E::SendDhcpFlow, &[S::EapolFlowSent], S::DhcpFlowSent),
    ]
}

/// Build a lifecycle machine in `created` with its guard and entry callbacks.
pub fn new_lifecycle() -> OnuStateMachine {
    StateMachine::new(OnuState::Created, transitions())
        .with_guard(OnuEvent::StartDhcp, |ctx: &OnuContext| {
            if ctx.dhcp_flow_received {
                Ok(())
            } else {
                Err("cannot go to dhcp_started as dhcp flow is missing".to_string())
            }
        })
        .on_enter_any(|_, change| {
            debug!(
                "Changing ONU InternalState from {} to {}",
                change.src, change.dst
            );
        })
        .on_enter(OnuState::Enabled, |ctx, _| {
            ctx.pending.push_back(OnuMessage::OnuIndication(OperState::Up));
        })
        .on_enter(OnuState::Disabled, |ctx, _| {
            ctx.pending.push_back(OnuMessage::OnuIndication(OperState::Down));
        })
        .on_enter(OnuState::AuthStarted, |ctx, _| {
            ctx.pending.push_back(OnuMessage::StartEapol);
        })
        .on_enter(OnuState::AuthFailed, |ctx, _| {
            error!(
                onu_id = ctx.identity.onu_id,
                intf_id = ctx.identity.pon_port_id,
                onu_sn = %ctx.identity.serial_number,
                "ONU failed to authenticate!"
            );
        })
        .on_enter(OnuState::DhcpStarted, |ctx, _| {
            ctx.pending.push_back(OnuMessage::StartDhcp);
        })
        .on_enter(OnuState::DhcpFailed, |ctx, _| {
            error!(
                onu_id = ctx.identity.onu_id,
                intf_id = ctx.identity.pon_port_id,
                onu_sn = %ctx.identity.serial_number,
                "ONU failed to DHCP!"
            );
        })
        .on_enter(OnuState::EapolFlowSent, |ctx, _| {
            ctx.pending.push_back(OnuMessage::SendEapolFlow);
        })
        .on_enter(OnuState::DhcpFlowSent, |ctx, _| {
            ctx.pending.push_back(OnuMessage::SendDhcpFlow);
        })
}
