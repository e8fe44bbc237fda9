//! The emulated ONU and its dispatch loop.
//!
//! Each ONU is owned by one worker task for its whole life. Everything that
//! happens to it, controller commands, OMCI, packets and internal events posted
//! by its lifecycle callbacks, arrives as an [`OnuMessage`] and is handled by
//! [`Onu::run`].
//!
//! Handlers come in two kinds and are kept apart:
//!
//! - `send_*` methods serialize and transmit, nothing else. They never post a
//!   lifecycle event, so retrying a send cannot change device state.
//! - `handle_*` / `process_*` methods interpret what was received and decide
//!   which lifecycle event to post.
//!
//! Inbound messages are handled in arrival order. Events posted by entry
//! callbacks go to a device-local FIFO that is drained before the next read
//! from the inbound queue, so they run ahead of messages already queued there.
//! The worker therefore never waits on its own bounded queue.
//!
//! Observers (the OLT services, the admin API, tests) never read the worker's
//! state directly: the worker publishes an [`OnuSnapshot`] on a `watch`
//! channel after every event.

use crate::devices::controller::Controller;
use crate::devices::flows::{self, FlowClass};
use crate::devices::identity::{MacAddress, OnuIdentity, SerialNumber};
use crate::devices::indications::{self, IndicationStream};
use crate::devices::lifecycle::{
    self, LifecycleError, OnuContext, OnuEvent, OnuState, OnuStateMachine,
};
use crate::devices::messages::{OnuMessage, PacketMessage};
use crate::devices::omci_session::{OmciSession, SessionAction};
use crate::devices::oper_state::{self, OperEvent, OperState, OperStateMachine};
use crate::error::{OnuError, SimError, SimResult};
use crate::fsm::TransitionError;
use crate::grpc::openolt::{self, Indication};
use crate::omci::responder::{self, OmciEvent};
use crate::omci::{self as omci_codec, OmciFrame, GEM_PORT_ID};
use crate::responders::packet::PacketType;
use crate::responders::{dhcp, eapol, Exchange};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

/// Per-ONU settings taken from the OLT configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnuConfig {
    /// Service VLAN
    pub s_tag: u16,
    /// Subscriber VLAN
    pub c_tag: u16,
    /// Start EAPOL automatically once flows and GEM port are in place
    pub auth: bool,
    /// Start DHCP automatically once the DHCP flow is in place
    pub dhcp: bool,
    /// Inbound queue capacity
    pub queue_capacity: usize,
}

impl Default for OnuConfig {
    fn default() -> Self {
        Self {
            s_tag: 900,
            c_tag: 900,
            auth: false,
            dhcp: false,
            queue_capacity: 2048,
        }
    }
}

/// State of an ONU as last published by its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnuSnapshot {
    /// Lifecycle state
    pub internal_state: OnuState,
    /// Operational state
    pub oper_state: OperState,
    /// Bound service port, 0 while unset
    pub port_no: u32,
    /// Whether the DHCP flow has been observed
    pub dhcp_flow_received: bool,
    /// Whether the worker is still running
    pub running: bool,
}

/// Transport endpoints a worker writes to.
#[derive(Clone, Default)]
pub struct OnuTransport {
    /// Indication stream towards the controller (emulated OLT)
    pub stream: Option<IndicationStream>,
    /// Unary client towards a remote OLT (bulk runner)
    pub controller: Option<Arc<dyn Controller>>,
}

impl OnuTransport {
    /// Transport of an ONU on the emulated OLT
    pub fn stream(stream: IndicationStream) -> Self {
        Self {
            stream: Some(stream),
            controller: None,
        }
    }

    /// Transport of an ONU driven by the bulk runner
    pub fn controller(controller: Arc<dyn Controller>) -> Self {
        Self {
            stream: None,
            controller: Some(controller),
        }
    }
}

/// Cloneable handle used to talk to a running ONU.
#[derive(Debug, Clone)]
pub struct OnuHandle {
    identity: OnuIdentity,
    hw_address: MacAddress,
    s_tag: u16,
    c_tag: u16,
    tx: mpsc::Sender<OnuMessage>,
    status: watch::Receiver<OnuSnapshot>,
}

impl OnuHandle {
    /// Identity of the device
    pub fn identity(&self) -> OnuIdentity {
        self.identity
    }

    /// ONU id
    pub fn id(&self) -> u32 {
        self.identity.onu_id
    }

    /// PON port id
    pub fn pon_port_id(&self) -> u32 {
        self.identity.pon_port_id
    }

    /// Serial number
    pub fn serial_number(&self) -> SerialNumber {
        self.identity.serial_number
    }

    /// Hardware address
    pub fn hw_address(&self) -> MacAddress {
        self.hw_address
    }

    /// Service VLAN
    pub fn s_tag(&self) -> u16 {
        self.s_tag
    }

    /// Subscriber VLAN
    pub fn c_tag(&self) -> u16 {
        self.c_tag
    }

    /// Enqueue a message, waiting while the queue is full.
    pub async fn send(&self, message: OnuMessage) -> SimResult<()> {
        self.tx.send(message).await.map_err(|_| SimError::QueueClosed {
            onu: self.identity.to_string(),
        })
    }

    /// Last published state
    pub fn snapshot(&self) -> OnuSnapshot {
        *self.status.borrow()
    }

    /// Subscribe to state updates
    pub fn watch(&self) -> watch::Receiver<OnuSnapshot> {
        self.status.clone()
    }
}

/// An emulated ONU, owned by its worker task.
pub struct Onu {
    identity: OnuIdentity,
    hw_address: MacAddress,
    s_tag: u16,
    c_tag: u16,
    auth: bool,
    dhcp: bool,

    lifecycle: OnuStateMachine,
    ctx: OnuContext,
    oper_state: OperStateMachine,

    /// Bound service port, only ever lowered once set
    port_no: u32,
    omci: OmciSession,

    rx: mpsc::Receiver<OnuMessage>,
    done: Option<oneshot::Sender<()>>,
    status: watch::Sender<OnuSnapshot>,
    span: Span,
}

impl std::fmt::Debug for Onu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Onu")
            .field("identity", &self.identity)
            .field("internal_state", &self.lifecycle.current())
            .field("oper_state", &self.oper_state.current())
            .field("port_no", &self.port_no)
            .finish()
    }
}

impl Onu {
    /// Create ONU `onu_id` on PON `pon_port_id` of OLT `olt_id`.
    ///
    /// Returns the device, to be moved into its worker with [`Onu::run`], and
    /// a handle for everybody else.
    pub fn new(olt_id: u32, pon_port_id: u32, onu_id: u32, config: OnuConfig) -> (Self, OnuHandle) {
        let identity = OnuIdentity {
            onu_id,
            pon_port_id,
            serial_number: SerialNumber::new(olt_id, pon_port_id, onu_id),
        };
        let hw_address = MacAddress::for_onu(pon_port_id, onu_id);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

        let lifecycle = lifecycle::new_lifecycle();
        let oper_state = oper_state::new_oper_state_machine();
        let (status, status_rx) = watch::channel(OnuSnapshot {
            internal_state: lifecycle.current(),
            oper_state: oper_state.current(),
            port_no: 0,
            dhcp_flow_received: false,
            running: true,
        });

        let span = info_span!(
            "onu",
            onu_id,
            intf_id = pon_port_id,
            onu_sn = %identity.serial_number
        );

        let onu = Self {
            identity,
            hw_address,
            s_tag: config.s_tag,
            c_tag: config.c_tag,
            auth: config.auth,
            dhcp: config.dhcp,
            lifecycle,
            ctx: OnuContext::new(identity),
            oper_state,
            port_no: 0,
            omci: OmciSession::new(),
            rx,
            done: None,
            status,
            span,
        };
        let handle = OnuHandle {
            identity,
            hw_address,
            s_tag: config.s_tag,
            c_tag: config.c_tag,
            tx,
            status: status_rx,
        };
        (onu, handle)
    }

    /// Completion signal fired when a bulk-runner DHCP exchange finishes.
    pub fn done_signal(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.done = Some(tx);
        rx
    }

    /// Identity of the device
    pub fn identity(&self) -> OnuIdentity {
        self.identity
    }

    /// Current lifecycle state
    pub fn internal_state(&self) -> OnuState {
        self.lifecycle.current()
    }

    /// Current operational state
    pub fn oper_state(&self) -> OperState {
        self.oper_state.current()
    }

    /// Bound service port
    pub fn port_no(&self) -> u32 {
        self.port_no
    }

    /// Whether the DHCP flow has been observed
    pub fn dhcp_flow_received(&self) -> bool {
        self.ctx.dhcp_flow_received
    }

    /// OMCI session state
    pub fn omci_session(&self) -> &OmciSession {
        &self.omci
    }

    /// Take the events queued by lifecycle callbacks and not yet dispatched
    pub fn take_pending(&mut self) -> Vec<OnuMessage> {
        self.ctx.pending.drain(..).collect()
    }

    fn snapshot(&self, running: bool) -> OnuSnapshot {
        OnuSnapshot {
            internal_state: self.lifecycle.current(),
            oper_state: self.oper_state.current(),
            port_no: self.port_no,
            dhcp_flow_received: self.ctx.dhcp_flow_received,
            running,
        }
    }

    fn publish(&self, running: bool) {
        self.status.send_replace(self.snapshot(running));
    }

    /// Consume the inbound queue until cancellation or queue closure.
    ///
    /// A fatal [`OnuError`] ends this worker only.
    pub async fn run(mut self, transport: OnuTransport, cancel: CancellationToken) {
        let span = self.span.clone();
        async move {
            debug!("Started ONU Indication Channel");
            loop {
                // callback events run before messages already in the inbound queue
                let message = match self.ctx.pending.pop_front() {
                    Some(message) => message,
                    None => tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("ONU worker cancelled");
                            break;
                        }
                        message = self.rx.recv() => match message {
                            Some(message) => message,
                            None => {
                                debug!("ONU channel closed");
                                break;
                            }
                        },
                    },
                };
                trace!(message_type = message.kind(), "Received message on ONU Channel");

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("ONU worker cancelled");
                        break;
                    }
                    outcome = self.dispatch(message, &transport) => outcome,
                };
                self.publish(true);

                if let Err(err) = outcome {
                    if err.is_fatal() {
                        error!(error = %err, "terminating ONU");
                        break;
                    }
                    match err {
                        OnuError::Packet { .. } => warn!(error = %err, "Ignoring packet"),
                        _ => error!(error = %err, "Error handling ONU message"),
                    }
                }
            }
            self.publish(false);
        }
        .instrument(span)
        .await
    }

    /// Route one message to its handler.
    pub async fn dispatch(
        &mut self,
        message: OnuMessage,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        match message {
            OnuMessage::DiscoveryIndication => {
                self.send_onu_disc_indication(transport).await?;
                self.fire(OnuEvent::Discover);
                Ok(())
            }
            OnuMessage::Activate => {
                self.handle_activate();
                Ok(())
            }
            OnuMessage::Deactivate => {
                self.handle_deactivate();
                Ok(())
            }
            OnuMessage::OnuIndication(oper_state) => {
                self.send_onu_indication(oper_state, transport).await
            }
            OnuMessage::Omci(pkt) => self.handle_omci_message(&pkt, transport).await,
            OnuMessage::FlowUpdate(flow) => {
                self.handle_flow_update(&flow);
                Ok(())
            }
            OnuMessage::StartEapol => {
                info!("Receive StartEAPOL message on ONU Channel");
                let exchange = eapol::start(self.hw_address);
                self.process_exchange(exchange, PacketType::Eapol, transport).await
            }
            OnuMessage::StartDhcp => {
                info!("Receive StartDHCP message on ONU Channel");
                let exchange = dhcp::discover(self.hw_address, self.c_tag);
                self.process_exchange(exchange, PacketType::Dhcp, transport).await
            }
            OnuMessage::PacketOut(packet) => self.handle_packet_out(packet, transport).await,
            OnuMessage::PacketIn(packet) => self.handle_packet_in(packet, transport).await,
            OnuMessage::DyingGasp => self.send_dying_gasp_indication(transport).await,
            OnuMessage::OmciIndication(pkt) => self.handle_omci_indication(&pkt, transport).await,
            OnuMessage::StartOmci => {
                let action = self.omci.start();
                self.process_session_action(action, transport).await
            }
            OnuMessage::SendEapolFlow => {
                let flow = flows::eapol_flow(self.identity.pon_port_id, self.identity.onu_id);
                self.send_flow(flow, "EAPOL", transport).await
            }
            OnuMessage::SendDhcpFlow => {
                let flow = flows::dhcp_flow(self.identity.pon_port_id, self.identity.onu_id);
                self.send_flow(flow, "DHCP", transport).await
            }
        }
    }

    // ---- lifecycle ----

    /// Post a lifecycle event. Rejections are logged and otherwise ignored.
    pub fn fire(&mut self, event: OnuEvent) -> Option<OnuState> {
        match self.lifecycle.event(event, &mut self.ctx) {
            Ok(state) => Some(state),
            Err(err) => {
                log_rejection(&err);
                None
            }
        }
    }

    /// Post a lifecycle event whose rejection is an expected outcome.
    fn fire_quiet(&mut self, event: OnuEvent) -> Result<OnuState, LifecycleError> {
        let result = self.lifecycle.event(event, &mut self.ctx);
        if let Err(err) = &result {
            debug!(error = %err, "Transition not taken");
        }
        result
    }

    fn handle_activate(&mut self) {
        if let Err(err) = self.oper_state.event(OperEvent::Enable, &mut ()) {
            warn!(error = %err, "Can't enable ONU OperState");
        }
        self.fire(OnuEvent::Enable);
    }

    fn handle_deactivate(&mut self) {
        if let Err(err) = self.oper_state.event(OperEvent::Disable, &mut ()) {
            warn!(error = %err, "Can't disable ONU OperState");
        }
        self.fire(OnuEvent::Disable);
    }

    /// Bind the service port: set when unset, otherwise only lowered.
    pub fn store_port_number(&mut self, port_no: u32) {
        if self.port_no == 0 || port_no < self.port_no {
            debug!(onu_port_no = self.port_no, flow_port_no = port_no, "Storing ONU portNo");
            self.port_no = port_no;
        }
    }

    // ---- flows ----

    /// Interpret a forwarding rule installed by the controller.
    pub fn handle_flow_update(&mut self, flow: &openolt::Flow) {
        let classifier = flow.classifier.clone().unwrap_or_default();
        debug!(
            flow_id = flow.flow_id,
            flow_type = %flow.flow_type,
            uni_id = flow.uni_id,
            port_no = flow.port_no,
            eth_type = %format!("{:x}", classifier.eth_type),
            outer_vlan = classifier.o_vid,
            inner_vlan = classifier.i_vid,
            src_port = classifier.src_port,
            dst_port = classifier.dst_port,
            "ONU receives Flow"
        );

        match flows::classify(flow) {
            FlowClass::OtherUni => {
                debug!("Ignoring flow as it's not for the first UNI");
            }
            FlowClass::Eapol { port_no } => {
                self.store_port_number(port_no);
                match self.lifecycle.current() {
                    OnuState::Enabled => {
                        self.fire(OnuEvent::ReceiveEapolFlow);
                    }
                    OnuState::GemPortAdded if self.auth => {
                        self.fire(OnuEvent::StartAuth);
                    }
                    OnuState::GemPortAdded => {
                        warn!(
                            "Not starting authentication as Auth bit is not set in CLI parameters"
                        );
                    }
                    state => debug!(%state, "EAPOL flow does not change the ONU state"),
                }
            }
            FlowClass::Dhcp => {
                self.ctx.dhcp_flow_received = true;
                if !self.dhcp {
                    warn!("Not starting DHCP as Dhcp bit is not set in CLI parameters");
                } else if self.lifecycle.current().is_dhcp_in_progress() {
                    debug!("DHCP already started, ignoring repeated DHCP flow");
                } else {
                    let _ = self.fire_quiet(OnuEvent::StartDhcp);
                }
            }
            FlowClass::Other => {}
        }
    }

    // ---- OMCI, emulated ONU side ----

    async fn handle_omci_message(
        &mut self,
        pkt: &[u8],
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        trace!(omci_packet = %String::from_utf8_lossy(pkt), "Received OMCI message");
        let reply = OmciFrame::decode_hex(pkt)
            .and_then(|request| responder::respond(&request))
            .map_err(|source| OnuError::OmciRequest {
                onu: self.identity,
                source,
            })?;

        let sent = self.send_omci_indication(reply.response, transport).await;
        if let Some(event) = reply.event {
            self.process_omci_event(event);
        }
        sent
    }

    fn process_omci_event(&mut self, event: OmciEvent) {
        match event {
            OmciEvent::GemPortAdded { gem_port_id } => {
                info!(gem_port_id, "GemPort Added");
                // without EAPOL flows go to an intermediate state, otherwise start auth
                match self.lifecycle.current() {
                    OnuState::Enabled => {
                        self.fire(OnuEvent::AddGemPort);
                    }
                    OnuState::EapolFlowReceived if self.auth => {
                        self.fire(OnuEvent::StartAuth);
                    }
                    OnuState::EapolFlowReceived => {
                        warn!(
                            "Not starting authentication as Auth bit is not set in CLI parameters"
                        );
                    }
                    state => debug!(%state, "GEM port does not change the ONU state"),
                }
            }
        }
    }

    // ---- OMCI, bulk runner side ----

    async fn handle_omci_indication(
        &mut self,
        pkt: &[u8],
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        let desync = |reason: String| OnuError::OmciDesync {
            onu: self.identity,
            reason,
        };
        let message_type =
            omci_codec::peek_message_type(pkt).map_err(|err| desync(err.to_string()))?;
        trace!(%message_type, "ONU receives OMCI Msg");
        let action = self
            .omci
            .on_response(message_type)
            .map_err(|err| desync(format!("{err}: {}", hex::encode(pkt))))?;
        self.process_session_action(action, transport).await
    }

    async fn process_session_action(
        &mut self,
        action: SessionAction,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        match action {
            SessionAction::Send { request, name } => {
                self.send_omci_msg(&request, name, transport).await
            }
            SessionAction::SendEapolFlow => {
                self.fire(OnuEvent::SendEapolFlow);
                Ok(())
            }
        }
    }

    // ---- packets ----

    async fn handle_packet_out(
        &mut self,
        packet: PacketMessage,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        trace!(packet_type = %packet.packet_type, "Received OnuPacketOut Message");
        let exchange = match packet.packet_type {
            PacketType::Eapol => eapol::supplicant_next(self.hw_address, &packet.frame),
            PacketType::Dhcp => dhcp::client_next(self.hw_address, self.c_tag, &packet.frame),
        }
        .map_err(|source| OnuError::Packet {
            onu: self.identity,
            source,
        })?;
        self.process_exchange(exchange, packet.packet_type, transport).await
    }

    /// Transmit a supplicant/client reply upstream, then post its event.
    async fn process_exchange(
        &mut self,
        exchange: Exchange,
        packet_type: PacketType,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        if let Some(frame) = exchange.reply {
            if let Err(err) = self.send_packet_indication(frame, transport).await {
                self.fire(match packet_type {
                    PacketType::Eapol => OnuEvent::AuthFailed,
                    PacketType::Dhcp => OnuEvent::DhcpFailed,
                });
                return Err(err);
            }
        }

        if let Some(event) = exchange.transition {
            let entered = self.fire(event);
            if entered == Some(OnuState::EapResponseSuccessReceived)
                && self.dhcp
                && self.ctx.dhcp_flow_received
            {
                let _ = self.fire_quiet(OnuEvent::StartDhcp);
            }
        }
        Ok(())
    }

    async fn handle_packet_in(
        &mut self,
        packet: PacketMessage,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        trace!(packet_type = %packet.packet_type, "Received OnuPacketIn Message");
        let exchange = match packet.packet_type {
            PacketType::Eapol => eapol::authenticator_next(self.hw_address, &packet.frame),
            PacketType::Dhcp => {
                dhcp::server_next(self.hw_address, self.s_tag, self.c_tag, &packet.frame)
            }
        }
        .map_err(|source| OnuError::Packet {
            onu: self.identity,
            source,
        })?;

        if let Some(frame) = exchange.reply {
            self.send_onu_packet_out(frame, transport).await?;
        }
        if let Some(event) = exchange.transition {
            self.fire(event);
        }
        if exchange.completed && packet.packet_type == PacketType::Dhcp {
            info!("DHCP exchange completed");
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
        }
        Ok(())
    }

    // ---- send handlers ----

    async fn send_indication(
        &self,
        indication: Indication,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        let kind = indications::kind(&indication);
        let stream = transport
            .stream
            .as_ref()
            .ok_or(OnuError::NoIndicationStream { onu: self.identity })?;
        stream
            .send(indication)
            .await
            .map_err(|_| OnuError::IndicationSend {
                kind,
                onu: self.identity,
            })?;
        debug!("Sent {kind}");
        Ok(())
    }

    async fn send_onu_disc_indication(&self, transport: &OnuTransport) -> Result<(), OnuError> {
        let indication = indications::onu_disc_indication(
            self.identity.pon_port_id,
            &self.identity.serial_number,
        );
        self.send_indication(indication, transport).await
    }

    async fn send_onu_indication(
        &self,
        oper_state: OperState,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        let indication = indications::onu_indication(
            self.identity.pon_port_id,
            self.identity.onu_id,
            oper_state,
            self.oper_state.current(),
            &self.identity.serial_number,
        );
        self.send_indication(indication, transport).await
    }

    async fn send_omci_indication(
        &self,
        pkt: Bytes,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        let indication =
            indications::omci_indication(self.identity.pon_port_id, self.identity.onu_id, pkt);
        self.send_indication(indication, transport).await
    }

    async fn send_packet_indication(
        &self,
        frame: Bytes,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        let indication = indications::packet_indication(
            self.identity.pon_port_id,
            self.identity.onu_id,
            u32::from(GEM_PORT_ID),
            self.port_no,
            frame,
        );
        self.send_indication(indication, transport).await
    }

    async fn send_dying_gasp_indication(&self, transport: &OnuTransport) -> Result<(), OnuError> {
        let indication =
            indications::dying_gasp_indication(self.identity.pon_port_id, self.identity.onu_id);
        self.send_indication(indication, transport).await?;
        info!("sendDyingGaspInd");
        Ok(())
    }

    fn controller<'a>(
        &self,
        transport: &'a OnuTransport,
    ) -> Result<&'a Arc<dyn Controller>, OnuError> {
        transport
            .controller
            .as_ref()
            .ok_or(OnuError::NoController { onu: self.identity })
    }

    fn controller_error(&self, call: &'static str) -> impl FnOnce(tonic::Status) -> OnuError {
        let onu = self.identity;
        move |status| OnuError::Controller {
            call,
            onu,
            status: Box::new(status),
        }
    }

    async fn send_omci_msg(
        &self,
        request: &OmciFrame,
        name: &'static str,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        let msg = openolt::OmciMsg {
            intf_id: self.identity.pon_port_id,
            onu_id: self.identity.onu_id,
            pkt: hex::encode(request.encode()).into_bytes(),
        };
        self.controller(transport)?
            .omci_msg_out(msg)
            .await
            .map_err(self.controller_error("OmciMsgOut"))?;
        trace!(tid = request.tid, "Sent OMCI message {name}");
        Ok(())
    }

    async fn send_onu_packet_out(
        &self,
        frame: Bytes,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        let packet = openolt::OnuPacket {
            intf_id: self.identity.pon_port_id,
            onu_id: self.identity.onu_id,
            port_no: self.identity.onu_id,
            gemport_id: u32::from(GEM_PORT_ID),
            pkt: frame.to_vec(),
        };
        self.controller(transport)?
            .onu_packet_out(packet)
            .await
            .map_err(self.controller_error("OnuPacketOut"))
    }

    async fn send_flow(
        &self,
        flow: openolt::Flow,
        name: &str,
        transport: &OnuTransport,
    ) -> Result<(), OnuError> {
        let (flow_id, port_no) = (flow.flow_id, flow.port_no);
        self.controller(transport)?
            .flow_add(flow)
            .await
            .map_err(self.controller_error("FlowAdd"))?;
        info!(flow_id, port_no, "Sent {name} Flow");
        Ok(())
    }
}

fn log_rejection(err: &LifecycleError) {
    match err {
        TransitionError::Cancelled { .. } => debug!(error = %err, "Transition cancelled"),
        TransitionError::Rejected { .. } | TransitionError::Unknown { .. } => {
            warn!(error = %err, "Can't change ONU InternalState")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::openolt::indication;
    use std::collections::VecDeque;
    use tracing_test::traced_test;

    fn onu(auth: bool, dhcp: bool) -> Onu {
        let config = OnuConfig {
            auth,
            dhcp,
            ..Default::default()
        };
        Onu::new(0, 2, 5, config).0
    }

    fn drive(onu: &mut Onu, events: &[OnuEvent]) {
        for event in events {
            assert!(onu.fire(*event).is_some(), "{event} rejected");
        }
        onu.take_pending();
    }

    #[test]
    fn test_identity_derivation() {
        let onu = onu(false, false);
        assert_eq!(onu.identity().serial_number.to_string(), "BBSM00000205");
        assert_eq!(onu.hw_address.to_string(), "2e:60:70:13:02:05");
        assert_eq!(onu.internal_state(), OnuState::Created);
        assert_eq!(onu.oper_state(), OperState::Down);
    }

    #[test]
    fn test_port_number_only_decreases() {
        let mut onu = onu(false, false);
        onu.store_port_number(10);
        assert_eq!(onu.port_no(), 10);
        onu.store_port_number(12);
        assert_eq!(onu.port_no(), 10);
        onu.store_port_number(10);
        assert_eq!(onu.port_no(), 10);
        onu.store_port_number(4);
        assert_eq!(onu.port_no(), 4);
    }

    #[test]
    fn test_eapol_flow_then_gem_port_starts_auth_once() {
        let mut onu = onu(true, false);
        drive(&mut onu, &[OnuEvent::Discover, OnuEvent::Enable]);

        onu.handle_flow_update(&flows::eapol_flow(2, 5));
        assert_eq!(onu.internal_state(), OnuState::EapolFlowReceived);
        assert_eq!(onu.port_no(), 5);

        onu.process_omci_event(OmciEvent::GemPortAdded { gem_port_id: 1 });
        assert_eq!(onu.internal_state(), OnuState::AuthStarted);
        assert_eq!(onu.take_pending(), vec![OnuMessage::StartEapol]);
    }

    #[test]
    fn test_gem_port_then_eapol_flow_without_auth() {
        let mut onu = onu(false, false);
        drive(&mut onu, &[OnuEvent::Discover, OnuEvent::Enable]);

        onu.process_omci_event(OmciEvent::GemPortAdded { gem_port_id: 1 });
        assert_eq!(onu.internal_state(), OnuState::GemPortAdded);

        onu.handle_flow_update(&flows::eapol_flow(2, 5));
        assert_eq!(onu.internal_state(), OnuState::GemPortAdded);
        assert!(onu.take_pending().is_empty());
    }

    #[test]
    #[traced_test]
    fn test_eapol_flow_then_gem_port_without_auth() {
        let mut onu = onu(false, false);
        drive(&mut onu, &[OnuEvent::Discover, OnuEvent::Enable]);

        onu.handle_flow_update(&flows::eapol_flow(2, 5));
        assert_eq!(onu.internal_state(), OnuState::EapolFlowReceived);

        onu.process_omci_event(OmciEvent::GemPortAdded { gem_port_id: 1 });
        assert_eq!(onu.internal_state(), OnuState::EapolFlowReceived);
        assert!(onu.take_pending().is_empty());
        assert!(logs_contain("Auth bit is not set"));
    }

    #[test]
    fn test_dhcp_flow_before_auth_success_is_remembered() {
        let mut onu = onu(true, true);
        drive(&mut onu, &[OnuEvent::Discover, OnuEvent::Enable, OnuEvent::AddGemPort]);

        onu.handle_flow_update(&flows::dhcp_flow(2, 5));
        assert_eq!(onu.internal_state(), OnuState::GemPortAdded);
        assert!(onu.dhcp_flow_received());
        assert!(onu.take_pending().is_empty());
    }

    fn eap_success() -> Exchange {
        Exchange {
            reply: None,
            transition: Some(OnuEvent::EapResponseSuccessReceived),
            completed: true,
        }
    }

    fn authenticate_after_dhcp_flow(onu: &mut Onu) {
        drive(onu, &[OnuEvent::Discover, OnuEvent::Enable, OnuEvent::AddGemPort]);
        onu.handle_flow_update(&flows::dhcp_flow(2, 5));
        drive(
            onu,
            &[
                OnuEvent::StartAuth,
                OnuEvent::EapStartSent,
                OnuEvent::EapResponseIdentitySent,
                OnuEvent::EapResponseChallengeSent,
            ],
        );
    }

    #[tokio::test]
    async fn test_early_dhcp_flow_starts_dhcp_after_auth_success() {
        let mut onu = onu(true, true);
        authenticate_after_dhcp_flow(&mut onu);

        let transport = OnuTransport::default();
        onu.process_exchange(eap_success(), PacketType::Eapol, &transport)
            .await
            .unwrap();

        assert_eq!(onu.internal_state(), OnuState::DhcpStarted);
        assert_eq!(onu.take_pending(), vec![OnuMessage::StartDhcp]);
    }

    #[tokio::test]
    async fn test_auth_success_without_dhcp_enabled_stays() {
        let mut onu = onu(true, false);
        authenticate_after_dhcp_flow(&mut onu);
        assert!(onu.dhcp_flow_received());

        let transport = OnuTransport::default();
        onu.process_exchange(eap_success(), PacketType::Eapol, &transport)
            .await
            .unwrap();

        assert_eq!(onu.internal_state(), OnuState::EapResponseSuccessReceived);
        assert!(onu.take_pending().is_empty());
    }

    #[test]
    fn test_repeated_dhcp_flows_do_not_restart_dhcp() {
        let mut onu = onu(true, true);
        drive(
            &mut onu,
            &[
                OnuEvent::Discover,
                OnuEvent::Enable,
                OnuEvent::AddGemPort,
                OnuEvent::StartAuth,
                OnuEvent::EapStartSent,
                OnuEvent::EapResponseIdentitySent,
                OnuEvent::EapResponseChallengeSent,
                OnuEvent::EapResponseSuccessReceived,
            ],
        );

        onu.handle_flow_update(&flows::dhcp_flow(2, 5));
        assert_eq!(onu.internal_state(), OnuState::DhcpStarted);
        assert_eq!(onu.take_pending(), vec![OnuMessage::StartDhcp]);

        onu.fire(OnuEvent::DhcpDiscoverySent);
        onu.handle_flow_update(&flows::dhcp_flow(2, 5));
        assert_eq!(onu.internal_state(), OnuState::DhcpDiscoverySent);
        assert!(onu.take_pending().is_empty());
    }

    #[test]
    fn test_flow_for_other_uni_is_ignored() {
        let mut onu = onu(true, true);
        drive(&mut onu, &[OnuEvent::Discover, OnuEvent::Enable]);
        let mut flow = flows::eapol_flow(2, 5);
        flow.uni_id = 1;
        onu.handle_flow_update(&flow);
        assert_eq!(onu.internal_state(), OnuState::Enabled);
        assert_eq!(onu.port_no(), 0);
    }

    #[tokio::test]
    async fn test_activate_emits_up_indication_with_admin_state() {
        let (tx, mut rx) = mpsc::channel(8);
        let transport = OnuTransport::stream(IndicationStream::new(tx));
        let mut onu = onu(false, false);

        onu.dispatch(OnuMessage::DiscoveryIndication, &transport).await.unwrap();
        assert_eq!(onu.internal_state(), OnuState::Discovered);
        onu.dispatch(OnuMessage::Activate, &transport).await.unwrap();
        assert_eq!(onu.oper_state(), OperState::Up);

        let pending: VecDeque<_> = onu.take_pending().into();
        assert_eq!(pending, VecDeque::from([OnuMessage::OnuIndication(OperState::Up)]));
        for message in pending {
            onu.dispatch(message, &transport).await.unwrap();
        }

        let disc = rx.recv().await.unwrap().unwrap();
        assert!(matches!(disc.data, Some(indication::Data::OnuDiscInd(_))));
        match rx.recv().await.unwrap().unwrap().data {
            Some(indication::Data::OnuInd(ind)) => {
                assert_eq!(ind.oper_state, "up");
                assert_eq!(ind.admin_state, "up");
            }
            other => panic!("unexpected indication {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discovery_send_failure_keeps_state() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let transport = OnuTransport::stream(IndicationStream::new(tx));
        let mut onu = onu(false, false);

        let err = onu
            .dispatch(OnuMessage::DiscoveryIndication, &transport)
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(onu.internal_state(), OnuState::Created);
    }

    #[tokio::test]
    async fn test_unexpected_omci_response_is_fatal() {
        let mut onu = onu(false, false);
        let transport = OnuTransport::default();
        let get_response = OmciFrame::new(1, omci_codec::MessageType::GetResponse, 2, 0).encode();
        let err = onu
            .dispatch(OnuMessage::OmciIndication(get_response), &transport)
            .await
            .unwrap_err();
        assert!(matches!(err, OnuError::OmciDesync { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_controller_terminates_worker() {
        let (onu, handle) = Onu::new(0, 1, 1, OnuConfig::default());
        handle.send(OnuMessage::StartOmci).await.unwrap();
        handle.send(OnuMessage::Activate).await.unwrap();

        onu.run(OnuTransport::default(), CancellationToken::new()).await;

        let snapshot = handle.snapshot();
        assert!(!snapshot.running);
        // the worker stopped before reaching the activation
        assert_eq!(snapshot.oper_state, OperState::Down);
        assert!(logs_contain("terminating ONU"));
        assert!(handle.send(OnuMessage::Activate).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let (onu, handle) = Onu::new(0, 1, 1, OnuConfig::default());
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(onu.run(OnuTransport::default(), cancel.clone()));

        handle.send(OnuMessage::Activate).await.unwrap();
        handle
            .watch()
            .wait_for(|s| s.internal_state == OnuState::Created && s.oper_state == OperState::Up)
            .await
            .unwrap();

        cancel.cancel();
        worker.await.unwrap();
        assert!(!handle.snapshot().running);
    }

    #[tokio::test]
    async fn test_callback_events_run_before_queued_messages() {
        let (tx, mut rx) = mpsc::channel(8);
        let (onu, handle) = Onu::new(0, 2, 5, OnuConfig::default());
        for message in [
            OnuMessage::DiscoveryIndication,
            OnuMessage::Activate,
            OnuMessage::Deactivate,
        ] {
            handle.send(message).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let transport = OnuTransport::stream(IndicationStream::new(tx));
        let worker = tokio::spawn(onu.run(transport, cancel.clone()));

        let disc = rx.recv().await.unwrap().unwrap();
        assert!(matches!(disc.data, Some(indication::Data::OnuDiscInd(_))));
        // sent before the queued deactivate is handled
        match rx.recv().await.unwrap().unwrap().data {
            Some(indication::Data::OnuInd(ind)) => {
                assert_eq!(ind.oper_state, "up");
                assert_eq!(ind.admin_state, "up");
            }
            other => panic!("unexpected indication {other:?}"),
        }

        handle
            .watch()
            .wait_for(|s| s.oper_state == OperState::Down)
            .await
            .unwrap();
        cancel.cancel();
        worker.await.unwrap();
    }
}
