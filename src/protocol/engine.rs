//! KNXnet/IP connection engine.
//!
//! [`ConnectionEngine`] is the state machine of one connection-oriented
//! session. It performs no I/O: the owner feeds it inputs (bound sockets,
//! received datagrams, expired timers, application requests) and drains the
//! resulting [`Output`]s with [`ConnectionEngine::poll_output`]. Every input is
//! handled to completion before the next one, so all state transitions are
//! serialized.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected → Starting → Bound → Connecting → Connected → Disconnecting
//!      ↑            ↓ bind     ↓         ↓ rejected/  ↓ fatal        ↓
//!      └────────────┴──────────┴─────────┴─timeout────┴──────────────┘
//! ```
//!
//! ## Timers
//!
//! | Timer               | Armed in     | On expiry                              |
//! |---------------------|--------------|----------------------------------------|
//! | `ConnectRequest`    | Connecting   | fatal `Acknowledge`                    |
//! | `Heartbeat`         | Connected    | send `CONNECTIONSTATE_REQUEST`         |
//! | `ConnectionState`   | Connected    | resend, fatal `Heartbeat` after bound  |
//! | `Acknowledge`       | Connected    | resend frame, fatal `Cemi` after bound |
//! | `DisconnectRequest` | Disconnecting| finish teardown                        |
//!
//! A timeout for a timer the engine did not arm (or already cancelled) is a
//! no-op, so late timer events are harmless.

use core::net::SocketAddr;
use core::time::Duration;

use crate::addressing::IndividualAddress;
use crate::configuration::{ConnectionConfig, ConnectionKind};
use crate::error::{ErrorCode, KnxError, Result};
use crate::net::{is_unroutable, to_endpoint, to_ipv4, Endpoint, NAT_PLACEHOLDER};
use crate::protocol::constants::Status;
use crate::protocol::frame::{Frame, FrameBuffer, Hpai};
use crate::protocol::services::{
    Cemi, ConnectRequest, ConnectResponse, ConnectionInfo, ConnectionStateRequest,
    ConnectionStateResponse, DataAck, DataRequest, DisconnectRequest, DisconnectResponse,
    ServiceFrame,
};
use crate::protocol::tunnel;

/// Capacity of the output queue.
const OUTPUT_CAPACITY: usize = 32;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum State {
    /// No session; initial and terminal state
    #[default]
    Disconnected,
    /// Sockets requested from the owner
    Starting,
    /// Sockets bound, connect request not yet sent
    Bound,
    /// Waiting for `CONNECT_RESPONSE`
    Connecting,
    /// Session established
    Connected,
    /// Waiting for `DISCONNECT_RESPONSE`
    Disconnecting,
}

/// The two sockets a session owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketKind {
    /// Connection management (connect, heartbeat, disconnect)
    Control,
    /// Data exchange (requests and acknowledges)
    Data,
}

/// Timers driven by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerKind {
    /// Waiting for `CONNECT_RESPONSE`
    ConnectRequest,
    /// Pause between successful heartbeats
    Heartbeat,
    /// Waiting for `CONNECTIONSTATE_RESPONSE`
    ConnectionState,
    /// Waiting for a data acknowledge
    Acknowledge,
    /// Waiting for `DISCONNECT_RESPONSE`
    DisconnectRequest,
}

impl TimerKind {
    /// Every timer, in index order
    pub const ALL: [TimerKind; 5] = [
        TimerKind::ConnectRequest,
        TimerKind::Heartbeat,
        TimerKind::ConnectionState,
        TimerKind::Acknowledge,
        TimerKind::DisconnectRequest,
    ];

    /// Stable index in `0..5`
    pub const fn index(self) -> usize {
        match self {
            TimerKind::ConnectRequest => 0,
            TimerKind::Heartbeat => 1,
            TimerKind::ConnectionState => 2,
            TimerKind::Acknowledge => 3,
            TimerKind::DisconnectRequest => 4,
        }
    }
}

/// Notification for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The engine entered a new state
    StateChanged(State),
    /// The session failed; always followed by `StateChanged(Disconnected)`
    Error {
        /// Error class
        code: ErrorCode,
        /// Human-readable reason
        message: &'static str,
    },
    /// A cEMI frame arrived from the server
    Received(Cemi),
    /// The outbound frame with this sequence counter was acknowledged
    Delivered {
        /// Sequence counter of the delivered frame
        sequence: u8,
    },
}

/// Work the owner has to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Bind the control and data sockets, then call
    /// [`ConnectionEngine::sockets_bound`] or [`ConnectionEngine::bind_failed`]
    Bind {
        /// Requested control socket address
        control: Endpoint,
        /// Requested data socket address (port 0 = ephemeral)
        data: Endpoint,
    },
    /// Send a datagram
    Transmit {
        /// Socket to send from
        socket: SocketKind,
        /// Destination endpoint
        destination: Endpoint,
        /// Encoded frame
        frame: FrameBuffer,
    },
    /// Arm a timer, replacing any earlier deadline of the same kind
    StartTimer {
        /// Timer to arm
        timer: TimerKind,
        /// Delay until [`ConnectionEngine::handle_timeout`]
        duration: Duration,
    },
    /// Disarm a timer
    CancelTimer(TimerKind),
    /// Close both sockets
    CloseSockets,
    /// Notify the application
    Event(Event),
}

/// Per-session data, reset on every return to `Disconnected`.
#[derive(Debug, Clone)]
struct Session {
    channel_id: u8,
    send_count: u8,
    receive_count: u8,
    local_control: Endpoint,
    local_data: Endpoint,
    remote_control: Endpoint,
    remote_data: Endpoint,
    crd: ConnectionInfo,
    /// Last outbound data frame, kept until acknowledged
    pending: Option<FrameBuffer>,
    /// Transmissions of `pending` so far
    attempts: u8,
    /// Connection-state requests sent since the last good response
    state_requests: u8,
}

impl Session {
    const fn empty() -> Self {
        Self {
            channel_id: 0,
            send_count: 0,
            receive_count: 0,
            local_control: NAT_PLACEHOLDER,
            local_data: NAT_PLACEHOLDER,
            remote_control: NAT_PLACEHOLDER,
            remote_data: NAT_PLACEHOLDER,
            crd: ConnectionInfo::new(),
            pending: None,
            attempts: 0,
            state_requests: 0,
        }
    }
}

/// State machine of one KNXnet/IP connection.
#[derive(Debug)]
pub struct ConnectionEngine {
    config: ConnectionConfig,
    kind: ConnectionKind,
    state: State,
    session: Session,
    armed: [bool; 5],
    error: ErrorCode,
    error_message: &'static str,
    outputs: heapless::Deque<Output, OUTPUT_CAPACITY>,
}

impl ConnectionEngine {
    /// Create a disconnected engine
    pub fn new(config: ConnectionConfig, kind: ConnectionKind) -> Self {
        Self {
            config,
            kind,
            state: State::Disconnected,
            session: Session::empty(),
            armed: [false; 5],
            error: ErrorCode::None,
            error_message: "",
            outputs: heapless::Deque::new(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current state
    #[inline]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Configuration in use
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connection kind in use
    pub const fn kind(&self) -> &ConnectionKind {
        &self.kind
    }

    /// Most recent error
    pub const fn error(&self) -> ErrorCode {
        self.error
    }

    /// Human-readable text for [`error`](Self::error)
    pub const fn error_message(&self) -> &'static str {
        self.error_message
    }

    /// Channel id, while a channel is open
    pub const fn channel_id(&self) -> Option<u8> {
        match self.state {
            State::Connected | State::Disconnecting => Some(self.session.channel_id),
            _ => None,
        }
    }

    /// Sequence counter the next outbound data frame uses
    pub const fn send_sequence(&self) -> u8 {
        self.session.send_count
    }

    /// Sequence counter expected on the next inbound data frame
    pub const fn receive_sequence(&self) -> u8 {
        self.session.receive_count
    }

    /// Whether an outbound data frame waits for its acknowledge
    pub const fn is_awaiting_acknowledge(&self) -> bool {
        self.session.pending.is_some()
    }

    /// Server control endpoint
    pub const fn remote_control_endpoint(&self) -> Endpoint {
        self.session.remote_control
    }

    /// Server data endpoint, as negotiated in the connect handshake
    pub const fn remote_data_endpoint(&self) -> Endpoint {
        self.session.remote_data
    }

    /// Local control socket address
    pub const fn local_control_endpoint(&self) -> Endpoint {
        self.session.local_control
    }

    /// Local data socket address
    pub const fn local_data_endpoint(&self) -> Endpoint {
        self.session.local_data
    }

    /// CRD returned by the server
    pub fn crd(&self) -> &[u8] {
        &self.session.crd
    }

    /// Individual address the server assigned to a tunnel
    pub fn assigned_address(&self) -> Option<IndividualAddress> {
        tunnel::assigned_address(&self.session.crd)
    }

    /// Whether `timer` is currently armed
    pub const fn is_timer_armed(&self, timer: TimerKind) -> bool {
        self.armed[timer.index()]
    }

    /// Next piece of work for the owner
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    // =========================================================================
    // Application requests
    // =========================================================================

    /// Start connecting to the server control endpoint `remote`.
    ///
    /// Emits `Bind`; the handshake continues once the owner reports the
    /// bound sockets.
    ///
    /// # Errors
    ///
    /// - `AlreadyConnected` if the engine is not `Disconnected`
    /// - `NotIpv4` if `remote` or the configured local address is IPv6; the
    ///   engine stays `Disconnected` and records `ErrorCode::NotIpv4`
    pub fn connect(&mut self, remote: SocketAddr) -> Result<()> {
        if self.state != State::Disconnected {
            return Err(self.refuse("connect requested while a session exists", KnxError::already_connected()));
        }

        self.error = ErrorCode::None;
        self.error_message = "";

        let (remote, local) = match to_endpoint(remote).and_then(|r| Ok((r, to_ipv4(self.config.local_address)?))) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                knx_log!(warn, "Refusing to connect: address is not IPv4");
                self.record_error(ErrorCode::NotIpv4, "address is not IPv4");
                return Err(e);
            }
        };

        knx_log!(info, "Connecting to {:?}:{}", remote.ip().octets(), remote.port());
        self.session.remote_control = remote;
        self.set_state(State::Starting);
        self.emit(Output::Bind {
            control: Endpoint::new(local, self.config.local_port),
            data: Endpoint::new(local, 0),
        });
        Ok(())
    }

    /// Queue a cEMI frame for delivery.
    ///
    /// Returns the sequence counter the frame is sent with; `Delivered`
    /// with that counter follows once the server acknowledges it.
    ///
    /// # Errors
    ///
    /// - `NotConnected` outside `Connected`
    /// - `AwaitingAcknowledge` while an earlier frame is unacknowledged
    /// - `PayloadTooLarge` if `cemi` does not fit a frame
    pub fn send_cemi(&mut self, cemi: &[u8]) -> Result<u8> {
        if self.state != State::Connected {
            return Err(self.refuse("send requested without a connection", KnxError::not_connected()));
        }
        if self.session.pending.is_some() {
            return Err(self.refuse("send requested while awaiting acknowledge", KnxError::awaiting_acknowledge()));
        }

        let cemi = Cemi::from_slice(cemi).map_err(|_| KnxError::payload_too_large())?;
        let sequence = self.session.send_count;
        let request = DataRequest::new(self.kind.data_service, self.session.channel_id, sequence, cemi);
        let frame = request.to_frame().encode()?;

        knx_log!(debug, "Sending data frame {} ({} bytes)", sequence, frame.len());
        self.session.pending = Some(frame.clone());
        self.session.attempts = 1;
        self.emit(Output::Transmit {
            socket: SocketKind::Data,
            destination: self.session.remote_data,
            frame,
        });
        self.start_timer(TimerKind::Acknowledge, self.kind.acknowledge_timeout);
        Ok(sequence)
    }

    /// Close the session.
    ///
    /// Before the server assigned a channel the teardown is local. Once
    /// connected a `DISCONNECT_REQUEST` is sent and the engine waits for the
    /// response; if none arrives the teardown completes anyway.
    ///
    /// # Errors
    ///
    /// `InvalidState` when already `Disconnected`.
    pub fn disconnect(&mut self) -> Result<()> {
        match self.state {
            State::Disconnected => Err(self.refuse("disconnect requested without a session", KnxError::InvalidState)),
            State::Starting | State::Bound | State::Connecting => {
                knx_log!(info, "Aborting connection attempt");
                self.teardown(None);
                Ok(())
            }
            State::Connected => {
                knx_log!(info, "Disconnecting channel {}", self.session.channel_id);
                self.cancel_all_timers();
                self.session.pending = None;
                self.send_disconnect_request();
                self.start_timer(TimerKind::DisconnectRequest, self.config.disconnect_request_timeout);
                self.set_state(State::Disconnecting);
                Ok(())
            }
            State::Disconnecting => Ok(()),
        }
    }

    // =========================================================================
    // Owner reports
    // =========================================================================

    /// Report the addresses the sockets were bound to.
    ///
    /// With NAT mode off these are advertised to the server, so the owner
    /// should pass a routable address rather than `0.0.0.0`.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Starting`.
    pub fn sockets_bound(&mut self, control: SocketAddr, data: SocketAddr) -> Result<()> {
        if self.state != State::Starting {
            return Err(self.refuse("sockets reported outside of startup", KnxError::InvalidState));
        }

        let (control, data) = match (to_endpoint(control), to_endpoint(data)) {
            (Ok(control), Ok(data)) => (control, data),
            (Err(e), _) | (_, Err(e)) => {
                self.fail(ErrorCode::NotIpv4, "bound socket is not IPv4");
                return Err(e);
            }
        };

        self.session.local_control = control;
        self.session.local_data = data;
        self.set_state(State::Bound);

        let request = ConnectRequest::new(
            self.advertised(control),
            self.advertised(data),
            self.kind.cri.clone(),
        );
        self.transmit(SocketKind::Control, self.session.remote_control, &request.to_frame());
        self.start_timer(TimerKind::ConnectRequest, self.config.connect_request_timeout);
        self.set_state(State::Connecting);
        Ok(())
    }

    /// Report that binding a socket failed.
    pub fn bind_failed(&mut self) {
        if self.state == State::Starting {
            self.fail(ErrorCode::Network, "failed to bind sockets");
        }
    }

    /// Report that sending on `socket` failed.
    pub fn transmit_failed(&mut self, socket: SocketKind) {
        if self.state == State::Disconnected {
            return;
        }
        knx_log!(error, "Send failed on {:?} socket", socket);
        self.teardown(Some((ErrorCode::Network, "failed to send datagram")));
    }

    /// Report that receiving on `socket` failed.
    pub fn receive_failed(&mut self, socket: SocketKind) {
        if self.state == State::Disconnected {
            return;
        }
        knx_log!(error, "Receive failed on {:?} socket", socket);
        self.fail(ErrorCode::Network, "failed to receive datagram");
    }

    /// Process a datagram received on `socket` from `sender`.
    ///
    /// Undecodable frames, unsupported protocol versions, frames for another
    /// channel and out-of-sequence data are dropped silently.
    pub fn handle_datagram(&mut self, socket: SocketKind, data: &[u8], sender: SocketAddr) {
        if !matches!(self.state, State::Connecting | State::Connected | State::Disconnecting) {
            knx_log!(trace, "Ignoring datagram in state {:?}", self.state);
            return;
        }

        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(_) => {
                knx_log!(debug, "Dropping undecodable datagram ({} bytes) on {:?} socket", data.len(), socket);
                return;
            }
        };

        if !self.config.supports_version(frame.protocol_version()) {
            knx_log!(debug, "Dropping frame with protocol version {}", frame.protocol_version());
            return;
        }

        let service = match ServiceFrame::from_frame(&frame) {
            Ok(service) => service,
            Err(_) => {
                knx_log!(debug, "Dropping malformed {:?} frame", frame.service_type());
                return;
            }
        };

        match service {
            ServiceFrame::ConnectResponse(response) => self.on_connect_response(response, sender),
            ServiceFrame::ConnectionStateResponse(response) => self.on_connection_state_response(response),
            ServiceFrame::DisconnectRequest(request) => self.on_disconnect_request(request),
            ServiceFrame::DisconnectResponse(response) => self.on_disconnect_response(response),
            ServiceFrame::DataRequest(request) => self.on_data_request(request),
            ServiceFrame::DataAck(ack) => self.on_data_ack(ack),
            ServiceFrame::ConnectRequest(_) | ServiceFrame::ConnectionStateRequest(_) => {
                knx_log!(debug, "Ignoring server-side service {:?}", frame.service_type());
            }
        }
    }

    /// Process the expiry of `timer`.
    pub fn handle_timeout(&mut self, timer: TimerKind) {
        if !self.armed[timer.index()] {
            knx_log!(trace, "Ignoring stale {:?} timeout", timer);
            return;
        }
        self.armed[timer.index()] = false;

        match (timer, self.state) {
            (TimerKind::ConnectRequest, State::Connecting) => {
                knx_log!(warn, "No connect response from server");
                self.fail(ErrorCode::Acknowledge, "no connect response from server");
            }
            (TimerKind::Heartbeat, State::Connected) => {
                self.session.state_requests = 0;
                self.send_connection_state_request();
            }
            (TimerKind::ConnectionState, State::Connected) => {
                if self.session.state_requests >= self.config.max_connection_state_requests {
                    knx_log!(warn, "{} connection state requests unanswered", self.session.state_requests);
                    self.fail(ErrorCode::Heartbeat, "server stopped answering connection state requests");
                } else {
                    knx_log!(debug, "Connection state request {} unanswered, retrying", self.session.state_requests);
                    self.send_connection_state_request();
                }
            }
            (TimerKind::Acknowledge, State::Connected) => self.retransmit(),
            (TimerKind::DisconnectRequest, State::Disconnecting) => {
                knx_log!(info, "No disconnect response, closing anyway");
                self.teardown(None);
            }
            (timer, state) => {
                knx_log!(debug, "Ignoring {:?} timeout in state {:?}", timer, state);
            }
        }
    }

    // =========================================================================
    // Received services
    // =========================================================================

    fn on_connect_response(&mut self, response: ConnectResponse, sender: SocketAddr) {
        if self.state != State::Connecting {
            return;
        }
        self.cancel_timer(TimerKind::ConnectRequest);

        if !response.status.is_ok() {
            knx_log!(warn, "Connect request rejected: {}", response.status.description());
            self.fail(ErrorCode::Acknowledge, response.status.description());
            return;
        }
        if !response.data_endpoint.is_udp() {
            self.fail(ErrorCode::Acknowledge, "server offered a non-UDP data endpoint");
            return;
        }

        let mut remote_data = response.data_endpoint.endpoint();
        if self.config.nat_aware && is_unroutable(remote_data) {
            if let Ok(sender) = to_endpoint(sender) {
                knx_log!(debug, "Using datagram source as data endpoint");
                remote_data = sender;
            }
        }

        self.session.channel_id = response.channel_id;
        self.session.remote_data = remote_data;
        self.session.crd = response.crd;
        self.session.send_count = 0;
        self.session.receive_count = 0;

        knx_log!(info, "Connected on channel {}", response.channel_id);
        self.set_state(State::Connected);
        self.session.state_requests = 0;
        self.send_connection_state_request();
    }

    fn on_connection_state_response(&mut self, response: ConnectionStateResponse) {
        if self.state != State::Connected || response.channel_id != self.session.channel_id {
            return;
        }

        if response.status.is_ok() {
            self.cancel_timer(TimerKind::ConnectionState);
            self.session.state_requests = 0;
            if let Some(interval) = self.config.heartbeat_interval {
                self.start_timer(TimerKind::Heartbeat, interval);
            }
        } else if !self.is_timer_armed(TimerKind::ConnectionState) {
            knx_log!(debug, "Connection state {}, asking again", response.status.description());
            self.send_connection_state_request();
        } else {
            knx_log!(debug, "Connection state {}", response.status.description());
        }
    }

    fn on_disconnect_request(&mut self, request: DisconnectRequest) {
        if !matches!(self.state, State::Connected | State::Disconnecting)
            || request.channel_id != self.session.channel_id
        {
            knx_log!(debug, "Ignoring disconnect request for channel {}", request.channel_id);
            return;
        }

        knx_log!(info, "Server closed channel {}", request.channel_id);
        let response = DisconnectResponse::new(request.channel_id, Status::NoError);
        self.transmit(SocketKind::Control, self.session.remote_control, &response.to_frame());
        self.teardown(None);
    }

    fn on_disconnect_response(&mut self, response: DisconnectResponse) {
        if self.state == State::Disconnecting && response.channel_id == self.session.channel_id {
            self.teardown(None);
        }
    }

    fn on_data_request(&mut self, request: DataRequest) {
        if self.state != State::Connected || request.service != self.kind.data_service {
            return;
        }
        if request.channel_id() != self.session.channel_id {
            knx_log!(debug, "Ignoring data frame for channel {}", request.channel_id());
            return;
        }

        let sequence = request.sequence_counter();
        let expected = self.session.receive_count;

        if sequence == expected {
            self.acknowledge(sequence);
            self.session.receive_count = expected.wrapping_add(1);
            self.emit(Output::Event(Event::Received(request.cemi)));
        } else if sequence == expected.wrapping_sub(1) {
            knx_log!(debug, "Re-acknowledging repeated data frame {}", sequence);
            self.acknowledge(sequence);
        } else {
            knx_log!(warn, "Dropping data frame {} (expected {})", sequence, expected);
        }
    }

    fn on_data_ack(&mut self, ack: DataAck) {
        if self.state != State::Connected
            || ack.service != self.kind.data_service
            || ack.channel_id() != self.session.channel_id
        {
            return;
        }
        if self.session.pending.is_none() || ack.sequence_counter() != self.session.send_count {
            knx_log!(debug, "Ignoring unexpected acknowledge {}", ack.sequence_counter());
            return;
        }
        if !ack.status().is_ok() {
            knx_log!(warn, "Data frame {} rejected: {}", ack.sequence_counter(), ack.status().description());
            return;
        }

        self.cancel_timer(TimerKind::Acknowledge);
        let sequence = self.session.send_count;
        self.session.send_count = sequence.wrapping_add(1);
        self.session.pending = None;
        self.session.attempts = 0;
        self.emit(Output::Event(Event::Delivered { sequence }));
    }

    // =========================================================================
    // Outbound helpers
    // =========================================================================

    fn advertised(&self, endpoint: Endpoint) -> Hpai {
        if self.config.nat_aware {
            Hpai::udp(NAT_PLACEHOLDER)
        } else {
            Hpai::udp(endpoint)
        }
    }

    fn send_connection_state_request(&mut self) {
        self.session.state_requests = self.session.state_requests.saturating_add(1);
        let request =
            ConnectionStateRequest::new(self.session.channel_id, self.advertised(self.session.local_control));
        self.transmit(SocketKind::Control, self.session.remote_control, &request.to_frame());
        self.start_timer(TimerKind::ConnectionState, self.config.connection_state_request_timeout);
    }

    fn send_disconnect_request(&mut self) {
        let request = DisconnectRequest::new(self.session.channel_id, self.advertised(self.session.local_control));
        self.transmit(SocketKind::Control, self.session.remote_control, &request.to_frame());
    }

    fn acknowledge(&mut self, sequence: u8) {
        let ack = DataAck::new(self.kind.data_service, self.session.channel_id, sequence, Status::NoError);
        self.transmit(SocketKind::Data, self.session.remote_data, &ack.to_frame());
    }

    fn retransmit(&mut self) {
        if self.session.attempts >= self.kind.max_acknowledge_attempts {
            knx_log!(warn, "Data frame {} unacknowledged after {} attempts", self.session.send_count, self.session.attempts);
            self.fail(ErrorCode::Cemi, "data frame not acknowledged");
            return;
        }

        let Some(frame) = self.session.pending.clone() else {
            return;
        };
        self.session.attempts += 1;
        knx_log!(debug, "Resending data frame {}, attempt {}", self.session.send_count, self.session.attempts);
        self.emit(Output::Transmit {
            socket: SocketKind::Data,
            destination: self.session.remote_data,
            frame,
        });
        self.start_timer(TimerKind::Acknowledge, self.kind.acknowledge_timeout);
    }

    fn transmit(&mut self, socket: SocketKind, destination: Endpoint, frame: &Frame) {
        match frame.encode() {
            Ok(frame) => self.emit(Output::Transmit {
                socket,
                destination,
                frame,
            }),
            Err(_) => knx_log!(error, "Dropping oversized {:?} frame", frame.service_type()),
        }
    }

    // =========================================================================
    // State and timer bookkeeping
    // =========================================================================

    fn emit(&mut self, output: Output) {
        if self.outputs.push_back(output).is_err() {
            knx_log!(error, "Output queue full, dropping output");
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            knx_log!(debug, "State {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(Output::Event(Event::StateChanged(state)));
        }
    }

    fn start_timer(&mut self, timer: TimerKind, duration: Duration) {
        self.armed[timer.index()] = true;
        self.emit(Output::StartTimer { timer, duration });
    }

    fn cancel_timer(&mut self, timer: TimerKind) {
        if self.armed[timer.index()] {
            self.armed[timer.index()] = false;
            self.emit(Output::CancelTimer(timer));
        }
    }

    fn cancel_all_timers(&mut self) {
        for timer in TimerKind::ALL {
            self.cancel_timer(timer);
        }
    }

    fn record_error(&mut self, code: ErrorCode, message: &'static str) {
        self.error = code;
        self.error_message = message;
        self.emit(Output::Event(Event::Error { code, message }));
    }

    /// Record a refused request; the session is left untouched.
    fn refuse(&mut self, message: &'static str, error: KnxError) -> KnxError {
        knx_log!(warn, "Refused: {}", message);
        self.error = ErrorCode::State;
        self.error_message = message;
        error
    }

    /// Fatal error: tell the server if a channel is open, then tear down.
    fn fail(&mut self, code: ErrorCode, message: &'static str) {
        knx_log!(error, "Connection failed: {}", message);
        if self.state == State::Connected {
            self.send_disconnect_request();
        }
        self.teardown(Some((code, message)));
    }

    fn teardown(&mut self, error: Option<(ErrorCode, &'static str)>) {
        self.cancel_all_timers();
        self.emit(Output::CloseSockets);
        self.session = Session::empty();
        if let Some((code, message)) = error {
            self.record_error(code, message);
        }
        self.set_state(State::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::ServiceType;
    use crate::protocol::services::DataService;
    use crate::protocol::tunnel::TunnelLayer;
    use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    const SERVER: &str = "192.168.1.10:3671";
    const SERVER_DATA: &str = "192.168.1.10:50100";
    const LOCAL_CONTROL: &str = "192.168.1.50:40000";
    const LOCAL_DATA: &str = "192.168.1.50:40001";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::default().with_local_address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)))
    }

    fn tunneling(config: ConnectionConfig) -> ConnectionEngine {
        ConnectionEngine::new(config, ConnectionKind::tunneling(TunnelLayer::LinkLayer))
    }

    fn drain(engine: &mut ConnectionEngine) -> Vec<Output> {
        core::iter::from_fn(|| engine.poll_output()).collect()
    }

    fn transmitted(outputs: &[Output]) -> Vec<(SocketKind, Endpoint, ServiceFrame)> {
        outputs
            .iter()
            .filter_map(|o| match o {
                Output::Transmit {
                    socket,
                    destination,
                    frame,
                } => Some((*socket, *destination, ServiceFrame::decode(frame).unwrap())),
                _ => None,
            })
            .collect()
    }

    fn events(outputs: &[Output]) -> Vec<Event> {
        outputs
            .iter()
            .filter_map(|o| match o {
                Output::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn bytes(frame: &Frame) -> FrameBuffer {
        frame.encode().unwrap()
    }

    fn connect_response(channel_id: u8, status: Status, data: &str) -> FrameBuffer {
        let crd = ConnectionInfo::from_slice(&[0x04, 0x04, 0x11, 0x05]).unwrap();
        bytes(&ConnectResponse::new(channel_id, status, Hpai::udp(ep(data)), crd).to_frame())
    }

    fn data_request(channel_id: u8, sequence: u8, cemi: &[u8]) -> FrameBuffer {
        let cemi = Cemi::from_slice(cemi).unwrap();
        bytes(&DataRequest::new(DataService::Tunnelling, channel_id, sequence, cemi).to_frame())
    }

    fn data_ack(channel_id: u8, sequence: u8, status: Status) -> FrameBuffer {
        bytes(&DataAck::new(DataService::Tunnelling, channel_id, sequence, status).to_frame())
    }

    /// Drive `engine` up to `Connecting`.
    fn start(engine: &mut ConnectionEngine) -> Vec<Output> {
        engine.connect(addr(SERVER)).unwrap();
        let mut outputs = drain(engine);
        engine.sockets_bound(addr(LOCAL_CONTROL), addr(LOCAL_DATA)).unwrap();
        outputs.extend(drain(engine));
        outputs
    }

    /// Connected engine on channel 7 with all outputs drained.
    fn connected(config: ConnectionConfig) -> ConnectionEngine {
        let mut engine = tunneling(config);
        start(&mut engine);
        engine.handle_datagram(SocketKind::Control, &connect_response(7, Status::NoError, SERVER_DATA), addr(SERVER));
        drain(&mut engine);
        assert_eq!(engine.state(), State::Connected);
        engine
    }

    fn assert_ends_disconnected(outputs: &[Output], code: ErrorCode) {
        let events = events(outputs);
        assert!(outputs.contains(&Output::CloseSockets));
        assert_eq!(events.last(), Some(&Event::StateChanged(State::Disconnected)));
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::Error { code, .. } => Some(*code),
                _ => None,
            })
            .collect();
        if code == ErrorCode::None {
            assert!(errors.is_empty());
        } else {
            assert_eq!(errors, vec![code]);
        }
    }

    #[test]
    fn test_connect_handshake() {
        let mut engine = tunneling(config());
        engine.connect(addr(SERVER)).unwrap();
        let outputs = drain(&mut engine);
        assert_eq!(
            outputs,
            vec![
                Output::Event(Event::StateChanged(State::Starting)),
                Output::Bind {
                    control: ep("192.168.1.50:0"),
                    data: ep("192.168.1.50:0"),
                },
            ]
        );

        engine.sockets_bound(addr(LOCAL_CONTROL), addr(LOCAL_DATA)).unwrap();
        let outputs = drain(&mut engine);
        let sent = transmitted(&outputs);
        assert_eq!(sent.len(), 1);
        let (socket, destination, ServiceFrame::ConnectRequest(request)) = &sent[0] else {
            panic!("expected connect request");
        };
        assert_eq!(*socket, SocketKind::Control);
        assert_eq!(*destination, ep(SERVER));
        assert_eq!(request.control_endpoint.endpoint(), ep(LOCAL_CONTROL));
        assert_eq!(request.data_endpoint.endpoint(), ep(LOCAL_DATA));
        assert_eq!(request.cri.as_slice(), &[0x04, 0x04, 0x02, 0x00]);
        assert!(outputs.contains(&Output::StartTimer {
            timer: TimerKind::ConnectRequest,
            duration: Duration::from_secs(10),
        }));
        assert_eq!(
            events(&outputs),
            vec![Event::StateChanged(State::Bound), Event::StateChanged(State::Connecting)]
        );

        engine.handle_datagram(SocketKind::Control, &connect_response(7, Status::NoError, SERVER_DATA), addr(SERVER));
        let outputs = drain(&mut engine);
        assert_eq!(engine.state(), State::Connected);
        assert_eq!(engine.channel_id(), Some(7));
        assert_eq!(engine.remote_data_endpoint(), ep(SERVER_DATA));
        assert_eq!(engine.assigned_address().unwrap().to_string(), "1.1.5");
        assert!(outputs.contains(&Output::CancelTimer(TimerKind::ConnectRequest)));
        assert!(events(&outputs).contains(&Event::StateChanged(State::Connected)));

        // First heartbeat goes out right away
        let sent = transmitted(&outputs);
        assert_eq!(sent.len(), 1);
        let (SocketKind::Control, destination, ServiceFrame::ConnectionStateRequest(request)) = &sent[0] else {
            panic!("expected connection state request");
        };
        assert_eq!(*destination, ep(SERVER));
        assert_eq!(request.channel_id, 7);
        assert!(engine.is_timer_armed(TimerKind::ConnectionState));
        assert!(!engine.is_timer_armed(TimerKind::ConnectRequest));
    }

    #[test]
    fn test_connect_rejects_ipv6() {
        let mut engine = tunneling(config());
        let err = engine.connect(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 3671)).unwrap_err();
        assert!(matches!(err, KnxError::Connection(ref e) if e.is_not_ipv4()));
        assert_eq!(engine.state(), State::Disconnected);
        assert_eq!(engine.error(), ErrorCode::NotIpv4);
        assert_eq!(
            drain(&mut engine),
            vec![Output::Event(Event::Error {
                code: ErrorCode::NotIpv4,
                message: "address is not IPv4",
            })]
        );

        let mut engine = tunneling(config().with_local_address(IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        assert!(engine.connect(addr(SERVER)).is_err());
        assert_eq!(engine.state(), State::Disconnected);
    }

    #[test]
    fn test_connect_refused_when_busy() {
        let mut engine = tunneling(config());
        start(&mut engine);
        let err = engine.connect(addr(SERVER)).unwrap_err();
        assert!(matches!(err, KnxError::Connection(_)));
        assert_eq!(engine.state(), State::Connecting);
        assert_eq!(engine.error(), ErrorCode::State);
        assert!(drain(&mut engine).is_empty());
    }

    #[test]
    fn test_bind_failure_is_network_error() {
        let mut engine = tunneling(config());
        engine.connect(addr(SERVER)).unwrap();
        drain(&mut engine);

        engine.bind_failed();
        let outputs = drain(&mut engine);
        assert_ends_disconnected(&outputs, ErrorCode::Network);
        assert_eq!(engine.error(), ErrorCode::Network);
    }

    #[test]
    fn test_connect_rejected_by_server() {
        let mut engine = tunneling(config());
        start(&mut engine);

        let rejected = bytes(&ConnectResponse::new(0, Status::NoMoreConnections, Hpai::udp(NAT_PLACEHOLDER), ConnectionInfo::new()).to_frame());
        engine.handle_datagram(SocketKind::Control, &rejected, addr(SERVER));
        let outputs = drain(&mut engine);

        assert!(transmitted(&outputs).is_empty());
        assert_ends_disconnected(&outputs, ErrorCode::Acknowledge);
        assert_eq!(engine.error_message(), "server cannot accept more connections");
    }

    #[test]
    fn test_connect_rejection_without_crd() {
        let mut engine = tunneling(config());
        start(&mut engine);

        let rejected = Frame::new(ServiceType::ConnectResponse)
            .with(&[0x00, Status::NoMoreConnections.to_u8()])
            .with(&Hpai::udp(NAT_PLACEHOLDER).to_bytes());
        engine.handle_datagram(SocketKind::Control, &bytes(&rejected), addr(SERVER));
        let outputs = drain(&mut engine);

        assert!(transmitted(&outputs).is_empty());
        assert_ends_disconnected(&outputs, ErrorCode::Acknowledge);
        assert_eq!(engine.error_message(), Status::NoMoreConnections.description());
        assert!(!engine.is_timer_armed(TimerKind::ConnectRequest));
    }

    #[test]
    fn test_connect_timeout() {
        let mut engine = tunneling(config());
        start(&mut engine);

        engine.handle_timeout(TimerKind::ConnectRequest);
        let outputs = drain(&mut engine);
        assert!(transmitted(&outputs).is_empty());
        assert_ends_disconnected(&outputs, ErrorCode::Acknowledge);

        // Late duplicate is a no-op
        engine.handle_timeout(TimerKind::ConnectRequest);
        assert!(drain(&mut engine).is_empty());
    }

    #[test]
    fn test_heartbeat_exhaustion() {
        let mut engine = connected(config());

        engine.handle_timeout(TimerKind::ConnectionState);
        engine.handle_timeout(TimerKind::ConnectionState);
        let outputs = drain(&mut engine);
        let retries = transmitted(&outputs);
        assert_eq!(retries.len(), 2);
        assert!(retries
            .iter()
            .all(|(_, _, f)| matches!(f, ServiceFrame::ConnectionStateRequest(r) if r.channel_id == 7)));
        assert_eq!(engine.state(), State::Connected);

        engine.handle_timeout(TimerKind::ConnectionState);
        let outputs = drain(&mut engine);
        assert_ends_disconnected(&outputs, ErrorCode::Heartbeat);

        // Best-effort disconnect request so the server frees the channel
        let sent = transmitted(&outputs);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].2, ServiceFrame::DisconnectRequest(ref r) if r.channel_id == 7));
        assert_eq!(engine.channel_id(), None);
    }

    #[test]
    fn test_heartbeat_cycle() {
        let mut engine = connected(config());

        let ok = bytes(&ConnectionStateResponse::new(7, Status::NoError).to_frame());
        engine.handle_datagram(SocketKind::Control, &ok, addr(SERVER));
        let outputs = drain(&mut engine);
        assert_eq!(
            outputs,
            vec![
                Output::CancelTimer(TimerKind::ConnectionState),
                Output::StartTimer {
                    timer: TimerKind::Heartbeat,
                    duration: Duration::from_secs(60),
                },
            ]
        );

        // A stale connection-state timeout after the response is harmless
        engine.handle_timeout(TimerKind::ConnectionState);
        assert!(drain(&mut engine).is_empty());

        engine.handle_timeout(TimerKind::Heartbeat);
        let outputs = drain(&mut engine);
        let sent = transmitted(&outputs);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].2, ServiceFrame::ConnectionStateRequest(_)));
        assert!(engine.is_timer_armed(TimerKind::ConnectionState));

        // Responses for other channels do not count
        let other = bytes(&ConnectionStateResponse::new(8, Status::NoError).to_frame());
        engine.handle_datagram(SocketKind::Control, &other, addr(SERVER));
        assert!(drain(&mut engine).is_empty());
    }

    #[test]
    fn test_heartbeat_disabled() {
        let mut engine = connected(config().with_heartbeat_interval(None));
        let ok = bytes(&ConnectionStateResponse::new(7, Status::NoError).to_frame());
        engine.handle_datagram(SocketKind::Control, &ok, addr(SERVER));
        assert_eq!(drain(&mut engine), vec![Output::CancelTimer(TimerKind::ConnectionState)]);
        assert!(!engine.is_timer_armed(TimerKind::Heartbeat));
    }

    #[test]
    fn test_connection_state_error_resync() {
        let mut engine = connected(config());
        let error = bytes(&ConnectionStateResponse::new(7, Status::DataConnection).to_frame());

        // Request still pending: wait for its timer
        engine.handle_datagram(SocketKind::Control, &error, addr(SERVER));
        assert!(drain(&mut engine).is_empty());

        let ok = bytes(&ConnectionStateResponse::new(7, Status::NoError).to_frame());
        engine.handle_datagram(SocketKind::Control, &ok, addr(SERVER));
        drain(&mut engine);

        // No request pending: ask again right away
        engine.handle_datagram(SocketKind::Control, &error, addr(SERVER));
        let sent = transmitted(&drain(&mut engine));
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].2, ServiceFrame::ConnectionStateRequest(_)));
    }

    #[test]
    fn test_data_frame_attempts_exhausted() {
        let mut engine = connected(config());
        let sequence = engine.send_cemi(&[0x11, 0x00, 0xBC, 0xE0]).unwrap();
        assert_eq!(sequence, 0);

        // Three attempts: the first send and two identical resends

        engine.handle_timeout(TimerKind::Acknowledge);
        engine.handle_timeout(TimerKind::Acknowledge);
        let outputs = drain(&mut engine);
        assert_eq!(engine.state(), State::Connected);
        assert_eq!(engine.send_sequence(), 0);

        let frames: Vec<_> = outputs
            .iter()
            .filter_map(|o| match o {
                Output::Transmit {
                    socket: SocketKind::Data,
                    destination,
                    frame,
                } => Some((*destination, frame.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f == &frames[0]));
        assert_eq!(frames[0].0, ep(SERVER_DATA));

        engine.handle_timeout(TimerKind::Acknowledge);
        let outputs = drain(&mut engine);
        assert_ends_disconnected(&outputs, ErrorCode::Cemi);
    }

    #[test]
    fn test_send_sequence_wraps() {
        let mut engine = connected(config());
        for i in 0..300u32 {
            let sequence = engine.send_cemi(&[0x29, 0x00]).unwrap();
            assert_eq!(u32::from(sequence), i % 256);
            engine.handle_datagram(SocketKind::Data, &data_ack(7, sequence, Status::NoError), addr(SERVER_DATA));
            let outputs = drain(&mut engine);
            assert!(events(&outputs).contains(&Event::Delivered { sequence }));
        }
        assert_eq!(engine.send_sequence(), (300 % 256) as u8);
    }

    #[test]
    fn test_receive_sequence_wraps() {
        let mut engine = connected(config());
        for sequence in 0..=255u8 {
            engine.handle_datagram(SocketKind::Data, &data_request(7, sequence, &[0x29, sequence]), addr(SERVER_DATA));
            let outputs = drain(&mut engine);
            assert_eq!(events(&outputs), vec![Event::Received(Cemi::from_slice(&[0x29, sequence]).unwrap())]);
        }
        assert_eq!(engine.receive_sequence(), 0);

        // 255 again while expecting 0 is a repeat
        engine.handle_datagram(SocketKind::Data, &data_request(7, 255, &[0x29, 0xFF]), addr(SERVER_DATA));
        let outputs = drain(&mut engine);
        assert_eq!(
            transmitted(&outputs),
            vec![(
                SocketKind::Data,
                ep(SERVER_DATA),
                ServiceFrame::DataAck(DataAck::new(DataService::Tunnelling, 7, 255, Status::NoError))
            )]
        );
        assert!(events(&outputs).is_empty());
        assert_eq!(engine.receive_sequence(), 0);

        engine.handle_datagram(SocketKind::Data, &data_request(7, 0, &[0x29, 0x00]), addr(SERVER_DATA));
        let outputs = drain(&mut engine);
        assert_eq!(events(&outputs), vec![Event::Received(Cemi::from_slice(&[0x29, 0x00]).unwrap())]);
        assert_eq!(engine.receive_sequence(), 1);
    }

    #[test]
    fn test_one_frame_in_flight() {
        let mut engine = connected(config());
        engine.send_cemi(&[0x29]).unwrap();
        let err = engine.send_cemi(&[0x2A]).unwrap_err();
        assert!(matches!(err, KnxError::Connection(ref e) if e.is_awaiting_acknowledge()));

        let outputs = drain(&mut engine);
        assert_eq!(transmitted(&outputs).len(), 1);
        assert!(engine.is_awaiting_acknowledge());
    }

    #[test]
    fn test_send_requires_connection() {
        let mut engine = tunneling(config());
        let err = engine.send_cemi(&[0x29]).unwrap_err();
        assert!(matches!(err, KnxError::Connection(ref e) if e.is_not_connected()));

        let mut engine = connected(config());
        let err = engine.send_cemi(&[0u8; 247]).unwrap_err();
        assert!(matches!(err, KnxError::Protocol(ref e) if e.is_payload_too_large()));
        assert!(!engine.is_awaiting_acknowledge());
    }

    #[test]
    fn test_rejected_or_mismatched_ack_is_not_delivery() {
        let mut engine = connected(config());
        engine.send_cemi(&[0x29]).unwrap();
        drain(&mut engine);

        for ack in [
            data_ack(7, 0, Status::KnxConnection),
            data_ack(7, 1, Status::NoError),
            data_ack(9, 0, Status::NoError),
        ] {
            engine.handle_datagram(SocketKind::Data, &ack, addr(SERVER_DATA));
        }
        assert!(drain(&mut engine).is_empty());
        assert!(engine.is_awaiting_acknowledge());

        // The retry timer still resends the frame
        engine.handle_timeout(TimerKind::Acknowledge);
        assert_eq!(transmitted(&drain(&mut engine)).len(), 1);
    }

    #[test]
    fn test_inbound_data_dedup() {
        let mut engine = connected(config());
        let frame = data_request(7, 0, &[0x29, 0x00, 0xBC]);

        engine.handle_datagram(SocketKind::Data, &frame, addr(SERVER_DATA));
        engine.handle_datagram(SocketKind::Data, &frame, addr(SERVER_DATA));
        let outputs = drain(&mut engine);

        let acks: Vec<_> = transmitted(&outputs)
            .into_iter()
            .map(|(socket, destination, f)| {
                assert_eq!(socket, SocketKind::Data);
                assert_eq!(destination, ep(SERVER_DATA));
                f
            })
            .collect();
        assert_eq!(
            acks,
            vec![
                ServiceFrame::DataAck(DataAck::new(DataService::Tunnelling, 7, 0, Status::NoError)),
                ServiceFrame::DataAck(DataAck::new(DataService::Tunnelling, 7, 0, Status::NoError)),
            ]
        );
        let received: Vec<_> = events(&outputs)
            .into_iter()
            .filter(|e| matches!(e, Event::Received(_)))
            .collect();
        assert_eq!(received, vec![Event::Received(Cemi::from_slice(&[0x29, 0x00, 0xBC]).unwrap())]);
        assert_eq!(engine.receive_sequence(), 1);
    }

    #[test]
    fn test_inbound_out_of_sequence_and_foreign_channel() {
        let mut engine = connected(config());

        engine.handle_datagram(SocketKind::Data, &data_request(7, 5, &[0x29]), addr(SERVER_DATA));
        engine.handle_datagram(SocketKind::Data, &data_request(3, 0, &[0x29]), addr(SERVER_DATA));
        assert!(drain(&mut engine).is_empty());
        assert_eq!(engine.receive_sequence(), 0);

        // Device configuration frames do not belong to a tunnel
        let foreign = bytes(
            &DataRequest::new(DataService::DeviceConfiguration, 7, 0, Cemi::from_slice(&[0xFC]).unwrap()).to_frame(),
        );
        engine.handle_datagram(SocketKind::Data, &foreign, addr(SERVER_DATA));
        assert!(drain(&mut engine).is_empty());
    }

    #[test]
    fn test_nat_substitutes_sender() {
        let mut engine = tunneling(config().with_nat_aware(true));
        let sent = transmitted(&start(&mut engine));
        let (_, _, ServiceFrame::ConnectRequest(request)) = &sent[0] else {
            panic!("expected connect request");
        };
        assert_eq!(request.control_endpoint.endpoint(), NAT_PLACEHOLDER);
        assert_eq!(request.data_endpoint.endpoint(), NAT_PLACEHOLDER);

        engine.handle_datagram(
            SocketKind::Control,
            &connect_response(7, Status::NoError, "0.0.0.0:0"),
            addr("203.0.113.5:3671"),
        );
        assert_eq!(engine.state(), State::Connected);
        assert_eq!(engine.remote_data_endpoint(), ep("203.0.113.5:3671"));

        // Heartbeats advertise the placeholder too
        let sent = transmitted(&drain(&mut engine));
        assert!(matches!(sent[0].2, ServiceFrame::ConnectionStateRequest(ref r) if r.control_endpoint.endpoint() == NAT_PLACEHOLDER));
    }

    #[test]
    fn test_without_nat_advertised_endpoint_wins() {
        let mut engine = tunneling(config());
        start(&mut engine);
        engine.handle_datagram(
            SocketKind::Control,
            &connect_response(7, Status::NoError, SERVER_DATA),
            addr("203.0.113.5:3671"),
        );
        assert_eq!(engine.remote_data_endpoint(), ep(SERVER_DATA));
    }

    #[test]
    fn test_disconnect_while_connecting() {
        let mut engine = tunneling(config());
        start(&mut engine);

        engine.disconnect().unwrap();
        let outputs = drain(&mut engine);
        assert!(transmitted(&outputs).is_empty());
        assert!(outputs.contains(&Output::CancelTimer(TimerKind::ConnectRequest)));
        assert_ends_disconnected(&outputs, ErrorCode::None);
        assert_eq!(engine.state(), State::Disconnected);

        // A late connect response is ignored
        engine.handle_datagram(SocketKind::Control, &connect_response(7, Status::NoError, SERVER_DATA), addr(SERVER));
        assert!(drain(&mut engine).is_empty());
    }

    #[test]
    fn test_disconnect_handshake() {
        let mut engine = connected(config());
        engine.send_cemi(&[0x29]).unwrap();
        drain(&mut engine);

        engine.disconnect().unwrap();
        let outputs = drain(&mut engine);
        assert_eq!(engine.state(), State::Disconnecting);
        assert!(outputs.contains(&Output::CancelTimer(TimerKind::Acknowledge)));
        assert!(outputs.contains(&Output::CancelTimer(TimerKind::ConnectionState)));
        let sent = transmitted(&outputs);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], (SocketKind::Control, _, ServiceFrame::DisconnectRequest(ref r)) if r.channel_id == 7));

        // Second call is a no-op
        engine.disconnect().unwrap();
        assert!(drain(&mut engine).is_empty());

        let response = bytes(&DisconnectResponse::new(7, Status::NoError).to_frame());
        engine.handle_datagram(SocketKind::Control, &response, addr(SERVER));
        let outputs = drain(&mut engine);
        assert!(outputs.contains(&Output::CancelTimer(TimerKind::DisconnectRequest)));
        assert_ends_disconnected(&outputs, ErrorCode::None);

        let err = engine.disconnect().unwrap_err();
        assert!(matches!(err, KnxError::InvalidState));
    }

    #[test]
    fn test_disconnect_timeout_completes() {
        let mut engine = connected(config());
        engine.disconnect().unwrap();
        drain(&mut engine);

        engine.handle_timeout(TimerKind::DisconnectRequest);
        let outputs = drain(&mut engine);
        assert_ends_disconnected(&outputs, ErrorCode::None);
        assert_eq!(engine.error(), ErrorCode::None);
    }

    #[test]
    fn test_server_initiated_disconnect() {
        let mut engine = connected(config());

        let foreign = bytes(&DisconnectRequest::new(8, Hpai::udp(ep(SERVER))).to_frame());
        engine.handle_datagram(SocketKind::Control, &foreign, addr(SERVER));
        assert!(drain(&mut engine).is_empty());

        let request = bytes(&DisconnectRequest::new(7, Hpai::udp(ep(SERVER))).to_frame());
        engine.handle_datagram(SocketKind::Control, &request, addr(SERVER));
        let outputs = drain(&mut engine);
        let sent = transmitted(&outputs);
        assert_eq!(
            sent,
            vec![(
                SocketKind::Control,
                ep(SERVER),
                ServiceFrame::DisconnectResponse(DisconnectResponse::new(7, Status::NoError)),
            )]
        );
        assert_ends_disconnected(&outputs, ErrorCode::None);
    }

    #[test]
    fn test_unsupported_version_dropped() {
        let mut engine = tunneling(config());
        start(&mut engine);

        let mut response = connect_response(7, Status::NoError, SERVER_DATA);
        response[1] = 0x20;
        engine.handle_datagram(SocketKind::Control, &response, addr(SERVER));
        assert_eq!(engine.state(), State::Connecting);

        let mut engine = tunneling(config().with_supported_versions(&[0x10, 0x20]));
        start(&mut engine);
        engine.handle_datagram(SocketKind::Control, &response, addr(SERVER));
        assert_eq!(engine.state(), State::Connected);
    }

    #[test]
    fn test_garbage_is_ignored() {
        let mut engine = connected(config());
        engine.handle_datagram(SocketKind::Data, &[0x06, 0x10, 0x04], addr(SERVER_DATA));
        engine.handle_datagram(SocketKind::Data, &[0x06, 0x10, 0x04, 0x21, 0x00, 0x0B, 0x04, 7, 0, 0, 0], addr(SERVER_DATA));
        engine.handle_datagram(SocketKind::Control, &[0x06, 0x10, 0x02, 0x01, 0x00, 0x06], addr(SERVER));
        assert!(drain(&mut engine).is_empty());
        assert_eq!(engine.state(), State::Connected);
    }

    #[test]
    fn test_transmit_failure_tears_down() {
        let mut engine = connected(config());
        engine.transmit_failed(SocketKind::Data);
        let outputs = drain(&mut engine);
        assert!(transmitted(&outputs).is_empty());
        assert_ends_disconnected(&outputs, ErrorCode::Network);
    }

    #[test]
    fn test_device_management_frames() {
        let mut engine = ConnectionEngine::new(config(), ConnectionKind::device_management());
        let sent = transmitted(&start(&mut engine));
        let (_, _, ServiceFrame::ConnectRequest(request)) = &sent[0] else {
            panic!("expected connect request");
        };
        assert_eq!(request.cri.as_slice(), &[0x02, 0x03]);

        let crd = ConnectionInfo::from_slice(&[0x02, 0x03]).unwrap();
        let response = bytes(&ConnectResponse::new(4, Status::NoError, Hpai::udp(ep(SERVER_DATA)), crd).to_frame());
        engine.handle_datagram(SocketKind::Control, &response, addr(SERVER));
        drain(&mut engine);
        assert_eq!(engine.assigned_address(), None);

        engine.send_cemi(&[0xFC, 0x00, 0x00, 0x01, 0x35, 0x10, 0x01]).unwrap();
        let outputs = drain(&mut engine);
        let Output::Transmit { frame, .. } = &outputs[0] else {
            panic!("expected transmit");
        };
        assert_eq!(
            Frame::decode(frame).unwrap().service_type(),
            ServiceType::DeviceConfigurationRequest
        );
        assert!(outputs.contains(&Output::StartTimer {
            timer: TimerKind::Acknowledge,
            duration: Duration::from_secs(10),
        }));

        let ack = bytes(&DataAck::new(DataService::DeviceConfiguration, 4, 0, Status::NoError).to_frame());
        engine.handle_datagram(SocketKind::Data, &ack, addr(SERVER_DATA));
        assert!(events(&drain(&mut engine)).contains(&Event::Delivered { sequence: 0 }));
    }
}
