//! Tokio driver for [`ConnectionEngine`].
//!
//! [`ConnectionHandle::spawn`] starts a task that owns the engine, both
//! sockets and the timers. The task runs a single `select!` loop over
//! application commands, datagrams on either socket and the earliest timer
//! deadline, feeding each into the engine and carrying out the engine's
//! outputs before waiting again. Engine events are forwarded to the
//! application on a bounded channel; when the application falls
//! [`EVENT_CAPACITY`] events behind, further events are dropped. The latest
//! state stays available through [`ConnectionHandle::state`].
//!
//! ```rust,no_run
//! use knx_tunnel::configuration::{ConnectionConfig, ConnectionKind};
//! use knx_tunnel::protocol::async_connection::ConnectionHandle;
//! use knx_tunnel::protocol::engine::{Event, State};
//! use knx_tunnel::protocol::tunnel::TunnelLayer;
//!
//! # async fn run() -> knx_tunnel::Result<()> {
//! let (handle, mut events) = ConnectionHandle::spawn(
//!     ConnectionConfig::default(),
//!     ConnectionKind::tunneling(TunnelLayer::LinkLayer),
//! );
//! handle.connect("192.168.1.10:3671".parse().unwrap()).await?;
//! handle.wait_for(State::Connected).await?;
//!
//! handle.send_cemi(&[0x11, 0x00, 0xBC, 0xE0, 0x11, 0x05, 0x00, 0x07, 0x01, 0x00, 0x81]).await?;
//! while let Some(event) = events.recv().await {
//!     if let Event::Received(cemi) = event {
//!         // decode cemi...
//!         let _ = cemi;
//!     }
//! }
//! handle.shutdown().await
//! # }
//! ```

use std::net::SocketAddr;

use heapless::Deque;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::configuration::{ConnectionConfig, ConnectionKind};
use crate::error::{KnxError, Result};
use crate::net::tokio_adapter::TokioUdpTransport;
use crate::net::transport::AsyncTransport;
use crate::net::Endpoint;
use crate::protocol::constants::MAX_FRAME_SIZE;
use crate::protocol::engine::{ConnectionEngine, Event, Output, SocketKind, State, TimerKind};
use crate::protocol::services::Cemi;

/// Depth of the command channel.
const COMMAND_CAPACITY: usize = 16;

/// Frames that can wait behind the one in flight.
pub const OUTBOX_CAPACITY: usize = 8;

/// Events buffered for the application.
pub const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
enum Command {
    Connect {
        remote: SocketAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        cemi: Cemi,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a spawned connection task.
///
/// Cloning the handle shares the same connection. The task disconnects and
/// stops once [`shutdown`](Self::shutdown) is called or every handle is
/// dropped.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<State>,
}

impl ConnectionHandle {
    /// Spawn a connection task using tokio UDP sockets.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: ConnectionConfig, kind: ConnectionKind) -> (Self, mpsc::Receiver<Event>) {
        Self::spawn_with_transport::<TokioUdpTransport>(config, kind)
    }

    /// Spawn a connection task over a custom transport.
    pub fn spawn_with_transport<T: AsyncTransport>(
        config: ConnectionConfig,
        kind: ConnectionKind,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(State::Disconnected);

        let driver = Driver::<T>::new(ConnectionEngine::new(config, kind), event_tx, state_tx);
        tokio::spawn(driver.run(command_rx));

        let handle = Self {
            commands: command_tx,
            state: state_rx,
        };
        (handle, event_rx)
    }

    /// Start connecting to the server control endpoint `remote`.
    ///
    /// Returns once the attempt has started; watch for
    /// `Event::StateChanged(State::Connected)` or use
    /// [`wait_for`](Self::wait_for).
    pub async fn connect(&self, remote: SocketAddr) -> Result<()> {
        self.request(|reply| Command::Connect { remote, reply }).await
    }

    /// Queue a cEMI frame.
    ///
    /// Frames are sent one at a time; `Event::Delivered` reports each
    /// acknowledged frame.
    ///
    /// # Errors
    ///
    /// - `NotConnected` outside `State::Connected`
    /// - `OutboxFull` when [`OUTBOX_CAPACITY`] frames are already waiting
    pub async fn send_cemi(&self, cemi: &[u8]) -> Result<()> {
        let cemi = Cemi::from_slice(cemi).map_err(|_| KnxError::payload_too_large())?;
        self.request(|reply| Command::Send { cemi, reply }).await
    }

    /// Close the session; the task keeps running for later connects.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Disconnect if needed and stop the task.
    pub async fn shutdown(self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_err() {
            // Task already gone
            return Ok(());
        }
        done.await.map_err(|_| KnxError::closed())
    }

    /// Last state reported by the engine
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Wait until the engine reports `state`.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the task stops first.
    pub async fn wait_for(&self, state: State) -> Result<()> {
        let mut watcher = self.state.clone();
        watcher
            .wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| KnxError::closed())
    }

    async fn request(&self, command: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| KnxError::closed())?;
        response.await.map_err(|_| KnxError::closed())?
    }
}

/// Task state: the engine plus the resources it asks for.
struct Driver<T: AsyncTransport> {
    engine: ConnectionEngine,
    control: Option<T>,
    data: Option<T>,
    deadlines: [Option<Instant>; 5],
    outbox: Deque<Cemi, OUTBOX_CAPACITY>,
    events: mpsc::Sender<Event>,
    state: watch::Sender<State>,
    shutdown: Option<oneshot::Sender<()>>,
    stopping: bool,
}

impl<T: AsyncTransport> Driver<T> {
    fn new(engine: ConnectionEngine, events: mpsc::Sender<Event>, state: watch::Sender<State>) -> Self {
        Self {
            engine,
            control: None,
            data: None,
            deadlines: [None; 5],
            outbox: Deque::new(),
            events,
            state,
            shutdown: None,
            stopping: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut control_buf = [0u8; MAX_FRAME_SIZE];
        let mut data_buf = [0u8; MAX_FRAME_SIZE];
        let mut commands_open = true;

        loop {
            self.process_outputs().await;
            if self.stopping && self.engine.state() == State::Disconnected {
                break;
            }

            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        commands_open = false;
                        self.stop();
                    }
                },
                received = receive(self.control.as_ref(), &mut control_buf) => {
                    self.handle_received(SocketKind::Control, received, &control_buf);
                }
                received = receive(self.data.as_ref(), &mut data_buf) => {
                    self.handle_received(SocketKind::Data, received, &data_buf);
                }
                timer = expire(deadline) => {
                    self.deadlines[timer.index()] = None;
                    self.engine.handle_timeout(timer);
                }
            }
        }

        knx_log!(debug, "Connection task stopped");
        if let Some(reply) = self.shutdown.take() {
            let _ = reply.send(());
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { remote, reply } => {
                let _ = reply.send(self.engine.connect(remote));
            }
            Command::Send { cemi, reply } => {
                let queue = self.engine.state() == State::Connected
                    && (self.engine.is_awaiting_acknowledge() || !self.outbox.is_empty());
                let result = if queue {
                    self.outbox.push_back(cemi).map_err(|_| {
                        knx_log!(warn, "Outbox full, refusing frame");
                        KnxError::outbox_full()
                    })
                } else {
                    self.engine.send_cemi(&cemi).map(|_| ())
                };
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.engine.disconnect());
            }
            Command::Shutdown { reply } => {
                self.shutdown = Some(reply);
                self.stop();
            }
        }
    }

    fn stop(&mut self) {
        self.stopping = true;
        if self.engine.state() != State::Disconnected {
            let _ = self.engine.disconnect();
        }
    }

    fn handle_received(&mut self, socket: SocketKind, received: Result<(usize, SocketAddr)>, buf: &[u8]) {
        match received {
            Ok((len, sender)) => self.engine.handle_datagram(socket, &buf[..len], sender),
            Err(_) => self.engine.receive_failed(socket),
        }
    }

    fn next_deadline(&self) -> Option<(TimerKind, Instant)> {
        TimerKind::ALL
            .into_iter()
            .filter_map(|timer| self.deadlines[timer.index()].map(|at| (timer, at)))
            .min_by_key(|&(_, at)| at)
    }

    async fn process_outputs(&mut self) {
        while let Some(output) = self.engine.poll_output() {
            match output {
                Output::Bind { control, data } => self.bind(control, data).await,
                Output::Transmit {
                    socket,
                    destination,
                    frame,
                } => {
                    let transport = match socket {
                        SocketKind::Control => self.control.as_ref(),
                        SocketKind::Data => self.data.as_ref(),
                    };
                    let sent = match transport {
                        Some(transport) => transport.send_to(&frame, SocketAddr::V4(destination)).await,
                        None => Err(KnxError::send_failed()),
                    };
                    if sent.is_err() {
                        self.engine.transmit_failed(socket);
                    }
                }
                Output::StartTimer { timer, duration } => {
                    self.deadlines[timer.index()] = Some(Instant::now() + duration);
                }
                Output::CancelTimer(timer) => self.deadlines[timer.index()] = None,
                Output::CloseSockets => {
                    self.control = None;
                    self.data = None;
                }
                Output::Event(event) => self.forward(event),
            }
        }
    }

    async fn bind(&mut self, control: Endpoint, data: Endpoint) {
        let remote = SocketAddr::V4(self.engine.remote_control_endpoint());
        let resolve = !self.engine.config().nat_aware && control.ip().is_unspecified();

        let bound = async {
            let control_socket = T::bind(SocketAddr::V4(control)).await?;
            let data_socket = T::bind(SocketAddr::V4(data)).await?;
            let mut control_addr = control_socket.local_addr()?;
            let mut data_addr = data_socket.local_addr()?;
            if resolve {
                let ip = T::local_address_for(remote).await?;
                control_addr.set_ip(ip);
                data_addr.set_ip(ip);
            }
            Ok::<_, KnxError>((control_socket, data_socket, control_addr, data_addr))
        }
        .await;

        match bound {
            Ok((control_socket, data_socket, control_addr, data_addr)) => {
                knx_log!(debug, "Sockets bound on ports {} and {}", control_addr.port(), data_addr.port());
                self.control = Some(control_socket);
                self.data = Some(data_socket);
                if self.engine.sockets_bound(control_addr, data_addr).is_err() {
                    knx_log!(warn, "Engine rejected bound sockets");
                }
            }
            Err(_) => self.engine.bind_failed(),
        }
    }

    fn forward(&mut self, event: Event) {
        match event {
            Event::StateChanged(state) => {
                self.state.send_replace(state);
                if state != State::Connected && !self.outbox.is_empty() {
                    knx_log!(debug, "Discarding {} queued frames", self.outbox.len());
                    self.outbox.clear();
                }
            }
            Event::Delivered { .. } => {
                if let Some(cemi) = self.outbox.pop_front() {
                    if self.engine.send_cemi(&cemi).is_err() {
                        knx_log!(warn, "Queued frame could not be sent");
                    }
                }
            }
            _ => {}
        }
        match self.events.try_send(event) {
            Err(mpsc::error::TrySendError::Full(_)) => {
                knx_log!(warn, "Event queue full, dropping event");
            }
            // The application may have dropped its receiver.
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn receive<T: AsyncTransport>(socket: Option<&T>, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => core::future::pending().await,
    }
}

async fn expire(deadline: Option<(TimerKind, Instant)>) -> TimerKind {
    match deadline {
        Some((timer, at)) => {
            tokio::time::sleep_until(at).await;
            timer
        }
        None => core::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::tunnel::TunnelLayer;

    fn driver() -> (Driver<TokioUdpTransport>, mpsc::Receiver<Event>) {
        let (events, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(State::Disconnected);
        let engine = ConnectionEngine::new(
            ConnectionConfig::default(),
            ConnectionKind::tunneling(TunnelLayer::LinkLayer),
        );
        (Driver::new(engine, events, state), event_rx)
    }

    fn send(driver: &mut Driver<TokioUdpTransport>, cemi: &[u8]) -> oneshot::Receiver<Result<()>> {
        let (reply, response) = oneshot::channel();
        let cemi = Cemi::from_slice(cemi).unwrap();
        driver.handle_command(Command::Send { cemi, reply });
        response
    }

    #[tokio::test]
    async fn test_send_without_session_is_refused_by_engine() {
        let (mut driver, _events) = driver();

        let err = send(&mut driver, &[0x29]).await.unwrap().unwrap_err();
        assert!(matches!(err, KnxError::Connection(ref e) if e.is_not_connected()));
        assert_eq!(driver.engine.error(), ErrorCode::State);
        assert!(driver.outbox.is_empty());
    }

    #[tokio::test]
    async fn test_event_overflow_drops_without_blocking() {
        let (mut driver, mut events) = driver();

        for _ in 0..EVENT_CAPACITY + 3 {
            driver.forward(Event::Delivered { sequence: 1 });
        }

        let mut count = 0;
        while events.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, EVENT_CAPACITY);
    }
}
