//! SocketWorker: login, keepalive, address negotiation and reconnection
//!
//! One task owns the event loop; every state change, inbound control
//! message and timer expiry is handled there in order. A second task reads
//! the connection and hands control messages to the loop and data frames to
//! the tap worker.

use crate::config::PointConfig;
use crate::event::WorkerEvent;
use crate::reconnect::ReconnectManager;
use lanlink_proto::control::{LOGIN_OKAY, NO_FREE_ADDRESS};
use lanlink_proto::{
    Action, ControlMessage, Frame, NetworkDescriptor, Operator, PresenceMessage, ProtocolError,
};
use lanlink_transport::{Connection, Status};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const CONTROL_QUEUE: usize = 64;

/// Callbacks into the owner of a [`SocketWorker`]
pub trait SocketListener: Send + Sync {
    /// Login accepted
    fn on_success(&self) {}

    /// An established connection went away
    fn on_close(&self) {}

    /// The switch assigned or confirmed an address
    fn on_ip_addr(&self, _network: &NetworkDescriptor) {}
}

/// Handle to a running socket worker
pub struct SocketWorker {
    connection: Arc<Connection>,
    network: Arc<RwLock<NetworkDescriptor>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketWorker {
    /// Spawn the worker and start dialing.
    ///
    /// Frames on `uplink` are written to the switch; data frames from the
    /// switch go to `downlink`.
    pub fn start(
        config: Arc<PointConfig>,
        connection: Arc<Connection>,
        listener: Arc<dyn SocketListener>,
        uplink: mpsc::Receiver<Frame>,
        downlink: mpsc::Sender<Frame>,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (controls, controls_rx) = mpsc::channel(CONTROL_QUEUE);

        let status_events = events.clone();
        connection.on_status(Arc::new(move |from: Status, to: Status| match to {
            Status::Connected => {
                let _ = status_events.send(WorkerEvent::Connected);
            }
            Status::Closed if from.is_connected() => {
                let _ = status_events.send(WorkerEvent::Closed);
            }
            _ => {}
        }));

        let network = Arc::new(RwLock::new(NetworkDescriptor::new(
            config.network.clone(),
            &config.interface.address,
        )));
        let now = Instant::now();
        let worker = SocketLoop {
            backoff: ReconnectManager::new(config.reconnect.clone()),
            config,
            connection: connection.clone(),
            listener,
            network: network.clone(),
            downlink,
            events: events.clone(),
            controls,
            last_seen: Arc::new(Mutex::new(now)),
            record: Record::new(now),
            job: None,
            reader: None,
        };
        let task = tokio::spawn(worker.run(events_rx, controls_rx, uplink));

        Self {
            connection,
            network,
            events,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn status(&self) -> Status {
        self.connection.status()
    }

    /// Negotiated address in CIDR notation
    pub fn address(&self) -> Option<String> {
        self.network
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cidr()
    }

    /// Send the leave notice, terminate the connection and wait for the
    /// loop to finish
    pub async fn stop(&self) {
        let _ = self.events.send(WorkerEvent::Stop);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Timestamps and counters owned by the loop
struct Record {
    /// Connect attempts started; doubles as the reader generation
    attempt: u64,
    /// Attempt that last reached `Connected`
    connected: u64,
    live: Instant,
    reconnect: Option<Instant>,
    ip_requested: Option<Instant>,
    ip_answered: Option<Instant>,
    keepalive: Instant,
}

impl Record {
    fn new(now: Instant) -> Self {
        Self {
            attempt: 0,
            connected: 0,
            live: now,
            reconnect: None,
            ip_requested: None,
            ip_answered: None,
            keepalive: now,
        }
    }

    fn ip_outstanding(&self) -> bool {
        match (self.ip_requested, self.ip_answered) {
            (Some(requested), Some(answered)) => answered < requested,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// A deferred reconnect
#[derive(Debug, Clone, Copy)]
struct ReconnectJob {
    due: Instant,
    scheduled: Instant,
    /// Value of `Record::attempt` when scheduled
    attempt: u64,
}

struct SocketLoop {
    config: Arc<PointConfig>,
    connection: Arc<Connection>,
    listener: Arc<dyn SocketListener>,
    network: Arc<RwLock<NetworkDescriptor>>,
    downlink: mpsc::Sender<Frame>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    controls: mpsc::Sender<ControlMessage>,
    /// Last frame of any kind, stamped by the reader
    last_seen: Arc<Mutex<Instant>>,
    record: Record,
    backoff: ReconnectManager,
    job: Option<ReconnectJob>,
    reader: Option<JoinHandle<()>>,
}

impl SocketLoop {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        mut controls: mpsc::Receiver<ControlMessage>,
        mut uplink: mpsc::Receiver<Frame>,
    ) {
        info!(
            connection = %self.config.connection,
            user = %self.config.id(),
            "Starting socket worker"
        );
        self.connect().await;

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let due = self.job.map(|job| job.due);
            tokio::select! {
                event = events.recv() => match event {
                    Some(WorkerEvent::Stop) | None => {
                        self.leave().await;
                        break;
                    }
                    Some(event) => self.handle_event(event).await,
                },
                Some(message) = controls.recv() => self.handle_control(message).await,
                frame = uplink.recv() => match frame {
                    Some(frame) => self.forward(frame).await,
                    None => {
                        self.leave().await;
                        break;
                    }
                },
                _ = ticker.tick() => self.keepalive().await,
                _ = tokio::time::sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => {
                    self.run_job().await;
                }
            }
        }
        debug!("Socket worker stopped");
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Connected => {
                self.record.connected = self.record.attempt;
                self.touch();
                self.spawn_reader();
                self.send_login().await;
            }
            WorkerEvent::Closed => {
                self.record.ip_answered = None;
                self.listener.on_close();
            }
            WorkerEvent::LoginSuccess => {
                self.send_ping().await;
                self.request_address().await;
            }
            WorkerEvent::SignIn => self.send_login().await,
            WorkerEvent::Reconnect(reason) => self.schedule_reconnect(&reason),
            WorkerEvent::ReadError { generation, reason } => {
                if generation != self.record.attempt {
                    debug!(generation, "Ignoring error of a previous connection");
                    return;
                }
                warn!(
                    connection = %self.connection.remote_address(),
                    "Read failed: {}", reason
                );
                self.connection.close().await;
                self.schedule_reconnect(&reason);
            }
            other => debug!(event = ?other, "Ignoring event"),
        }
    }

    async fn handle_control(&mut self, message: ControlMessage) {
        debug!(action = %message.action, request = message.is_request(), "Control message");
        match (message.action, message.operator) {
            (Action::Login, Operator::Response) => self.on_login(&message),
            (Action::IpAddr, Operator::Response) => self.on_ip_addr(&message),
            (Action::Pong, _) => self.record.live = Instant::now(),
            (Action::SignIn, Operator::Request) => {
                info!(connection = %self.connection.remote_address(), "Switch asked to sign in again");
                let _ = self.events.send(WorkerEvent::SignIn);
            }
            (Action::Leave, Operator::Request) => {
                info!(connection = %self.connection.remote_address(), "Switch closed the session");
                self.connection.close().await;
            }
            (action, operator) => {
                debug!(%action, ?operator, "Unhandled control message");
            }
        }
    }

    fn on_login(&mut self, message: &ControlMessage) {
        let body = message.body_str().unwrap_or_default().trim();
        if body.starts_with(LOGIN_OKAY) {
            if let Err(e) = self.connection.set_status(Status::Authenticated) {
                warn!("Cannot mark connection authenticated: {}", e);
                return;
            }
            info!(user = %self.config.id(), connection = %self.connection.remote_address(), "Login success");
            self.backoff.reset();
            self.listener.on_success();
            let _ = self.events.send(WorkerEvent::LoginSuccess);
        } else {
            let _ = self.connection.set_status(Status::UnAuthenticated);
            error!(user = %self.config.id(), "Login rejected: {}", body);
        }
    }

    /// Only an applied address settles the request; a refusal or a bad body
    /// leaves it outstanding so the keepalive asks again
    fn on_ip_addr(&mut self, message: &ControlMessage) {
        if !self.config.request_addr {
            self.record.ip_answered = Some(Instant::now());
            debug!("Static address confirmed");
            return;
        }

        let body = message.body_str().unwrap_or_default();
        if body.trim() == NO_FREE_ADDRESS {
            warn!(network = %self.config.network, "Switch has no free address");
            return;
        }
        let network: NetworkDescriptor = match message.parse_json() {
            Ok(network) => network,
            Err(e) => {
                warn!("Invalid address response: {}", e);
                return;
            }
        };
        if network.address().is_none() {
            warn!(network = %network.name, "Address response without an address");
            return;
        }

        info!(address = ?network.cidr(), network = %network.name, "Address assigned");
        *self.network.write().unwrap_or_else(PoisonError::into_inner) = network.clone();
        self.listener.on_ip_addr(&network);
        self.record.ip_answered = Some(Instant::now());
    }

    async fn forward(&mut self, frame: Frame) {
        if let Err(e) = self.connection.write_message(frame).await {
            if self.connection.status().is_connected() {
                let _ = self.events.send(WorkerEvent::Reconnect(format!("write failed: {}", e)));
            } else {
                debug!("Frame dropped while disconnected: {}", e);
            }
        }
    }

    async fn keepalive(&mut self) {
        let now = Instant::now();
        self.dead_check(now);
        if now.duration_since(self.record.keepalive) < self.config.keepalive {
            return;
        }
        self.record.keepalive = now;

        match self.connection.status() {
            Status::Authenticated => {
                self.send_ping().await;
                if self.record.ip_outstanding() {
                    self.request_address().await;
                }
            }
            Status::Connected | Status::UnAuthenticated => self.send_login().await,
            _ => {}
        }
    }

    /// Emit a reconnect when nothing arrived within the timeout and no
    /// reconnect was triggered within the same window
    fn dead_check(&mut self, now: Instant) {
        if self.connection.is_terminal() {
            return;
        }
        let timeout = self.config.timeout;
        let last_seen = *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        let last = last_seen.max(self.record.live);
        if now.duration_since(last) < timeout {
            return;
        }
        if let Some(triggered) = self.record.reconnect {
            if now.duration_since(triggered) < timeout {
                return;
            }
        }
        self.record.reconnect = Some(now);
        let _ = self.events.send(WorkerEvent::Reconnect(format!(
            "nothing received for {}s",
            now.duration_since(last).as_secs()
        )));
    }

    fn schedule_reconnect(&mut self, reason: &str) {
        if self.connection.is_terminal() {
            return;
        }
        if let Some(job) = &self.job {
            debug!(reason, "Reconnect already scheduled for attempt {}", job.attempt);
            return;
        }
        let now = Instant::now();
        let delay = self.backoff.next_delay();
        info!(
            connection = %self.config.connection,
            reason,
            "Reconnecting in {}s", delay.as_secs()
        );
        self.job = Some(ReconnectJob {
            due: now + delay,
            scheduled: now,
            attempt: self.record.attempt,
        });
    }

    async fn run_job(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        if self.connection.is_terminal() {
            return;
        }
        if self.record.connected > job.attempt {
            debug!("A newer connection succeeded, skipping reconnect");
            return;
        }
        let last_seen = *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        if self.connection.status().is_connected() && last_seen > job.scheduled {
            debug!("Traffic resumed, skipping reconnect");
            return;
        }
        self.connect().await;
    }

    async fn connect(&mut self) {
        self.record.attempt += 1;
        if let Err(e) = self.connection.connect().await {
            warn!(connection = %self.config.connection, "Connect failed: {}", e);
            self.schedule_reconnect(&e.to_string());
        }
    }

    async fn leave(&mut self) {
        if self.connection.status().is_connected() {
            let notice = ControlMessage::request_json(Action::Leave, &self.presence());
            if let Ok(notice) = notice {
                if let Err(e) = self.connection.write_message(notice.into_frame()).await {
                    debug!("Leave notice not sent: {}", e);
                }
            }
        }
        self.connection.terminate().await;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.job = None;
        info!(user = %self.config.id(), "Left the switch");
    }

    fn touch(&mut self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn presence(&self) -> PresenceMessage {
        let network = self.network.read().unwrap_or_else(PoisonError::into_inner);
        PresenceMessage::now(
            self.config.uuid.clone(),
            self.config.alias.clone(),
            network.if_addr.clone(),
            self.connection.local_address(),
        )
    }

    async fn send(&self, message: Result<ControlMessage, ProtocolError>) {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("Cannot encode control message: {}", e);
                return;
            }
        };
        let action = message.action;
        if let Err(e) = self.connection.write_message(message.into_frame()).await {
            warn!(%action, "Failed to send: {}", e);
        }
    }

    async fn send_login(&self) {
        debug!(user = %self.config.id(), "Sending login");
        let login = self.config.login_request();
        self.send(ControlMessage::request_json(Action::Login, &login))
            .await;
    }

    async fn send_ping(&self) {
        self.send(ControlMessage::request_json(Action::Ping, &self.presence()))
            .await;
    }

    async fn request_address(&mut self) {
        let network = self
            .network
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !self.config.request_addr && network.if_addr.is_empty() {
            return;
        }
        self.record.ip_requested = Some(Instant::now());
        debug!(network = %network.name, address = %network.if_addr, "Requesting address");
        self.send(ControlMessage::request_json(Action::IpAddr, &network))
            .await;
    }

    fn spawn_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        let generation = self.record.attempt;
        let connection = self.connection.clone();
        let last_seen = self.last_seen.clone();
        let controls = self.controls.clone();
        let downlink = self.downlink.clone();
        let events = self.events.clone();

        self.reader = Some(tokio::spawn(async move {
            loop {
                let frame = match connection.read_message().await {
                    Ok(frame) => frame,
                    Err(e) => {
                        if !connection.is_terminal() {
                            let _ = events.send(WorkerEvent::ReadError {
                                generation,
                                reason: e.to_string(),
                            });
                        }
                        return;
                    }
                };
                *last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();

                if !frame.is_control() {
                    if downlink.send(frame).await.is_err() {
                        return;
                    }
                    continue;
                }
                match frame.to_control() {
                    Ok(message) => {
                        if controls.send(message).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(connection = %connection.remote_address(), "Dropping control frame: {}", e),
                }
            }
        }));
    }
}
