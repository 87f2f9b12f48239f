//! Connection: one duplex session plus its lifecycle state machine

use crate::link::{Connector, FrameSink, FrameSource, Link};
use crate::status::Status;
use crate::{TransportError, TransportResult};
use chrono::{DateTime, Utc};
use lanlink_proto::Frame;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Invoked with `(from, to)` after every status change
pub type StatusListener = Arc<dyn Fn(Status, Status) + Send + Sync>;

type Private = Arc<dyn Any + Send + Sync>;

/// Snapshot of a connection's counters
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub errors: u64,
    pub dropped: u64,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

struct State {
    status: Status,
    local_addr: String,
    remote_addr: String,
    max_size: usize,
    min_size: usize,
    connected_at: Option<DateTime<Utc>>,
    private: Option<Private>,
    cancel: CancellationToken,
}

/// A framed duplex session.
///
/// Client connections redial through their [`Connector`]; accepted
/// connections wrap a link handed over by an acceptor. Reads and writes are
/// independent and may run on different tasks.
pub struct Connection {
    id: String,
    connector: Option<Arc<dyn Connector>>,
    timeout: Duration,
    state: Mutex<State>,
    source: tokio::sync::Mutex<Option<Box<dyn FrameSource>>>,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    counters: Counters,
    listener: Mutex<Option<StatusListener>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("remote_addr", &state.remote_addr)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Client-side connection that dials through `connector`
    pub fn client(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        let remote_addr = connector.address().to_string();
        Self::build(
            format!("{}-{}", connector.protocol(), uuid::Uuid::new_v4()),
            Some(connector),
            timeout,
            Status::Init,
            remote_addr,
        )
    }

    /// Server-side connection around an already accepted link
    pub fn accepted(link: Link, timeout: Duration) -> Self {
        let remote_addr = link.remote_addr.clone();
        let mut conn = Self::build(
            format!("peer-{}", uuid::Uuid::new_v4()),
            None,
            timeout,
            Status::Connected,
            remote_addr,
        );
        let (source, sink) = conn.record_link(link);
        *conn.source.get_mut() = Some(source);
        *conn.sink.get_mut() = Some(sink);
        conn
    }

    fn build(
        id: String,
        connector: Option<Arc<dyn Connector>>,
        timeout: Duration,
        status: Status,
        remote_addr: String,
    ) -> Self {
        Self {
            id,
            connector,
            timeout,
            state: Mutex::new(State {
                status,
                local_addr: String::new(),
                remote_addr,
                max_size: 0,
                min_size: 0,
                connected_at: None,
                private: None,
                cancel: CancellationToken::new(),
            }),
            source: tokio::sync::Mutex::new(None),
            sink: tokio::sync::Mutex::new(None),
            counters: Counters::default(),
            listener: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.state().status
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == Status::Authenticated
    }

    pub fn is_terminal(&self) -> bool {
        self.status() == Status::Terminal
    }

    pub fn remote_address(&self) -> String {
        self.state().remote_addr.clone()
    }

    pub fn local_address(&self) -> String {
        self.state().local_addr.clone()
    }

    pub fn max_size(&self) -> usize {
        self.state().max_size
    }

    pub fn min_size(&self) -> usize {
        self.state().min_size
    }

    /// Register the status-change callback, replacing any previous one
    pub fn on_status(&self, listener: StatusListener) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn notify(&self, from: Status, to: Status) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(from, to);
        }
    }

    /// Checked status change; a no-op when the status is unchanged
    pub fn set_status(&self, to: Status) -> TransportResult<()> {
        let from = {
            let mut state = self.state();
            let from = state.status;
            if from == to {
                return Ok(());
            }
            if !from.can_transition_to(to) {
                return Err(TransportError::InvalidTransition { from, to });
            }
            state.status = to;
            from
        };
        debug!(connection = %self.id, %from, %to, "Status changed");
        self.notify(from, to);
        Ok(())
    }

    /// Attach a payload owned by the layer above (e.g. the session record)
    pub fn set_private<T: Any + Send + Sync>(&self, value: Arc<T>) {
        self.state().private = Some(value);
    }

    pub fn private<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let private = self.state().private.clone()?;
        private.downcast::<T>().ok()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            connected_at: self.state().connected_at,
        }
    }

    /// Dial (or redial) the remote end.
    ///
    /// Any existing link is closed first. Emits `Connecting` then
    /// `Connected` on success, `Closed` on failure.
    pub async fn connect(&self) -> TransportResult<()> {
        let connector = self.connector.clone().ok_or_else(|| {
            TransportError::ConfigurationError("accepted connections cannot redial".to_string())
        })?;
        if self.is_terminal() {
            return Err(TransportError::Closed);
        }

        self.close().await;
        self.set_status(Status::Connecting)?;
        info!(connection = %self.id, remote = %connector.address(), "Connecting");

        let link = match self.deadline("connect", connector.connect()).await {
            Ok(link) => link,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                // a concurrent terminate wins
                let _ = self.set_status(Status::Closed);
                return Err(e);
            }
        };

        self.install(link).await;
        self.set_status(Status::Connected)
    }

    /// Record link metadata, returning the halves to be installed
    fn record_link(&self, link: Link) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let mut state = self.state();
        state.local_addr = link.local_addr;
        state.remote_addr = link.remote_addr;
        state.max_size = link.max_size;
        state.min_size = link.min_size;
        state.connected_at = Some(Utc::now());
        state.cancel = CancellationToken::new();
        (link.source, link.sink)
    }

    async fn install(&self, link: Link) {
        let (source, sink) = self.record_link(link);
        // a reader still parked on the previous link releases the lock once cancelled
        *self.source.lock().await = Some(source);
        *self.sink.lock().await = Some(sink);
    }

    async fn deadline<T, F>(&self, what: &str, fut: F) -> TransportResult<T>
    where
        F: Future<Output = TransportResult<T>>,
    {
        if self.timeout.is_zero() {
            return fut.await;
        }
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!(
                "{} exceeded {:?}",
                what, self.timeout
            ))),
        }
    }

    /// Receive the next frame.
    ///
    /// Returns `TransportError::Closed` as soon as the connection is closed
    /// from another task.
    pub async fn read_message(&self) -> TransportResult<Frame> {
        let cancel = self.state().cancel.clone();
        if cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut source = self.source.lock().await;
        let source = source.as_mut().ok_or(TransportError::NotConnected)?;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Closed),
            result = self.deadline("read", source.recv()) => result,
        };

        match &result {
            Ok(frame) => {
                self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_received
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            Err(TransportError::Closed) => {}
            Err(_) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Send one frame.
    ///
    /// Data frames are dropped silently until the connection is
    /// authenticated; control frames always go out.
    pub async fn write_message(&self, frame: Frame) -> TransportResult<()> {
        if !frame.is_control() && !self.is_authenticated() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(connection = %self.id, size = frame.len(), "Dropping data frame before authentication");
            return Ok(());
        }

        let size = frame.len() as u64;
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::NotConnected);
        };

        match self.deadline("write", sink.send(frame)).await {
            Ok(()) => {
                self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_sent.fetch_add(size, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Close the link and unblock any pending reader.
    ///
    /// Moves to `Closed` unless the connection is `Terminal`. The private
    /// payload is released.
    pub async fn close(&self) {
        let transition = {
            let mut state = self.state();
            state.cancel.cancel();
            state.private = None;
            let from = state.status;
            if from != Status::Terminal && from != Status::Closed && from != Status::Init {
                state.status = Status::Closed;
                Some(from)
            } else {
                None
            }
        };

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let closing = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
            if let Ok(Err(e)) = closing {
                warn!(connection = %self.id, "Error closing link: {}", e);
            }
        }
        if let Ok(mut source) = self.source.try_lock() {
            source.take();
        }

        if let Some(from) = transition {
            info!(connection = %self.id, remote = %self.remote_address(), "Connection closed");
            self.notify(from, Status::Closed);
        }
    }

    /// Enter `Terminal` and close; nothing reconnects afterwards
    pub async fn terminate(&self) {
        // Terminal is reachable from every state
        let _ = self.set_status(Status::Terminal);
        self.close().await;
    }
}
