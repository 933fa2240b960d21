use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{lookup_host, tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpStream},
    runtime,
    sync::{mpsc, Notify},
};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    config::NodeConfig,
    error::ConnectionError,
    frame::{encode_frame, FrameDecoder, ReadPhase},
    uri::Uri,
};

const READ_CHUNK: usize = 16 * 1024;

/// Process-local name of one connection. Handles are handed out from a
/// monotonic counter, so a handle is never reused for a different peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Handle(u64);

impl Handle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// We dialled the peer.
    Outgoing,
    /// The peer dialled one of our listeners.
    Incoming,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Resolving,
    Connecting,
    ReadingHeader,
    ReadingBody,
    Closed,
}

impl From<ReadPhase> for ConnectionState {
    fn from(phase: ReadPhase) -> Self {
        match phase {
            ReadPhase::Header => ConnectionState::ReadingHeader,
            ReadPhase::Body { .. } => ConnectionState::ReadingBody,
        }
    }
}

/// What a connection reports to its owner. Connections never call back into
/// the node directly; they only carry their handle, and the owner resolves it
/// again through the registry.
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected {
        handle: Handle,
    },
    ConnectFailed {
        handle: Handle,
        error: ConnectionError,
    },
    Message {
        handle: Handle,
        payload: Vec<u8>,
    },
    /// The connection is gone. `error` is `None` after an explicit close.
    Left {
        handle: Handle,
        error: Option<ConnectionError>,
    },
}

impl ConnectionEvent {
    pub fn handle(&self) -> Handle {
        match self {
            ConnectionEvent::Connected { handle }
            | ConnectionEvent::ConnectFailed { handle, .. }
            | ConnectionEvent::Message { handle, .. }
            | ConnectionEvent::Left { handle, .. } => *handle,
        }
    }
}

/// The parts of the node configuration a connection cares about.
#[derive(Clone, Copy, Debug)]
pub struct FrameSettings {
    pub magic: u64,
    pub max_frame_len: u64,
    pub connect_timeout: Duration,
}

impl From<&NodeConfig> for FrameSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            magic: config.network_magic,
            max_frame_len: config.max_frame_len,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// One TCP byte stream carrying length-framed messages.
///
/// Reads run in a dedicated task that loops header -> body -> deliver.
/// Writes go through a FIFO queue drained by at most one task at a time; the
/// `writing` flag is the single-writer token.
pub struct Connection {
    handle: Handle,
    direction: Direction,
    settings: FrameSettings,
    state: Mutex<ConnectionState>,
    remote: Mutex<Option<SocketAddr>>,
    queue: Mutex<VecDeque<Vec<u8>>>,
    writing: AtomicBool,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    shutdown: Notify,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    runtime: runtime::Handle,
}

impl Connection {
    /// Must be called from within a tokio runtime; the connection spawns its
    /// tasks onto that runtime.
    pub fn new(
        handle: Handle,
        direction: Direction,
        settings: FrameSettings,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let state = match direction {
            Direction::Outgoing => ConnectionState::Resolving,
            Direction::Incoming => ConnectionState::Connecting,
        };
        Arc::new(Self {
            handle,
            direction,
            settings,
            state: Mutex::new(state),
            remote: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            writing: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            events,
            runtime: runtime::Handle::current(),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    /// True while the socket is established and being read.
    pub fn is_alive(&self) -> bool {
        !self.is_closed()
            && matches!(
                self.state(),
                ConnectionState::ReadingHeader | ConnectionState::ReadingBody
            )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of messages waiting for the writer.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Starts dialling `locator` in the background. The outcome arrives as a
    /// `Connected` or `ConnectFailed` event.
    pub fn connect(self: &Arc<Self>, locator: Uri) {
        let this = self.clone();
        let span = debug_span!("connection", handle = %self.handle, peer = %locator);
        self.runtime.spawn(
            async move {
                match this.dial(&locator).await {
                    Ok(stream) => this.attach(stream).await,
                    Err(error) => this.fail_connect(error),
                }
            }
            .instrument(span),
        );
    }

    /// Takes over a socket produced by a listener.
    pub fn accept(self: &Arc<Self>, stream: TcpStream) {
        let this = self.clone();
        let span = debug_span!(
            "connection",
            handle = %self.handle,
            peer = ?stream.peer_addr().ok()
        );
        self.runtime
            .spawn(async move { this.attach(stream).await }.instrument(span));
    }

    /// Queues a message and returns immediately. Messages queued before the
    /// socket is established are flushed once it is.
    pub fn send(self: &Arc<Self>, payload: Vec<u8>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.queue.lock().push_back(payload);
        self.kick_writer();
        Ok(())
    }

    /// Closes the connection. Calling this more than once is harmless.
    pub fn close(self: &Arc<Self>) {
        self.leave(None);
    }

    async fn dial(&self, locator: &Uri) -> Result<TcpStream, ConnectionError> {
        self.set_state(ConnectionState::Resolving);
        let candidates: Vec<SocketAddr> = lookup_host(locator.authority())
            .await
            .map_err(|source| ConnectionError::Resolve {
                locator: locator.clone(),
                source,
            })?
            .collect();
        if candidates.is_empty() {
            return Err(ConnectionError::NoAddresses {
                locator: locator.clone(),
            });
        }

        self.set_state(ConnectionState::Connecting);
        debug!(?candidates, "resolved, connecting");
        match tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&candidates[..]),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectionError::Connect {
                locator: locator.clone(),
                source,
            }),
            Err(_) => Err(ConnectionError::ConnectTimeout {
                locator: locator.clone(),
            }),
        }
    }

    async fn attach(self: Arc<Self>, stream: TcpStream) {
        if self.is_closed() {
            debug!("closed before the socket was established");
            return;
        }
        if let Err(error) = stream.set_nodelay(true) {
            trace!(%error, "could not disable nagle");
        }
        *self.remote.lock() = stream.peer_addr().ok();

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.set_state(ConnectionState::ReadingHeader);
        debug!(remote = ?self.remote_addr(), "connection established");

        let _ = self.events.send(ConnectionEvent::Connected {
            handle: self.handle,
        });

        let this = self.clone();
        self.runtime
            .spawn(this.read_loop(reader).in_current_span());
        self.kick_writer();
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut decoder = FrameDecoder::new(self.settings.magic, self.settings.max_frame_len);
        let mut chunk = vec![0u8; READ_CHUNK];

        let error = loop {
            let read = tokio::select! {
                _ = self.shutdown.notified() => return,
                read = reader.read(&mut chunk) => read,
            };
            match read {
                Ok(0) => break ConnectionError::Eof,
                Ok(n) => {
                    decoder.push(&chunk[..n]);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(payload)) => {
                                trace!(len = payload.len(), "received frame");
                                let _ = self.events.send(ConnectionEvent::Message {
                                    handle: self.handle,
                                    payload,
                                });
                            }
                            Ok(None) => break,
                            Err(error) => {
                                warn!(%error, "framing error, closing connection");
                                self.leave(Some(error.into()));
                                return;
                            }
                        }
                    }
                    if !self.is_closed() {
                        self.set_state(decoder.phase().into());
                    }
                }
                Err(error) => break ConnectionError::Io(error),
            }
        };

        self.leave(Some(error));
    }

    /// Hands the single-writer token to a new drain task, unless some task
    /// already holds it or the socket is not up yet.
    fn kick_writer(self: &Arc<Self>) {
        if !self.is_alive() {
            return;
        }
        if self
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = self.clone();
        self.runtime.spawn(this.drain_queue().in_current_span());
    }

    async fn drain_queue(self: Arc<Self>) {
        loop {
            let next = self.queue.lock().pop_front();
            let payload = match next {
                Some(payload) => payload,
                None => {
                    self.writing.store(false, Ordering::Release);
                    // a sender may have queued after our pop but seen the
                    // token still held, so look once more before leaving
                    let more = !self.queue.lock().is_empty();
                    if more
                        && self
                            .writing
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        continue;
                    }
                    return;
                }
            };

            let frame = encode_frame(self.settings.magic, &payload);
            let result = match self.writer.lock().await.as_mut() {
                Some(writer) => writer.write_all(&frame).await,
                None => Err(std::io::ErrorKind::NotConnected.into()),
            };
            if let Err(error) = result {
                self.writing.store(false, Ordering::Release);
                if !self.is_closed() {
                    warn!(%error, "write failed, closing connection");
                }
                self.leave(Some(error.into()));
                return;
            }
            trace!(len = payload.len(), "wrote frame");
        }
    }

    fn fail_connect(&self, error: ConnectionError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnectionState::Closed);
        warn!(%error, "connection attempt failed");
        let _ = self.events.send(ConnectionEvent::ConnectFailed {
            handle: self.handle,
            error,
        });
    }

    /// Single exit path for every way a connection can end: the first caller
    /// wins, later ones are ignored.
    fn leave(self: &Arc<Self>, error: Option<ConnectionError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnectionState::Closed);
        self.shutdown.notify_one();
        self.queue.lock().clear();

        match &error {
            Some(error) => info!(handle = %self.handle, %error, "connection left"),
            None => debug!(handle = %self.handle, "connection closed"),
        }

        let this = self.clone();
        self.runtime.spawn(async move {
            if let Some(mut writer) = this.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
        });

        let _ = self.events.send(ConnectionEvent::Left {
            handle: self.handle,
            error,
        });
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("remote", &self.remote_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::frame::FrameHeader;
    use tokio::net::TcpListener;

    const MAGIC: u64 = 0x5eed;

    fn settings() -> FrameSettings {
        FrameSettings {
            magic: MAGIC,
            max_frame_len: 1 << 20,
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a connection event")
            .expect("event channel closed")
    }

    async fn pair() -> (
        Arc<Connection>,
        mpsc::UnboundedReceiver<ConnectionEvent>,
        Arc<Connection>,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (dial_tx, mut dial_rx) = mpsc::unbounded_channel();
        let dialer = Connection::new(Handle::new(1), Direction::Outgoing, settings(), dial_tx);
        dialer.connect(Uri::tcp("127.0.0.1", port));

        let (stream, _) = listener.accept().await.unwrap();
        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
        let acceptor = Connection::new(Handle::new(2), Direction::Incoming, settings(), accept_tx);
        acceptor.accept(stream);

        assert!(matches!(
            next_event(&mut dial_rx).await,
            ConnectionEvent::Connected { .. }
        ));
        assert!(matches!(
            next_event(&mut accept_rx).await,
            ConnectionEvent::Connected { .. }
        ));
        (dialer, dial_rx, acceptor, accept_rx)
    }

    #[tokio::test]
    async fn delivers_every_message_once_in_order() {
        let (dialer, _dial_rx, acceptor, mut accept_rx) = pair().await;
        assert!(dialer.is_alive());
        assert!(acceptor.is_alive());

        for i in 0..200u32 {
            dialer.send(i.to_le_bytes().to_vec()).unwrap();
        }

        for i in 0..200u32 {
            match next_event(&mut accept_rx).await {
                ConnectionEvent::Message { payload, .. } => {
                    assert_eq!(payload, i.to_le_bytes().to_vec())
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn messages_queued_before_connect_are_flushed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, _rx) = mpsc::unbounded_channel();
        let dialer = Connection::new(Handle::new(1), Direction::Outgoing, settings(), tx);
        dialer.send(b"early".to_vec()).unwrap();
        assert_eq!(dialer.queued(), 1);
        dialer.connect(Uri::tcp("127.0.0.1", port));

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; encode_frame(MAGIC, b"early").len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, encode_frame(MAGIC, b"early"));
    }

    #[tokio::test]
    async fn bad_magic_closes_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(Handle::new(9), Direction::Incoming, settings(), tx);
        conn.accept(stream);
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Connected { .. }
        ));

        raw.write_all(&FrameHeader::new(0xbad, 4).encode())
            .await
            .unwrap();

        match next_event(&mut rx).await {
            ConnectionEvent::Left {
                error: Some(ConnectionError::Framing(_)),
                ..
            } => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.send(b"late".to_vec()),
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn dial_failure_is_reported_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(Handle::new(3), Direction::Outgoing, settings(), tx);
        conn.connect(Uri::tcp("127.0.0.1", port));

        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::ConnectFailed { .. }
        ));
        conn.close();
        assert!(conn.is_closed());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reaches_the_peer() {
        let (dialer, mut dial_rx, _acceptor, mut accept_rx) = pair().await;
        dialer.close();
        dialer.close();

        assert!(matches!(
            next_event(&mut dial_rx).await,
            ConnectionEvent::Left { error: None, .. }
        ));
        assert!(matches!(
            next_event(&mut accept_rx).await,
            ConnectionEvent::Left { error: Some(_), .. }
        ));
        assert!(dial_rx.try_recv().is_err());
    }
}
