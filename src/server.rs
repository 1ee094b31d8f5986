//! TCP listener and per-connection session handling.
//!
//! Each accepted socket becomes a session: a freshly generated chat id, a
//! routing record in the store, and four concurrent tasks (decode loop,
//! outbound writer, pinger, subscriber) sharing one cancellation token.
//! Read/write deadlines tear idle or stalled sessions down.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::{self, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::logger::Logger;
use crate::pinger;
use crate::protocol::{ChatMessage, Payload, PayloadCodec, ProtocolError};
use crate::store::Store;

/// Capacity of the router-to-client delivery channel.
const STREAMING_CAPACITY: usize = 20;

/// Sender name stamped on server-originated messages.
const SERVER_SENDER: &str = "server";

type SharedWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, PayloadCodec>>>;

/// One accepted connection and its assigned chat id.
struct Client {
    chat_id: String,
    stream: TcpStream,
}

/// Shared read/write cutoffs for one session.
///
/// Both sides start one window out. Decoded inbound frames extend the
/// write side; successful outbound writes extend the read side. Expiry
/// surfaces as a timed-out I/O error on the blocked direction.
#[derive(Clone)]
pub struct Deadlines {
    inner: Arc<DeadlineState>,
}

struct DeadlineState {
    window: Duration,
    read: std::sync::Mutex<Instant>,
    write: std::sync::Mutex<Instant>,
}

impl Deadlines {
    pub fn new(window: Duration) -> Deadlines {
        let cutoff = Instant::now() + window;

        Deadlines {
            inner: Arc::new(DeadlineState {
                window,
                read: std::sync::Mutex::new(cutoff),
                write: std::sync::Mutex::new(cutoff),
            }),
        }
    }

    pub fn read_deadline(&self) -> Instant {
        *self.inner.read.lock().unwrap()
    }

    pub fn write_deadline(&self) -> Instant {
        *self.inner.write.lock().unwrap()
    }

    pub fn extend_read(&self) {
        *self.inner.read.lock().unwrap() = Instant::now() + self.inner.window;
    }

    pub fn extend_write(&self) {
        *self.inner.write.lock().unwrap() = Instant::now() + self.inner.window;
    }

    pub fn extend_both(&self) {
        self.extend_read();
        self.extend_write();
    }
}

/// Server instance
pub struct Server {
    config: Config,
    store: Store,
    logger: Arc<Logger>,
    ping_logger: Arc<Logger>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(
        config: Config,
        store: Store,
        logger: Arc<Logger>,
        ping_logger: Arc<Logger>,
    ) -> Server {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            store,
            logger,
            ping_logger,
            connection_limit,
        }
    }

    /// Start the server and begin accepting connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let address = self.config.listen_address();
        let listener = TcpListener::bind(&address).await?;
        info!(address = %address, "Server listening");
        self.logger.info(&format!("Listening on {address}"));

        loop {
            // Wait for a session slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    let client = Client {
                        chat_id: Uuid::new_v4().to_string(),
                        stream,
                    };
                    debug!(peer = %addr, chat_id = %client.chat_id, "New connection");
                    self.logger
                        .info(&format!("Accepted connection from {addr}"));

                    let store = self.store.clone();
                    let logger = Arc::clone(&self.logger);
                    let ping_logger = Arc::clone(&self.ping_logger);
                    let window = self.config.ping_interval();

                    tokio::spawn(async move {
                        handle_connection(client, store, logger, ping_logger, window).await;
                        drop(permit);
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    error!(error = %e, "Failed to accept connection");
                    self.logger.error(&format!("accept failed: {e}"));
                }
                Err(e) => {
                    // The listener itself is gone; nothing left to serve.
                    error!(error = %e, "Listener failed");
                    self.logger.error(&format!("listener failed: {e}"));
                    return Err(e.into());
                }
            }
        }
    }
}

/// Whether an accept error concerns only the one incoming connection.
///
/// A peer that resets or aborts mid-handshake costs us nothing; any other
/// failure means the listener itself died and the server must exit.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Everything one live session shares between its tasks.
struct Session {
    chat_id: String,
    store: Store,
    logger: Arc<Logger>,
    writer: SharedWriter,
    deadlines: Deadlines,
    cancel: CancellationToken,
    reset: mpsc::Sender<Duration>,
}

impl Session {
    /// Write one frame to the client, bounded by the write deadline. A
    /// successful write keeps the read side alive for another window.
    async fn write(&self, payload: Payload) -> Result<(), ProtocolError> {
        let outcome = time::timeout_at(self.deadlines.write_deadline(), async {
            self.writer.lock().await.send(payload).await
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.deadlines.extend_read();
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline elapsed",
            ))),
        }
    }

    /// Run the decode loop until the peer goes away, a frame fails to
    /// decode, a reply fails to send, or the session is cancelled.
    async fn decode_loop<R>(&self, frames: &mut FramedRead<R, PayloadCodec>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = read_frame(frames, &self.deadlines) => frame,
            };

            match frame {
                Ok(Some(payload)) => {
                    debug!(chat_id = %self.chat_id, payload = %payload, "Decoded frame");

                    // Real traffic defers the next heartbeat and buys the
                    // peer another write window.
                    let _ = self.reset.try_send(Duration::ZERO);
                    self.deadlines.extend_write();

                    if let Err(e) = self.dispatch(payload).await {
                        self.logger
                            .error(&format!("reply to chat {} failed: {e}", self.chat_id));
                        return;
                    }
                }
                Ok(None) => {
                    self.logger
                        .info(&format!("chat {} disconnected", self.chat_id));
                    return;
                }
                Err(e) => {
                    self.logger
                        .error(&format!("decode failed for chat {}: {e}", self.chat_id));
                    return;
                }
            }
        }
    }

    /// Act on one decoded frame.
    async fn dispatch(&self, payload: Payload) -> Result<(), ProtocolError> {
        match payload {
            Payload::HeartBeat => Ok(()),
            // Peers have no business sending errors; drop them.
            Payload::Error(_) => Ok(()),
            Payload::Message(mut message) => {
                // Stamp the real sender; clients cannot speak for others.
                message.from = self.chat_id.clone();

                if !self.store.exists(&message.to).await {
                    self.logger.warning(&format!(
                        "chat {} addressed missing chat {}",
                        self.chat_id, message.to
                    ));
                    return self
                        .write(Payload::Error("chat does not exist".to_string()))
                        .await;
                }

                let json = serde_json::to_string(&message)?;
                if let Err(e) = self.store.publish(&message.to, &json).await {
                    self.logger
                        .error(&format!("publish to chat {} failed: {e}", message.to));
                }
                Ok(())
            }
        }
    }
}

/// Read one frame, honoring the read deadline.
///
/// A deadline extended by a concurrent delivery re-arms an in-flight wait
/// instead of failing it.
async fn read_frame<R>(
    frames: &mut FramedRead<R, PayloadCodec>,
    deadlines: &Deadlines,
) -> Result<Option<Payload>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let deadline = deadlines.read_deadline();
        match time::timeout_at(deadline, frames.next()).await {
            Ok(Some(result)) => return result.map(Some),
            Ok(None) => return Ok(None),
            Err(_) if deadlines.read_deadline() > Instant::now() => continue,
            Err(_) => {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read deadline elapsed",
                )))
            }
        }
    }
}

/// Manage the lifecycle of one client connection: register the chat id,
/// start the pinger, subscriber and outbound writer, then decode inbound
/// frames until the session dies. Teardown runs unconditionally.
async fn handle_connection(
    client: Client,
    store: Store,
    logger: Arc<Logger>,
    ping_logger: Arc<Logger>,
    window: Duration,
) {
    let Client { chat_id, stream } = client;
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, PayloadCodec::new());
    let writer = Arc::new(Mutex::new(FramedWrite::new(write_half, PayloadCodec::new())));

    let (streaming_tx, mut streaming_rx) = mpsc::channel(STREAMING_CAPACITY);
    let (sub_tx, sub_rx) = mpsc::channel(1);
    let (reset_tx, reset_rx) = mpsc::channel(1);

    // The session consumes its own stream; queue the subscription before
    // the subscriber starts.
    let _ = sub_tx.send(chat_id.clone()).await;

    let session = Arc::new(Session {
        chat_id,
        store,
        logger,
        writer,
        deadlines: Deadlines::new(window),
        cancel: CancellationToken::new(),
        reset: reset_tx,
    });

    match session.store.register(&session.chat_id).await {
        Ok(()) => {
            session
                .logger
                .info(&format!("Registered chat {}", session.chat_id));

            tokio::spawn(pinger::run(
                session.cancel.clone(),
                Arc::clone(&session.writer),
                session.deadlines.clone(),
                window,
                reset_rx,
                ping_logger,
            ));

            {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    session
                        .store
                        .subscribe(
                            session.cancel.clone(),
                            streaming_tx,
                            sub_rx,
                            session.chat_id.clone(),
                        )
                        .await;
                    // A dead subscriber means no more deliveries; end the
                    // session.
                    session.cancel.cancel();
                });
            }

            {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    while let Some(payload) = streaming_rx.recv().await {
                        if let Err(e) = session.write(payload).await {
                            session.logger.error(&format!(
                                "delivery to chat {} failed: {e}",
                                session.chat_id
                            ));
                            session.cancel.cancel();
                            return;
                        }
                    }
                });
            }

            // Registration may have eaten into the window; the session
            // proper starts now.
            session.deadlines.extend_both();

            // Tell the client its own address.
            let hello = ChatMessage {
                message: session.chat_id.clone(),
                from: SERVER_SENDER.to_string(),
                to: session.chat_id.clone(),
            };
            match session.write(Payload::Message(hello)).await {
                Ok(()) => session.decode_loop(&mut frames).await,
                Err(e) => session
                    .logger
                    .error(&format!("hello to chat {} failed: {e}", session.chat_id)),
            }
        }
        Err(e) => session
            .logger
            .error(&format!("failed to register chat {}: {e}", session.chat_id)),
    }

    // Teardown: stop the tasks, close the subscription, drop the routing
    // record. Every step runs even if an earlier one failed.
    session.cancel.cancel();
    drop(sub_tx);
    if let Err(e) = session.store.delete(&session.chat_id).await {
        session
            .logger
            .error(&format!("failed to delete chat {}: {e}", session.chat_id));
    }
    session
        .logger
        .info(&format!("Session {} closed", session.chat_id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::Framed;

    const TEST_BACKEND: &str = "redis://127.0.0.1:6379/0";

    fn test_logger(name: &str) -> Arc<Logger> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(Logger::open(dir.path().join(name)).unwrap())
    }

    fn test_config(port: u16, ping_interval_secs: u64) -> Config {
        Config {
            address: "127.0.0.1".to_string(),
            port,
            max_connections: 16,
            backend_url: TEST_BACKEND.to_string(),
            ping_interval_secs,
            log_level: "info".to_string(),
            log_dir: std::env::temp_dir(),
        }
    }

    async fn start_server(port: u16, ping_interval_secs: u64) {
        let store = Store::connect(TEST_BACKEND, test_logger("database.log"))
            .await
            .unwrap();
        let server = Server::new(
            test_config(port, ping_interval_secs),
            store,
            test_logger("server.log"),
            test_logger("pinger.log"),
        );

        tokio::spawn(async move {
            let _ = server.run().await;
        });
        time::sleep(Duration::from_millis(200)).await;
    }

    async fn connect(port: u16) -> Framed<TcpStream, PayloadCodec> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Framed::new(stream, PayloadCodec::new())
    }

    /// Read frames until a message arrives, skipping heartbeats.
    async fn next_message(frames: &mut Framed<TcpStream, PayloadCodec>) -> ChatMessage {
        loop {
            match frames.next().await.unwrap().unwrap() {
                Payload::Message(message) => return message,
                Payload::HeartBeat => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    /// The hello frame carries the session's chat id in both `to` and the
    /// body.
    async fn read_hello(frames: &mut Framed<TcpStream, PayloadCodec>) -> String {
        let hello = next_message(frames).await;
        assert_eq!(hello.from, SERVER_SENDER);
        assert_eq!(hello.message, hello.to);
        hello.message
    }

    #[test]
    fn test_accept_error_classification() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert!(is_transient_accept_error(&io::Error::from(kind)));
        }

        // A dead listener is fatal.
        for kind in [
            io::ErrorKind::InvalidInput,
            io::ErrorKind::NotConnected,
            io::ErrorKind::Other,
        ] {
            assert!(!is_transient_accept_error(&io::Error::from(kind)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlines_window() {
        let deadlines = Deadlines::new(Duration::from_secs(30));
        let start_time = Instant::now();

        assert_eq!(deadlines.read_deadline(), start_time + Duration::from_secs(30));
        assert_eq!(deadlines.write_deadline(), start_time + Duration::from_secs(30));

        time::advance(Duration::from_secs(10)).await;
        deadlines.extend_read();

        assert_eq!(
            deadlines.read_deadline(),
            Instant::now() + Duration::from_secs(30)
        );
        // The write side is untouched.
        assert_eq!(deadlines.write_deadline(), start_time + Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_frame_times_out() {
        let (near, _far) = tokio::io::duplex(64);
        let mut frames = FramedRead::new(near, PayloadCodec::new());
        let deadlines = Deadlines::new(Duration::from_secs(5));

        let start_time = Instant::now();
        let result = read_frame(&mut frames, &deadlines).await;

        assert!(matches!(result, Err(ProtocolError::Io(_))));
        assert_eq!(start_time.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_frame_honors_extension() {
        let (near, _far) = tokio::io::duplex(64);
        let deadlines = Deadlines::new(Duration::from_secs(5));

        let start_time = Instant::now();
        let waiter = {
            let deadlines = deadlines.clone();
            tokio::spawn(async move {
                let mut frames = FramedRead::new(near, PayloadCodec::new());
                read_frame(&mut frames, &deadlines).await
            })
        };

        time::sleep(Duration::from_secs(3)).await;
        deadlines.extend_read();

        let result = waiter.await.unwrap();
        assert!(result.is_err());
        // The extension moved expiry to three seconds plus a full window.
        assert_eq!(start_time.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_relay_happy_path() {
        start_server(18091, 30).await;

        let mut alice = connect(18091).await;
        let alice_id = read_hello(&mut alice).await;

        let mut bob = connect(18091).await;
        let bob_id = read_hello(&mut bob).await;

        alice
            .send(Payload::Message(ChatMessage {
                message: "hi".to_string(),
                from: String::new(),
                to: bob_id.clone(),
            }))
            .await
            .unwrap();

        let delivered = time::timeout(Duration::from_secs(5), next_message(&mut bob))
            .await
            .unwrap();
        assert_eq!(delivered.message, "hi");
        // The relay stamps the real sender.
        assert_eq!(delivered.from, alice_id);
        assert_eq!(delivered.to, bob_id);

        // No error frame comes back to the sender.
        let nothing = time::timeout(Duration::from_secs(1), alice.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_unknown_recipient_gets_error_frame() {
        start_server(18092, 30).await;

        let mut alice = connect(18092).await;
        read_hello(&mut alice).await;

        alice
            .send(Payload::Message(ChatMessage {
                message: "hi".to_string(),
                from: String::new(),
                to: "nonexistent".to_string(),
            }))
            .await
            .unwrap();

        let reply = time::timeout(Duration::from_secs(5), alice.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Payload::Error("chat does not exist".to_string()));
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_idle_session_times_out() {
        start_server(18093, 2).await;

        let mut client = connect(18093).await;
        read_hello(&mut client).await;

        // Send nothing; the server closes the socket once the window
        // passes.
        let outcome = time::timeout(Duration::from_secs(10), async {
            loop {
                match client.next().await {
                    Some(Ok(Payload::HeartBeat)) => continue,
                    other => return other,
                }
            }
        })
        .await
        .expect("server should have closed the connection");

        match outcome {
            None | Some(Err(_)) => {}
            Some(Ok(frame)) => panic!("unexpected frame: {:?}", frame),
        }
    }
}
