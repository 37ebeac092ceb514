// ABOUTME: Live SSMI session over TCP: login handshake, inbound reader task and link-check task
// ABOUTME: Implements the session traits the bridge drives; readiness drops as soon as the link breaks

use super::connection::{FrameReader, FrameWriter};
use super::frame::{self, Command, Frame, Inbound};
use super::keepalive::{KeepAliveConfig, KeepAliveManager};
use crate::config::SsmiSettings;
use crate::message::SendCommand;
use crate::session::{InboundSink, ProtocolSession, SendError, SessionConnector, SessionError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type SharedWriter = Arc<Mutex<FrameWriter<OwnedWriteHalf>>>;

/// Connects to an SSMI gateway over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct SsmiConnector;

impl SessionConnector for SsmiConnector {
    type Session = SsmiSession;

    async fn connect(
        &self,
        settings: &SsmiSettings,
        sink: InboundSink,
    ) -> Result<SsmiSession, SessionError> {
        SsmiSession::connect(settings, sink).await
    }
}

#[derive(Debug)]
struct SessionState {
    ready: AtomicBool,
    keep_alive: std::sync::Mutex<KeepAliveManager>,
}

impl SessionState {
    fn new(config: KeepAliveConfig) -> Self {
        SessionState {
            ready: AtomicBool::new(true),
            keep_alive: std::sync::Mutex::new(KeepAliveManager::new(config)),
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn mark_down(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    fn keep_alive(&self) -> MutexGuard<'_, KeepAliveManager> {
        // The manager holds plain counters; a poisoned lock leaves them usable.
        self.keep_alive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A logged-in SSMI session.
///
/// The socket is split: a background task owns the read half and reports
/// every inbound message through the session's [`InboundSink`], while sends
/// and link checks share the write half.
#[derive(Debug)]
pub struct SsmiSession {
    writer: SharedWriter,
    state: Arc<SessionState>,
    reader_task: JoinHandle<()>,
    keep_alive_task: Option<JoinHandle<()>>,
}

impl SsmiSession {
    /// Connect, log in and start the background tasks.
    ///
    /// Inbound messages the gateway sends before acknowledging the login are
    /// passed to `sink` as well.
    pub async fn connect(
        settings: &SsmiSettings,
        sink: InboundSink,
    ) -> Result<SsmiSession, SessionError> {
        let socket = TcpStream::connect((settings.host.as_str(), settings.port))
            .await
            .map_err(|source| SessionError::Connect {
                host: settings.host.clone(),
                port: settings.port,
                source,
            })?;
        let (read_half, write_half) = socket.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let login = Frame::login(&settings.username, &settings.password)
            .map_err(|e| SessionError::Protocol(format!("cannot encode login: {e}")))?;
        writer.write_frame(&login).await?;
        debug!(username = %settings.username, "Sent SSMI login");

        match tokio::time::timeout(settings.login_timeout, await_login(&mut reader, &sink)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SessionError::Protocol(format!(
                    "no reply to login within {:?}",
                    settings.login_timeout
                )));
            }
        }
        info!(host = %settings.host, port = settings.port, "Logged in to SSMI gateway");

        let state = Arc::new(SessionState::new(settings.keep_alive.clone()));
        let writer = Arc::new(Mutex::new(writer));

        let reader_task = tokio::spawn(read_loop(reader, sink, state.clone()));
        let keep_alive_task = settings.keep_alive.enabled.then(|| {
            tokio::spawn(keep_alive_loop(
                writer.clone(),
                state.clone(),
                settings.keep_alive.clone(),
            ))
        });

        Ok(SsmiSession {
            writer,
            state,
            reader_task,
            keep_alive_task,
        })
    }
}

impl ProtocolSession for SsmiSession {
    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    async fn send(&mut self, command: &SendCommand) -> Result<(), SendError> {
        if !self.state.is_ready() {
            return Err(SendError::NotReady);
        }

        let frame = Frame::send(command).map_err(|e| SendError::Rejected(e.to_string()))?;

        let result = self.writer.lock().await.write_frame(&frame).await;
        if let Err(e) = result {
            self.state.mark_down();
            return Err(SendError::Io(e));
        }

        self.state.keep_alive().reset_failures();
        debug!(msisdn = %command.destination, "Sent to SSMI gateway");
        Ok(())
    }

    async fn close(&mut self) {
        self.state.mark_down();
        if let Some(task) = self.keep_alive_task.take() {
            task.abort();
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(error = %e, "SSMI socket already gone");
        }
        self.reader_task.abort();
    }
}

impl Drop for SsmiSession {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(task) = &self.keep_alive_task {
            task.abort();
        }
    }
}

async fn await_login(
    reader: &mut FrameReader<OwnedReadHalf>,
    sink: &InboundSink,
) -> Result<(), SessionError> {
    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(SessionError::Closed),
            Err(e) if is_malformed_line(&e) => {
                warn!(error = %e, "Dropping malformed SSMI line before login ack");
                continue;
            }
            Err(e) => return Err(SessionError::Protocol(e.to_string())),
        };

        match frame.into_inbound() {
            Inbound::Ack(_) => return Ok(()),
            Inbound::Nack(reason) => return Err(SessionError::LoginRefused(reason)),
            Inbound::Event(event) => {
                sink.emit(event);
            }
            Inbound::Other(frame) => debug!(code = frame.code, "Ignoring frame before login ack"),
        }
    }
}

/// A single bad line the reader has already skipped past. I/O errors and
/// oversized lines leave the stream unusable.
fn is_malformed_line(err: &crate::Error) -> bool {
    matches!(
        err.downcast_ref::<frame::Error>(),
        Some(e) if !matches!(e, frame::Error::TooLong(_))
    )
}

async fn read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    sink: InboundSink,
    state: Arc<SessionState>,
) {
    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("SSMI gateway closed the session");
                break;
            }
            Err(e) if is_malformed_line(&e) => {
                warn!(error = %e, "Dropping malformed SSMI line");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "SSMI session read failed");
                break;
            }
        };

        match frame.into_inbound() {
            Inbound::Event(event) => {
                debug!(msisdn = %event.msisdn(), "Inbound event from SSMI gateway");
                if !sink.emit(event) {
                    warn!("Inbound publisher has gone away, dropping event");
                }
            }
            Inbound::Ack(code) if code == u16::from(Command::LinkCheck).to_string() => {
                state.keep_alive().on_ping_success();
            }
            Inbound::Ack(_) => state.keep_alive().reset_failures(),
            Inbound::Nack(reason) => warn!(%reason, "SSMI gateway rejected a command"),
            Inbound::Other(frame) => debug!(code = frame.code, "Ignoring SSMI frame"),
        }
    }

    state.mark_down();
}

async fn keep_alive_loop(writer: SharedWriter, state: Arc<SessionState>, config: KeepAliveConfig) {
    let tick = (config.interval.min(config.timeout) / 2).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(tick);

    loop {
        ticker.tick().await;
        if !state.is_ready() {
            break;
        }

        let due = {
            let mut manager = state.keep_alive();
            if manager.is_overdue() {
                manager.on_ping_failure();
            }
            if manager.is_connection_failed() {
                Err(manager.status())
            } else {
                Ok(manager.should_ping())
            }
        };

        match due {
            Err(status) => {
                warn!(
                    consecutive_failures = status.consecutive_failures,
                    sent = status.total_pings,
                    acknowledged = status.total_pongs,
                    "SSMI link checks unanswered, marking session down"
                );
                state.mark_down();
                break;
            }
            Ok(false) => {}
            Ok(true) => {
                let result = writer.lock().await.write_frame(&Frame::link_check()).await;
                let mut manager = state.keep_alive();
                match result {
                    Ok(()) => manager.on_ping_sent(),
                    Err(e) => {
                        warn!(error = %e, "Failed to send SSMI link check");
                        manager.on_ping_failure();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InboundEvent, UssdType};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn gateway() -> (TcpListener, SsmiSettings) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings = SsmiSettings::new("127.0.0.1", port, "user", "secret")
            .with_keep_alive(KeepAliveConfig::disabled());
        (listener, settings)
    }

    #[tokio::test]
    async fn logs_in_and_sends_ussd() {
        let (listener, settings) = gateway().await;

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();

            let login = lines.next_line().await.unwrap().unwrap();
            write.write_all(b"SSMI|100|1\r\n").await.unwrap();
            let send = lines.next_line().await.unwrap().unwrap();
            (login, send)
        });

        let (sink, _rx) = InboundSink::channel();
        let mut session = SsmiConnector.connect(&settings, sink).await.unwrap();
        assert!(session.is_ready());

        let command = SendCommand::ussd("27711234567", "hello", UssdType::New);
        session.send(&command).await.unwrap();

        let (login, send) = server.await.unwrap();
        assert_eq!(login, "SSMI|1|user|secret");
        assert_eq!(send, "SSMI|110|27711234567|1|hello");
        session.close().await;
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn login_nack_is_refused() {
        let (listener, settings) = gateway().await;

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            write.write_all(b"SSMI|101|bad credentials\r\n").await.unwrap();
            // Hold the socket open until the client has read the reply.
            let _ = lines.next_line().await;
        });

        let (sink, _rx) = InboundSink::channel();
        let err = SsmiConnector.connect(&settings, sink).await.unwrap_err();
        assert!(matches!(err, SessionError::LoginRefused(reason) if reason == "bad credentials"));
    }

    #[tokio::test]
    async fn unreachable_gateway_reports_address() {
        let (listener, settings) = gateway().await;
        drop(listener);

        let (sink, _rx) = InboundSink::channel();
        let err = SsmiConnector.connect(&settings, sink).await.unwrap_err();
        match err {
            SessionError::Connect { host, port, .. } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, settings.port);
            }
            other => panic!("expected connect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_messages_reach_the_sink() {
        let (listener, settings) = gateway().await;

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            write.write_all(b"SSMI|100|1\r\n").await.unwrap();
            write
                .write_all(b"SSMI|107|27711234567|hi there\r\nnoise\r\n")
                .await
                .unwrap();
            write
                .write_all(b"SSMI|105|27711234567|ref1|1\r\n")
                .await
                .unwrap();
            let _ = lines.next_line().await;
        });

        let (sink, mut rx) = InboundSink::channel();
        let _session = SsmiConnector.connect(&settings, sink).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            InboundEvent::Sms {
                msisdn: "27711234567".to_string(),
                message: "hi there".to_string(),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            InboundEvent::DeliveryReport {
                msisdn: "27711234567".to_string(),
                reference: "ref1".to_string(),
                status: "1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn peer_close_drops_readiness() {
        let (listener, settings) = gateway().await;

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            socket.write_all(b"SSMI|100|1\r\n").await.unwrap();
            // Dropping the socket closes the session.
        });

        let (sink, _rx) = InboundSink::channel();
        let mut session = SsmiConnector.connect(&settings, sink).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while session.is_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let err = session
            .send(&SendCommand::sms("27711234567", "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotReady));
    }

    #[tokio::test]
    async fn sends_link_checks() {
        let (listener, settings) = gateway().await;
        let settings = settings.with_keep_alive(
            KeepAliveConfig::new(Duration::from_millis(20)).with_timeout(Duration::from_secs(5)),
        );

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            write.write_all(b"SSMI|100|1\r\n").await.unwrap();

            let first = lines.next_line().await.unwrap().unwrap();
            write.write_all(b"SSMI|100|3\r\n").await.unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            (first, second)
        });

        let (sink, _rx) = InboundSink::channel();
        let session = SsmiConnector.connect(&settings, sink).await.unwrap();

        let (first, second) = server.await.unwrap();
        assert_eq!(first, "SSMI|3");
        assert_eq!(second, "SSMI|3");
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn unanswered_link_checks_mark_the_session_down() {
        let (listener, settings) = gateway().await;
        let settings = settings.with_keep_alive(
            KeepAliveConfig::new(Duration::from_millis(30))
                .with_timeout(Duration::from_millis(20))
                .with_max_failures(2),
        );

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            write.write_all(b"SSMI|100|1\r\n").await.unwrap();
            // Read link checks but never acknowledge them.
            while let Ok(Some(_)) = lines.next_line().await {}
        });

        let (sink, _rx) = InboundSink::channel();
        let mut session = SsmiConnector.connect(&settings, sink).await.unwrap();
        assert!(session.is_ready());

        tokio::time::timeout(Duration::from_secs(2), async {
            while session.is_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session stayed ready without link check replies");

        let err = session
            .send(&SendCommand::sms("27711234567", "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotReady));
    }

    #[tokio::test]
    async fn malformed_line_before_login_ack_is_skipped() {
        let (listener, settings) = gateway().await;

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            write
                .write_all(b"welcome to the gateway\r\nSSMI|100|1\r\n")
                .await
                .unwrap();
            let _ = lines.next_line().await;
        });

        let (sink, _rx) = InboundSink::channel();
        let session = SsmiConnector.connect(&settings, sink).await.unwrap();
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn unsendable_command_is_rejected_without_dropping_the_session() {
        let (listener, settings) = gateway().await;

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            write.write_all(b"SSMI|100|1\r\n").await.unwrap();
            let _ = lines.next_line().await;
        });

        let (sink, _rx) = InboundSink::channel();
        let mut session = SsmiConnector.connect(&settings, sink).await.unwrap();

        let err = session
            .send(&SendCommand::sms("2771|1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Rejected(_)));
        assert!(!err.is_session_failure());
        assert!(session.is_ready());
    }
}
