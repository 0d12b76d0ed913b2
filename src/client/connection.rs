//! Client handle and the task that owns one connection
//!
//! ```text
//!   UascClient (clone per caller)
//!        | Command (unbounded mpsc, oneshot reply)
//!        v
//!   ConnectionTask --- owns ---> HandshakeController, ChunkEncoder/Decoder,
//!        ^                       Dispatcher, timers, socket write half
//!        | frames (bounded mpsc)
//!   reader task  <--- socket read half
//! ```
//!
//! The connection task is the only place channel state is mutated. It waits
//! on commands, inbound frames and the earliest pending deadline
//! (Acknowledge, OpenSecureChannel, renewal, request timeouts).

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, error, trace, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use url::{Host, Url};

use super::codec::{MessageCodec, RawCodec};
use super::config::{UascClientConfig, DEFAULT_PORT};
use super::dispatcher::{Dispatcher, RequestIdSequence, ResponseHandler, ResponseSender};
use super::handshake::{ChannelState, HandshakeController};
use crate::channel::{ChunkDecoder, ChunkEncoder, DecodeOutcome, DecodedMessage};
use crate::encoding::SecurityTokenRequestType;
use crate::error::{ChannelError, Result};
use crate::status::StatusCode;
use crate::transport::{
    AcknowledgeMessage, ErrorMessage, FrameAccumulator, MessageHeader, MessageType,
    MESSAGE_HEADER_SIZE,
};

/// Frames buffered between the reader task and the connection task
const INBOUND_QUEUE_SIZE: usize = 64;

/// Initial socket read buffer
const READ_BUFFER_SIZE: usize = 8192;

/// Idle time before TCP keepalive probes start
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Byte stream a secure channel can run on
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ChannelStream for T {}

type BoxedStream = Box<dyn ChannelStream>;

enum Command {
    Connect {
        stream: BoxedStream,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        body: Bytes,
        timeout: Duration,
        reply: ResponseSender,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

fn task_gone() -> ChannelError {
    ChannelError::ConnectionClosed("connection task stopped".into())
}

fn not_connected() -> ChannelError {
    ChannelError::ConnectionClosed("not connected".into())
}

/// Split an `opc.tcp://host:port/path` URL into host and port
pub fn endpoint_address(endpoint_url: &str) -> Result<(String, u16)> {
    let invalid = |reason: String| {
        ChannelError::protocol(
            StatusCode::BAD_TCP_ENDPOINT_URL_INVALID,
            format!("invalid endpoint URL {}: {}", endpoint_url, reason),
        )
    };
    let url = Url::parse(endpoint_url).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "opc.tcp" {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(invalid("missing host".into())),
    };
    Ok((host, url.port().unwrap_or(DEFAULT_PORT)))
}

fn configure_socket(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Handle to a secure conversation client
///
/// Cloning is cheap; all clones talk to the same connection task. Requests
/// are written in the order they are submitted and correlated by request id.
pub struct UascClient<C: MessageCodec = RawCodec> {
    config: Arc<UascClientConfig>,
    codec: Arc<C>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
}

impl<C: MessageCodec> Clone for UascClient<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            codec: Arc::clone(&self.codec),
            commands: self.commands.clone(),
            state: self.state.clone(),
        }
    }
}

impl UascClient<RawCodec> {
    /// Create a client passing pre-encoded messages through
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: UascClientConfig) -> Self {
        Self::with_codec(config, RawCodec)
    }
}

impl<C: MessageCodec> UascClient<C> {
    /// Create a client using `codec` for requests and responses
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_codec(config: UascClientConfig, codec: C) -> Self {
        let config = Arc::new(config);
        let (commands, receiver) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ChannelState::Closed);
        let task = ConnectionTask {
            config: Arc::clone(&config),
            commands: receiver,
            state: state_tx,
            request_ids: RequestIdSequence::new(),
            dispatcher: Dispatcher::new(),
            session: None,
        };
        tokio::spawn(task.run());

        Self {
            config,
            codec: Arc::new(codec),
            commands,
            state,
        }
    }

    pub fn config(&self) -> &UascClientConfig {
        &self.config
    }

    /// Open a TCP connection to the endpoint and run the handshake
    pub async fn connect(&self) -> Result<()> {
        self.config.validate()?;
        let (host, port) = endpoint_address(&self.config.endpoint_url)?;
        debug!("connecting to {}:{}", host, port);
        let stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| ChannelError::Timeout(format!("connecting to {}:{}", host, port)))??;
        configure_socket(&stream)?;
        self.connect_with(stream).await
    }

    /// Run the handshake over an already established stream
    ///
    /// Resolves once the secure channel is open.
    pub async fn connect_with<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.config.validate()?;
        let (reply, response) = oneshot::channel();
        self.command(Command::Connect {
            stream: Box::new(stream),
            reply,
        })?;
        response.await.map_err(|_| task_gone())?
    }

    /// Send a request and wait for its response, bounded by the configured
    /// request timeout
    pub async fn send(&self, request: &C::Request) -> Result<C::Response> {
        self.send_with_timeout(request, self.config.request_timeout)
            .await
    }

    pub async fn send_with_timeout(
        &self,
        request: &C::Request,
        timeout: Duration,
    ) -> Result<C::Response> {
        let body = self.codec.encode_request(request)?;
        let (reply, response) = oneshot::channel();
        self.command(Command::Send {
            body,
            timeout,
            reply,
        })?;
        let body = response.await.map_err(|_| task_gone())??;
        self.codec.decode_response(body)
    }

    /// Send CloseSecureChannel and close the socket
    pub async fn close(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Close { reply })?;
        response.await.map_err(|_| task_gone())?
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| task_gone())
    }
}

/// Per-socket state, present from Connect until teardown
struct Session {
    writer: WriteHalf<BoxedStream>,
    inbound: mpsc::Receiver<Result<Bytes>>,
    reader: JoinHandle<()>,
    handshake: HandshakeController,
    encoder: Option<ChunkEncoder>,
    decoder: Option<ChunkDecoder>,
    connect_reply: Option<oneshot::Sender<Result<()>>>,
    acknowledge_deadline: Option<Instant>,
    open_deadline: Option<Instant>,
    renew_at: Option<Instant>,
}

impl Session {
    async fn write_chunks(&mut self, chunks: &[Bytes]) -> Result<()> {
        for chunk in chunks {
            self.writer.write_all(chunk).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_close(&mut self, request_id: u32, timeout: Duration) -> Result<()> {
        let body = self.handshake.close_request(request_id, timeout)?;
        let encoder = self.encoder.as_mut().ok_or_else(not_connected)?;
        let chunks = encoder.encode_symmetric(
            self.handshake.channel(),
            MessageType::CloseSecureChannel,
            request_id,
            &body,
        )?;
        self.write_chunks(&chunks).await
    }
}

/// Whether the channel survives a failed renewal
fn renewal_failure_is_recoverable(error: &ChannelError) -> bool {
    matches!(
        error,
        ChannelError::ServiceFault { .. }
            | ChannelError::Timeout(_)
            | ChannelError::MessageAbort { .. }
            | ChannelError::MessageTooLarge { .. }
    )
}

fn open_failed(
    request_type: SecurityTokenRequestType,
    channel_id: u32,
    error: ChannelError,
) -> Result<()> {
    match request_type {
        SecurityTokenRequestType::Renew if renewal_failure_is_recoverable(&error) => {
            warn!(
                "renewing channel {} failed, keeping the current token: {}",
                channel_id, error
            );
            Ok(())
        }
        _ => Err(error),
    }
}

struct ConnectionTask {
    config: Arc<UascClientConfig>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ChannelState>,
    request_ids: RequestIdSequence,
    dispatcher: Dispatcher,
    session: Option<Session>,
}

async fn next_frame(session: &mut Option<Session>) -> Result<Bytes> {
    match session {
        Some(session) => session
            .inbound
            .recv()
            .await
            .unwrap_or_else(|| Err(ChannelError::ConnectionClosed("reader stopped".into()))),
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown(ChannelError::ConnectionClosed("client dropped".into()))
                            .await;
                        break;
                    }
                },
                frame = next_frame(&mut self.session) => {
                    if let Err(e) = self.handle_frame(frame).await {
                        self.fail(e).await;
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    if let Err(e) = self.handle_deadlines().await {
                        self.fail(e).await;
                    }
                }
            }
            self.publish_state();
        }
        trace!("connection task finished");
    }

    fn current_state(&self) -> ChannelState {
        self.session
            .as_ref()
            .map(|s| s.handshake.state())
            .unwrap_or(ChannelState::Closed)
    }

    fn publish_state(&self) {
        let current = self.current_state();
        self.state.send_if_modified(|state| {
            if *state == current {
                return false;
            }
            debug!("channel state {} -> {}", state, current);
            *state = current;
            true
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        let session = self.session.as_ref();
        [
            self.dispatcher.next_deadline(),
            session.and_then(|s| s.acknowledge_deadline),
            session.and_then(|s| s.open_deadline),
            session.and_then(|s| s.renew_at),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { stream, reply } => self.start_session(stream, reply).await,
            Command::Send {
                body,
                timeout,
                reply,
            } => self.submit(body, timeout, reply).await,
            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn start_session(&mut self, stream: BoxedStream, reply: oneshot::Sender<Result<()>>) {
        if self.session.is_some() {
            let _ = reply.send(Err(ChannelError::Configuration(
                "client is already connected".into(),
            )));
            return;
        }
        let channel = match self.config.secure_channel() {
            Ok(channel) => channel,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let mut handshake = HandshakeController::new(
            channel,
            self.config.endpoint_url.clone(),
            self.config.encoding_limits,
            self.config.channel_lifetime,
        );
        self.state.send_replace(ChannelState::Connecting);

        let hello = match handshake.hello() {
            Ok(hello) => hello,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let (read_half, mut writer) = tokio::io::split(stream);
        if let Err(e) = writer.write_all(&hello).await {
            let _ = reply.send(Err(e.into()));
            return;
        }

        let (frames, inbound) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let accumulator = FrameAccumulator::new(self.config.encoding_limits.max_chunk_size);
        let reader = tokio::spawn(read_frames(read_half, accumulator, frames));

        self.session = Some(Session {
            writer,
            inbound,
            reader,
            handshake,
            encoder: None,
            decoder: None,
            connect_reply: Some(reply),
            acknowledge_deadline: Some(Instant::now() + self.config.acknowledge_timeout),
            open_deadline: None,
            renew_at: None,
        });
    }

    async fn submit(&mut self, body: Bytes, timeout: Duration, reply: ResponseSender) {
        let deadline = Instant::now() + timeout;
        let state = self.current_state();
        if state.accepts_traffic() {
            if let Err(e) = self.send_request(body, reply, deadline).await {
                self.fail(e).await;
            }
        } else if state.is_handshaking() {
            trace!("queueing request until the channel is open");
            self.dispatcher.enqueue(body, reply, deadline);
        } else {
            let _ = reply.send(Err(ChannelError::ConnectionClosed(format!(
                "channel is {}",
                state
            ))));
        }
    }

    /// Frame and write one request
    ///
    /// Size limit failures only fail this request. An `Err` means the shared
    /// send state is broken and the channel must go down.
    async fn send_request(
        &mut self,
        body: Bytes,
        reply: ResponseSender,
        deadline: Instant,
    ) -> Result<()> {
        let request_id = self.request_ids.next_id();
        self.dispatcher.register(request_id, reply, deadline);

        let session = match self.session.as_mut() {
            Some(session) => session,
            None => {
                self.dispatcher
                    .handle_send_failure(request_id, not_connected());
                return Ok(());
            }
        };
        let encoder = match session.encoder.as_mut() {
            Some(encoder) => encoder,
            None => {
                self.dispatcher
                    .handle_send_failure(request_id, not_connected());
                return Ok(());
            }
        };

        let chunks = match encoder.encode_symmetric(
            session.handshake.channel(),
            MessageType::SecureMessage,
            request_id,
            &body,
        ) {
            Ok(chunks) => chunks,
            Err(
                e @ (ChannelError::MessageTooLarge { .. } | ChannelError::EncodingLimitsExceeded(_)),
            ) => {
                debug!("request_id={} rejected before framing: {}", request_id, e);
                self.dispatcher.handle_send_failure(request_id, e);
                return Ok(());
            }
            Err(e) => {
                let reason = format!("framing request {} failed: {}", request_id, e);
                self.dispatcher.handle_send_failure(request_id, e);
                return Err(ChannelError::ConnectionClosed(reason));
            }
        };

        trace!(
            "writing request_id={} in {} chunk(s)",
            request_id,
            chunks.len()
        );
        if let Err(e) = session.write_chunks(&chunks).await {
            let reason = format!("writing request {} failed: {}", request_id, e);
            self.dispatcher.handle_send_failure(request_id, e);
            return Err(ChannelError::ConnectionClosed(reason));
        }
        Ok(())
    }

    async fn flush_queue(&mut self) -> Result<()> {
        let mut queued = self.dispatcher.take_queued();
        if !queued.is_empty() {
            debug!("sending {} queued requests", queued.len());
        }
        while let Some(request) = queued.pop_front() {
            if let Err(e) = self
                .send_request(request.body, request.reply, request.deadline)
                .await
            {
                for rest in queued {
                    self.dispatcher.enqueue(rest.body, rest.reply, rest.deadline);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn send_open(&mut self, request_type: SecurityTokenRequestType) -> Result<()> {
        let request_id = self.request_ids.next_id();
        let timeout = self.config.request_timeout;
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        let body = session
            .handshake
            .open_request(request_type, request_id, timeout)?;
        let encoder = session.encoder.as_mut().ok_or_else(not_connected)?;
        let chunks = encoder.encode_asymmetric(session.handshake.channel(), request_id, &body)?;
        session.write_chunks(&chunks).await?;
        session.open_deadline = Some(Instant::now() + timeout);
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Result<Bytes>) -> Result<()> {
        let frame = frame?;
        let header = MessageHeader::peek(&frame)?;
        match header.message_type {
            MessageType::Acknowledge => self.on_acknowledge(frame).await,
            MessageType::Error => {
                let mut body = frame.slice(MESSAGE_HEADER_SIZE..);
                let message = ErrorMessage::decode(&mut body)?;
                warn!(
                    "server sent Error {}: {}",
                    message.error, message.reason
                );
                Err(message.into_error())
            }
            MessageType::OpenSecureChannel
            | MessageType::SecureMessage
            | MessageType::CloseSecureChannel => self.on_secure_chunk(frame).await,
            other => Err(ChannelError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!("unexpected {:?} message", other),
            )),
        }
    }

    async fn on_acknowledge(&mut self, frame: Bytes) -> Result<()> {
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        let mut body = frame.slice(MESSAGE_HEADER_SIZE..);
        let ack = AcknowledgeMessage::decode(&mut body)?;
        let parameters = session.handshake.on_acknowledge(&ack)?;
        session.acknowledge_deadline = None;
        session.encoder = Some(ChunkEncoder::new(parameters));
        session.decoder = Some(ChunkDecoder::new(parameters));
        self.send_open(SecurityTokenRequestType::Issue).await
    }

    async fn on_secure_chunk(&mut self, frame: Bytes) -> Result<()> {
        let now = Instant::now().into_std();
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        session.handshake.expire_previous_token(now);
        let decoder = session.decoder.as_mut().ok_or_else(|| {
            ChannelError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                "secure conversation message before Acknowledge",
            )
        })?;

        match decoder.decode(session.handshake.channel(), frame, now)? {
            DecodeOutcome::Incomplete => Ok(()),
            DecodeOutcome::Failed { request_id, error } => {
                match session.handshake.pending_open() {
                    Some(pending) if pending.request_id == request_id => {
                        session.open_deadline = None;
                        session.handshake.on_open_timeout();
                        open_failed(
                            pending.request_type,
                            session.handshake.channel().channel_id(),
                            error,
                        )
                    }
                    _ => {
                        self.dispatcher.handle_receive_failure(request_id, error);
                        Ok(())
                    }
                }
            }
            DecodeOutcome::Complete(message) => match message.message_type {
                MessageType::OpenSecureChannel => self.on_open_response(message).await,
                MessageType::SecureMessage => {
                    self.dispatcher
                        .handle_response(message.request_id, message.body);
                    Ok(())
                }
                _ => Err(ChannelError::ConnectionClosed(
                    "server closed the secure channel".into(),
                )),
            },
        }
    }

    async fn on_open_response(&mut self, message: DecodedMessage) -> Result<()> {
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        let pending = match session.handshake.pending_open() {
            Some(pending) if pending.request_id == message.request_id => pending,
            _ => {
                warn!(
                    "dropping OpenSecureChannel response for unknown request_id={}",
                    message.request_id
                );
                return Ok(());
            }
        };

        if let Some(header) = &message.security_header {
            if let Some(chain) = session.handshake.check_security_header(header)? {
                let validator = Arc::clone(&self.config.certificate_validator);
                tokio::task::spawn_blocking(move || validator.validate_certificate_chain(&chain))
                    .await
                    .map_err(|e| {
                        ChannelError::security(
                            StatusCode::BAD_INTERNAL_ERROR,
                            format!("certificate validation did not complete: {}", e),
                        )
                    })??;
            }
        }

        session.open_deadline = None;
        let now = Instant::now();
        match session.handshake.on_open_response(message.body, now.into_std()) {
            Ok(renew_after) => {
                session.renew_at = renew_after.map(|after| now + after);
                let channel_id = session.handshake.channel().channel_id();
                match pending.request_type {
                    SecurityTokenRequestType::Issue => {
                        debug!("secure channel {} open", channel_id);
                        let reply = session.connect_reply.take();
                        self.publish_state();
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(()));
                        }
                        self.flush_queue().await
                    }
                    SecurityTokenRequestType::Renew => {
                        debug!("secure channel {} renewed", channel_id);
                        Ok(())
                    }
                }
            }
            Err(e) => open_failed(
                pending.request_type,
                session.handshake.channel().channel_id(),
                e,
            ),
        }
    }

    async fn handle_deadlines(&mut self) -> Result<()> {
        let now = Instant::now();
        for request_id in self.dispatcher.expire(now) {
            if let Some(decoder) = self.session.as_mut().and_then(|s| s.decoder.as_mut()) {
                decoder.discard(request_id);
            }
        }

        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Ok(()),
        };
        if session.acknowledge_deadline.is_some_and(|d| d <= now) {
            return Err(ChannelError::Timeout(
                "no Acknowledge from the server".into(),
            ));
        }
        if session.open_deadline.is_some_and(|d| d <= now) {
            session.open_deadline = None;
            if let Some(pending) = session.handshake.on_open_timeout() {
                if let Some(decoder) = session.decoder.as_mut() {
                    decoder.discard(pending.request_id);
                }
                open_failed(
                    pending.request_type,
                    session.handshake.channel().channel_id(),
                    ChannelError::Timeout(format!(
                        "no OpenSecureChannel response to request {}",
                        pending.request_id
                    )),
                )?;
            }
        }
        if session.renew_at.is_some_and(|d| d <= now) {
            session.renew_at = None;
            if session.handshake.state() == ChannelState::Open {
                self.send_open(SecurityTokenRequestType::Renew).await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if session.handshake.state().accepts_traffic() {
                let request_id = self.request_ids.next_id();
                if let Err(e) = session
                    .send_close(request_id, self.config.request_timeout)
                    .await
                {
                    debug!("CloseSecureChannel not sent: {}", e);
                }
            }
        }
        self.teardown(ChannelError::ConnectionClosed("closed by client".into()))
            .await;
    }

    async fn fail(&mut self, error: ChannelError) {
        let channel_id = self
            .session
            .as_ref()
            .map(|s| s.handshake.channel().channel_id())
            .unwrap_or_default();
        error!("channel {} failed: {}", channel_id, error);
        self.teardown(error).await;
    }

    async fn teardown(&mut self, cause: ChannelError) {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        session.handshake.set_closed();
        session.reader.abort();
        let _ = session.writer.shutdown().await;

        self.dispatcher.handle_channel_inactive(&cause);
        if let Some(listener) = &self.config.channel_inactive_listener {
            listener(&cause);
        }
        self.publish_state();
        if let Some(reply) = session.connect_reply.take() {
            let _ = reply.send(Err(cause));
        }
    }
}

/// Cut the socket byte stream into UA TCP messages
async fn read_frames(
    mut reader: ReadHalf<BoxedStream>,
    accumulator: FrameAccumulator,
    frames: mpsc::Sender<Result<Bytes>>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        loop {
            match accumulator.next_frame(&mut buf) {
                Ok(Some(frame)) => {
                    if frames.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = frames.send(Err(e)).await;
                    return;
                }
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = frames
                    .send(Err(ChannelError::ConnectionClosed(
                        "connection closed by the server".into(),
                    )))
                    .await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = frames.send(Err(e.into())).await;
                return;
            }
        }
    }
}
