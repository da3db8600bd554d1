//! Built-in Diameter transport (TCP)
//!
//! Framing per RFC 6733 §2.1: the 3-byte length in the message header
//! delimits messages on the stream. On top of the framing this module does
//! just enough of the base protocol to hand out usable [`PeerLink`]s:
//! a CER/CEA exchange to learn the peer's Origin-Host and Origin-Realm,
//! DWA/DPA replies, and a DWR on each silent watchdog interval. A link
//! silent for three intervals is reported on the error channel.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::avp::{code, Avp, AvpValue};
use crate::config::{ClientConfig, PeerConnConfig, TransportProtocol};
use crate::error::{DiameterError, DiameterResult, ResultCode};
use crate::link::{Dialer, ErrorReport, InboundMessage, LinkHandle, LinkId, PeerLink, PeerMetadata};
use crate::message::{base_cmd, cmd_flags, DiameterMessage, BASE_APPLICATION_ID, HEADER_SIZE};

/// Largest message accepted from a peer
const MAX_MESSAGE_SIZE: usize = 65536;

/// Bound on connect and on waiting for the capability exchange
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Silent watchdog intervals before a link is reported dead
const MAX_MISSED_WATCHDOGS: u32 = 3;

/// Disconnect-Cause REBOOTING
const DISCONNECT_CAUSE_REBOOTING: i32 = 0;

/// Reads whole Diameter messages from a byte stream
pub struct FrameReader<R> {
    inner: R,
    read_buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Next message. Cancel safe: partial input stays buffered.
    pub async fn read_message(&mut self) -> DiameterResult<DiameterMessage> {
        loop {
            if let Some(msg) = self.try_parse_message()? {
                return Ok(msg);
            }
            if self.inner.read_buf(&mut self.read_buf).await? == 0 {
                return Err(DiameterError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
    }

    fn try_parse_message(&mut self) -> DiameterResult<Option<DiameterMessage>> {
        if self.read_buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let msg_len = (usize::from(self.read_buf[1]) << 16)
            | (usize::from(self.read_buf[2]) << 8)
            | usize::from(self.read_buf[3]);
        if msg_len < HEADER_SIZE {
            return Err(DiameterError::InvalidMessage(format!(
                "message length {msg_len} is less than header size"
            )));
        }
        if msg_len > MAX_MESSAGE_SIZE {
            return Err(DiameterError::InvalidMessage(format!(
                "message length {msg_len} exceeds maximum {MAX_MESSAGE_SIZE}"
            )));
        }
        if self.read_buf.len() < msg_len {
            return Ok(None);
        }

        let mut bytes = self.read_buf.split_to(msg_len).freeze();
        DiameterMessage::decode(&mut bytes).map(Some)
    }
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &DiameterMessage,
) -> DiameterResult<()> {
    writer.write_all(&msg.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Local identity, channels and id counters shared by every link
struct Engine {
    config: ClientConfig,
    origin_state_id: u32,
    hop_by_hop: AtomicU32,
    end_to_end: AtomicU32,
    inbound: mpsc::Sender<InboundMessage>,
    errors: mpsc::Sender<ErrorReport>,
}

impl Engine {
    fn new(
        config: ClientConfig,
        origin_state_id: u32,
        inbound: mpsc::Sender<InboundMessage>,
        errors: mpsc::Sender<ErrorReport>,
    ) -> Self {
        Self {
            config,
            origin_state_id,
            hop_by_hop: AtomicU32::new(rand::random()),
            end_to_end: AtomicU32::new(rand::random()),
            inbound,
            errors,
        }
    }

    /// Base protocol request; these are never proxiable
    fn request(&self, command_code: u32) -> DiameterMessage {
        let mut msg = DiameterMessage::new_request(command_code, BASE_APPLICATION_ID).with_ids(
            self.hop_by_hop.fetch_add(1, Ordering::Relaxed),
            self.end_to_end.fetch_add(1, Ordering::Relaxed),
        );
        msg.header.flags &= !cmd_flags::PROXIABLE;
        msg
    }

    fn add_origin(&self, msg: &mut DiameterMessage) {
        msg.add_avp(Avp::identity(code::ORIGIN_HOST, self.config.host.as_str()));
        msg.add_avp(Avp::identity(code::ORIGIN_REALM, self.config.realm.as_str()));
    }

    /// AVPs shared by CER and CEA
    fn add_capabilities(&self, msg: &mut DiameterMessage, local_ip: IpAddr) {
        self.add_origin(msg);
        msg.add_avp(Avp::mandatory(code::HOST_IP_ADDRESS, AvpValue::Address(local_ip)));
        msg.add_avp(Avp::mandatory(
            code::VENDOR_ID,
            AvpValue::Unsigned32(self.config.vendor_id),
        ));
        msg.add_avp(Avp::new(
            code::PRODUCT_NAME,
            0,
            None,
            AvpValue::Utf8String(self.config.product_name.clone()),
        ));
        msg.add_avp(Avp::mandatory(
            code::ORIGIN_STATE_ID,
            AvpValue::Unsigned32(self.origin_state_id),
        ));

        if self.config.vendor_id != 0 {
            msg.add_avp(Avp::mandatory(
                code::SUPPORTED_VENDOR_ID,
                AvpValue::Unsigned32(self.config.vendor_id),
            ));
        }
        for &app_id in &self.config.auth_app_ids {
            if self.config.vendor_id == 0 {
                msg.add_avp(Avp::mandatory(
                    code::AUTH_APPLICATION_ID,
                    AvpValue::Unsigned32(app_id),
                ));
                continue;
            }
            msg.add_avp(Avp::mandatory(
                code::VENDOR_SPECIFIC_APPLICATION_ID,
                AvpValue::Grouped(vec![
                    Avp::mandatory(code::VENDOR_ID, AvpValue::Unsigned32(self.config.vendor_id)),
                    Avp::mandatory(code::AUTH_APPLICATION_ID, AvpValue::Unsigned32(app_id)),
                ]),
            ));
        }
        for &app_id in &self.config.acct_app_ids {
            msg.add_avp(Avp::mandatory(
                code::ACCT_APPLICATION_ID,
                AvpValue::Unsigned32(app_id),
            ));
        }
    }

    fn cer(&self, local_ip: IpAddr) -> DiameterMessage {
        let mut cer = self.request(base_cmd::CAPABILITIES_EXCHANGE);
        self.add_capabilities(&mut cer, local_ip);
        cer
    }

    fn cea(&self, cer: &DiameterMessage, local_ip: IpAddr) -> DiameterMessage {
        let mut cea = DiameterMessage::new_answer(cer);
        cea.add_avp(success());
        self.add_capabilities(&mut cea, local_ip);
        cea
    }

    fn dwr(&self) -> DiameterMessage {
        let mut dwr = self.request(base_cmd::DEVICE_WATCHDOG);
        self.add_origin(&mut dwr);
        dwr.add_avp(Avp::mandatory(
            code::ORIGIN_STATE_ID,
            AvpValue::Unsigned32(self.origin_state_id),
        ));
        dwr
    }

    /// DWA or DPA for a base-protocol request
    fn base_answer(&self, request: &DiameterMessage) -> DiameterMessage {
        let mut answer = DiameterMessage::new_answer(request);
        answer.add_avp(success());
        self.add_origin(&mut answer);
        if request.header.command_code == base_cmd::DEVICE_WATCHDOG {
            answer.add_avp(Avp::mandatory(
                code::ORIGIN_STATE_ID,
                AvpValue::Unsigned32(self.origin_state_id),
            ));
        }
        answer
    }

    fn dpr(&self) -> DiameterMessage {
        let mut dpr = self.request(base_cmd::DISCONNECT_PEER);
        self.add_origin(&mut dpr);
        dpr.add_avp(Avp::mandatory(
            code::DISCONNECT_CAUSE,
            AvpValue::Integer32(DISCONNECT_CAUSE_REBOOTING),
        ));
        dpr
    }

    fn watchdog_interval(&self) -> Option<Duration> {
        Some(self.config.watchdog_interval).filter(|d| !d.is_zero())
    }

    /// Wrap a capability-exchanged stream and start its reader
    fn start_link(
        self: &Arc<Self>,
        peer: String,
        metadata: PeerMetadata,
        reader: FrameReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Arc<TcpPeerLink> {
        let link = Arc::new(TcpPeerLink {
            id: LinkId::next(),
            peer,
            metadata,
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            reader: std::sync::Mutex::new(None),
            engine: self.clone(),
        });
        let task = tokio::spawn(read_loop(link.clone(), reader, self.clone()));
        *link.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        link
    }
}

fn success() -> Avp {
    Avp::mandatory(
        code::RESULT_CODE,
        AvpValue::Unsigned32(ResultCode::Success as u32),
    )
}

fn peer_metadata(msg: &DiameterMessage) -> DiameterResult<PeerMetadata> {
    let origin_host = msg
        .origin_host()
        .ok_or_else(|| DiameterError::MissingAvp("Origin-Host".into()))?;
    let origin_realm = msg
        .origin_realm()
        .ok_or_else(|| DiameterError::MissingAvp("Origin-Realm".into()))?;
    Ok(PeerMetadata {
        origin_host: origin_host.to_string(),
        origin_realm: origin_realm.to_string(),
    })
}

/// An established TCP association with a peer
pub struct TcpPeerLink {
    id: LinkId,
    peer: String,
    metadata: PeerMetadata,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    engine: Arc<Engine>,
}

impl TcpPeerLink {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tell the peer we are going away, then close
    pub async fn disconnect(&self) -> DiameterResult<()> {
        let result = self.write(&self.engine.dpr()).await;
        self.close().await;
        result
    }
}

impl fmt::Debug for TcpPeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPeerLink")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("metadata", &self.metadata)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl PeerLink for TcpPeerLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn metadata(&self) -> Option<PeerMetadata> {
        Some(self.metadata.clone())
    }

    async fn write(&self, msg: &DiameterMessage) -> DiameterResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(DiameterError::LinkClosed);
        };
        write_message(stream, msg)
            .await
            .map_err(|e| DiameterError::write(&self.peer, e))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        log::debug!("[{}] {} closed", self.peer, self.id);
    }
}

async fn read_loop(
    link: Arc<TcpPeerLink>,
    mut reader: FrameReader<OwnedReadHalf>,
    engine: Arc<Engine>,
) {
    let interval = engine.watchdog_interval();
    let mut missed_watchdogs = 0;

    let error = loop {
        let next = match interval {
            Some(interval) => match timeout(interval, reader.read_message()).await {
                Ok(next) => next,
                Err(_) => {
                    missed_watchdogs += 1;
                    if missed_watchdogs >= MAX_MISSED_WATCHDOGS {
                        break DiameterError::Protocol(format!(
                            "no traffic for {} watchdog intervals",
                            missed_watchdogs
                        ));
                    }
                    if let Err(e) = link.write(&engine.dwr()).await {
                        break e;
                    }
                    continue;
                }
            },
            None => reader.read_message().await,
        };

        let msg = match next {
            Ok(msg) => msg,
            Err(e) => break e,
        };
        missed_watchdogs = 0;

        match (msg.header.command_code, msg.header.is_request()) {
            (base_cmd::DEVICE_WATCHDOG, true) => {
                if let Err(e) = link.write(&engine.base_answer(&msg)).await {
                    break e;
                }
            }
            (base_cmd::DEVICE_WATCHDOG, false) => {}
            (base_cmd::DISCONNECT_PEER, true) => {
                let _ = link.write(&engine.base_answer(&msg)).await;
                log::info!("[{}] peer sent DPR", link.peer);
                break DiameterError::LinkClosed;
            }
            (base_cmd::DISCONNECT_PEER, false) => break DiameterError::LinkClosed,
            (base_cmd::CAPABILITIES_EXCHANGE, _) => {
                log::warn!("[{}] unexpected capability exchange on open link", link.peer);
            }
            _ => {
                let inbound = InboundMessage {
                    link: link.id,
                    message: msg,
                };
                if engine.inbound.send(inbound).await.is_err() {
                    log::debug!("[{}] inbound channel closed", link.peer);
                    return;
                }
            }
        }
    };

    if link.is_closed() {
        return;
    }
    log::warn!("[{}] {} failed: {error}", link.peer, link.id);
    let _ = engine
        .errors
        .send(ErrorReport {
            link: link.id,
            error,
        })
        .await;
}

/// Addresses for `peer`; IP literals skip the resolver
async fn resolve(peer: &PeerConnConfig) -> DiameterResult<Vec<SocketAddr>> {
    if let Some(addr) = peer.remote_socket_addr() {
        return Ok(vec![addr]);
    }
    peer.check_remote()?;
    Ok(lookup_host(peer.address.as_str()).await?.collect())
}

async fn connect_addr(remote: SocketAddr, local: Option<SocketAddr>) -> DiameterResult<TcpStream> {
    let socket = match remote {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(local) = local {
        socket.bind(local)?;
    }
    match timeout(HANDSHAKE_TIMEOUT, socket.connect(remote)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(DiameterError::Protocol(format!("connect to {remote} timed out"))),
    }
}

/// Dials TCP peers and performs the capability exchange
pub struct TcpDialer {
    engine: Arc<Engine>,
}

impl TcpDialer {
    /// Inbound non-base messages go to `inbound`, link failures to `errors`
    pub fn new(
        config: ClientConfig,
        origin_state_id: u32,
        inbound: mpsc::Sender<InboundMessage>,
        errors: mpsc::Sender<ErrorReport>,
    ) -> Self {
        Self {
            engine: Arc::new(Engine::new(config, origin_state_id, inbound, errors)),
        }
    }

    /// Connect to the first reachable address `peer` resolves to
    async fn connect(&self, peer: &PeerConnConfig) -> DiameterResult<TcpStream> {
        let local = peer.local_addr()?;
        let mut last_error = None;
        for remote in resolve(peer).await? {
            if local.is_some_and(|local| local.is_ipv4() != remote.is_ipv4()) {
                continue;
            }
            match connect_addr(remote, local).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    log::debug!("[{peer}] connect to {remote} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            DiameterError::Protocol(format!("no usable address for {}", peer.address))
        }))
    }

    async fn handshake(&self, peer: &PeerConnConfig) -> DiameterResult<Arc<TcpPeerLink>> {
        let stream = self.connect(peer).await?;
        let local_ip = stream.local_addr()?.ip();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let cer = self.engine.cer(local_ip);
        write_message(&mut write_half, &cer).await?;
        let cea = timeout(HANDSHAKE_TIMEOUT, reader.read_message())
            .await
            .map_err(|_| DiameterError::Protocol("no CEA".into()))??;

        if cea.header.command_code != base_cmd::CAPABILITIES_EXCHANGE
            || cea.header.is_request()
            || cea.header.hop_by_hop_id != cer.header.hop_by_hop_id
        {
            return Err(DiameterError::Protocol(format!(
                "expected CEA, got command {}",
                cea.header.command_code
            )));
        }
        match cea.result_code() {
            Some(rc) if ResultCode::from(rc).is_success() => {}
            rc => {
                return Err(DiameterError::Protocol(format!(
                    "capability exchange rejected with {rc:?}"
                )))
            }
        }
        let metadata = peer_metadata(&cea)?;

        Ok(self
            .engine
            .start_link(peer.address.clone(), metadata, reader, write_half))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, peer: &PeerConnConfig) -> DiameterResult<LinkHandle> {
        if peer.protocol != TransportProtocol::Tcp {
            return Err(DiameterError::Config(format!(
                "{} is not supported by the TCP dialer",
                peer.protocol
            )));
        }
        let link = self.handshake(peer).await.map_err(|e| match e {
            DiameterError::Config(_) => e,
            e => DiameterError::dial(peer, e),
        })?;
        log::debug!(
            "[{peer}] capability exchange done with {} on {}",
            link.metadata.origin_host,
            link.id
        );
        Ok(link as LinkHandle)
    }
}

/// Accepts peer-initiated TCP connections and answers their CER
pub struct DiameterListener {
    listener: TcpListener,
    engine: Arc<Engine>,
}

impl DiameterListener {
    /// Bind to the given address
    pub async fn bind(
        addr: SocketAddr,
        config: ClientConfig,
        origin_state_id: u32,
        inbound: mpsc::Sender<InboundMessage>,
        errors: mpsc::Sender<ErrorReport>,
    ) -> DiameterResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            engine: Arc::new(Engine::new(config, origin_state_id, inbound, errors)),
        })
    }

    pub fn local_addr(&self) -> DiameterResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and complete its capability exchange
    pub async fn accept(&self) -> DiameterResult<Arc<TcpPeerLink>> {
        let (stream, remote) = self.listener.accept().await?;
        let local_ip = stream.local_addr()?.ip();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let cer = timeout(HANDSHAKE_TIMEOUT, reader.read_message())
            .await
            .map_err(|_| DiameterError::Protocol(format!("no CER from {remote}")))??;
        if cer.header.command_code != base_cmd::CAPABILITIES_EXCHANGE || !cer.header.is_request() {
            return Err(DiameterError::Protocol(format!(
                "expected CER from {remote}, got command {}",
                cer.header.command_code
            )));
        }
        let metadata = peer_metadata(&cer)?;
        write_message(&mut write_half, &self.engine.cea(&cer, local_ip)).await?;

        log::info!(
            "[{remote}] accepted {} ({})",
            metadata.origin_host,
            metadata.origin_realm
        );
        Ok(self
            .engine
            .start_link(remote.to_string(), metadata, reader, write_half))
    }

    /// Accept connections forever, handing each established link to `tx`
    pub async fn run(self, tx: mpsc::Sender<LinkHandle>) -> DiameterResult<()> {
        loop {
            match self.accept().await {
                Ok(link) => {
                    if tx.send(link).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Failed to accept Diameter connection: {e}");
                }
            }
        }
        Ok(())
    }
}
