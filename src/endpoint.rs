//! The endpoint multiplexer: one socket, one table of live exchanges.
//!
//! Inbound datagrams are decoded once here and routed to the exchange task
//! owning `(peer ip, peer port, token)`; outbound messages from any exchange
//! are encoded here and written to the adapter. Exchanges announce their own
//! exit, and the table entry dies with them.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant as TokioInstant};

use crate::error::TransferError;
use crate::exchange::{
    Command, Event, Exchange, FailReason, Input, MessageIdGenerator, TransmissionParameters,
};
use crate::message::header::MessageType;
use crate::message::packet::Packet;
use crate::socket::{self, AdapterCmd, AdapterEvent, AdapterFactory, AdapterHandle};
use crate::trace::{self, ExchangeScope, TransferEvent};

/// An exchange with no traffic for this long tears itself down.
pub const EXCHANGE_LIFETIME: Duration = Duration::from_secs(300);

const CHANNEL_CAPACITY: usize = 32;

/// Whether unknown peers may open exchanges here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointRole {
    Server,
    Client,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct ExchangeKey {
    ip: IpAddr,
    port: u16,
    token: Vec<u8>,
}

impl ExchangeKey {
    fn new(peer: SocketAddr, token: &[u8]) -> ExchangeKey {
        ExchangeKey {
            ip: peer.ip(),
            port: peer.port(),
            token: token.to_vec(),
        }
    }
}

/// Mailbox messages consumed by an exchange task.
#[derive(Debug)]
pub(crate) enum ExchangeMsg {
    Command(Command),
    Recv(Packet),
    /// The endpoint lost its socket and could not replace it.
    SocketGone(io::ErrorKind),
    Close,
}

/// What an exchange reports up to the coordinator driving it.
#[derive(Debug)]
pub(crate) enum RrEvent {
    Rx(Packet, SocketAddr),
    Fail(u16, FailReason),
    Socket(io::ErrorKind),
}

/// The coordinator's grip on one exchange: its mailbox, its event stream,
/// and the message-id counter seeded at creation.
pub(crate) struct ExchangeHandle {
    pub peer: SocketAddr,
    pub token: Vec<u8>,
    pub cmd: mpsc::Sender<ExchangeMsg>,
    pub events: mpsc::Receiver<RrEvent>,
    pub message_ids: MessageIdGenerator,
}

impl ExchangeHandle {
    pub async fn command(&self, command: Command) -> Result<(), TransferError> {
        self.cmd
            .send(ExchangeMsg::Command(command))
            .await
            .map_err(|_| TransferError::ExchangeClosed)
    }

    pub async fn close(self) {
        let _ = self.cmd.send(ExchangeMsg::Close).await;
    }
}

enum EndpointCmd {
    OpenExchange {
        host: String,
        port: u16,
        token: Vec<u8>,
        params: TransmissionParameters,
        reply: oneshot::Sender<Result<ExchangeHandle, TransferError>>,
    },
    SendRaw(Packet, SocketAddr, oneshot::Sender<Result<(), TransferError>>),
    SetBroadcast(bool, oneshot::Sender<io::Result<()>>),
}

/// Handle to a running endpoint task.
#[derive(Clone)]
pub(crate) struct Endpoint {
    cmd: mpsc::Sender<EndpointCmd>,
    local_addr: SocketAddr,
}

impl Endpoint {
    /// A client endpoint: exchanges are opened here before any datagram for
    /// them can arrive, and unknown traffic is dropped.
    pub async fn client(
        factory: Arc<dyn AdapterFactory>,
        params: TransmissionParameters,
    ) -> io::Result<Endpoint> {
        let (endpoint, _accepted) = Endpoint::start(EndpointRole::Client, factory, params).await?;
        Ok(endpoint)
    }

    /// A server endpoint: inbound requests from any peer create exchanges,
    /// which are handed out on the returned stream.
    pub async fn server(
        factory: Arc<dyn AdapterFactory>,
        params: TransmissionParameters,
    ) -> io::Result<(Endpoint, mpsc::Receiver<ExchangeHandle>)> {
        let (endpoint, accepted) = Endpoint::start(EndpointRole::Server, factory, params).await?;
        Ok((endpoint, accepted.expect("server endpoints accept")))
    }

    async fn start(
        role: EndpointRole,
        factory: Arc<dyn AdapterFactory>,
        params: TransmissionParameters,
    ) -> io::Result<(Endpoint, Option<mpsc::Receiver<ExchangeHandle>>)> {
        let adapter = factory.open().await?;
        let local_addr = adapter.local_addr()?;

        let (adapter_events_tx, adapter_events_rx) = mpsc::channel(64);
        let adapter = socket::spawn(adapter, adapter_events_tx);

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (reaper_tx, reaper_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (accept_tx, accept_rx) = match role {
            EndpointRole::Server => {
                let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                (Some(tx), Some(rx))
            }
            EndpointRole::Client => (None, None),
        };

        let task = EndpointTask {
            role,
            factory,
            params,
            adapter,
            adapter_events: adapter_events_rx,
            exchanges: HashMap::new(),
            outbound_tx,
            outbound_rx,
            reaper_tx,
            reaper_rx,
            accept_tx,
            cmd_rx,
        };
        tokio::spawn(task.run());

        Ok((
            Endpoint {
                cmd: cmd_tx,
                local_addr,
            },
            accept_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Create an exchange toward `host:port`, resolving the host once. The
    /// resolved address holds for the exchange's whole lifetime.
    pub async fn open_exchange(
        &self,
        host: &str,
        port: u16,
        token: Vec<u8>,
        params: TransmissionParameters,
    ) -> Result<ExchangeHandle, TransferError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd
            .send(EndpointCmd::OpenExchange {
                host: host.to_string(),
                port,
                token,
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransferError::ExchangeClosed)?;
        reply_rx.await.map_err(|_| TransferError::ExchangeClosed)?
    }

    /// One-shot datagram outside any exchange (multicast discovery).
    pub async fn send_raw(&self, packet: Packet, to: SocketAddr) -> Result<(), TransferError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd
            .send(EndpointCmd::SendRaw(packet, to, reply_tx))
            .await
            .map_err(|_| TransferError::ExchangeClosed)?;
        reply_rx.await.map_err(|_| TransferError::ExchangeClosed)?
    }

    pub async fn set_broadcast(&self, on: bool) -> io::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd
            .send(EndpointCmd::SetBroadcast(on, reply_tx))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "endpoint gone"))?;
        reply_rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "endpoint gone"))?
    }
}

struct Outbound {
    packet: Packet,
    peer: SocketAddr,
}

struct EndpointTask {
    role: EndpointRole,
    factory: Arc<dyn AdapterFactory>,
    params: TransmissionParameters,
    adapter: AdapterHandle,
    adapter_events: mpsc::Receiver<AdapterEvent>,
    exchanges: HashMap<ExchangeKey, mpsc::Sender<ExchangeMsg>>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
    reaper_tx: mpsc::Sender<ExchangeKey>,
    reaper_rx: mpsc::Receiver<ExchangeKey>,
    accept_tx: Option<mpsc::Sender<ExchangeHandle>>,
    cmd_rx: mpsc::Receiver<EndpointCmd>,
}

impl EndpointTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.adapter_events.recv() => match event {
                    Some(AdapterEvent::Recv(bytes, from)) => self.on_datagram(bytes, from).await,
                    Some(AdapterEvent::Exited(reason)) => {
                        if let Some(error) = &reason {
                            warn!("endpoint: socket adapter died: {}", error);
                        }
                        if !self.reopen().await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(out) = self.outbound_rx.recv() => self.on_outbound(out).await,
                Some(key) = self.reaper_rx.recv() => {
                    self.exchanges.remove(&key);
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_cmd(cmd).await,
                    // Every user handle is gone; the exchanges drain and the
                    // socket closes behind us.
                    None => break,
                },
            }
        }
        let _ = self.adapter.cmd.send(AdapterCmd::Close).await;
    }

    async fn on_datagram(&mut self, bytes: Vec<u8>, from: SocketAddr) {
        let packet = match Packet::from_bytes(&bytes) {
            Ok(packet) => packet,
            Err(error) => {
                warn!("endpoint: dropping malformed datagram from {}: {}", from, error);
                return;
            }
        };

        let mut scope = ExchangeScope::new(from, packet.get_token().to_vec());
        scope.message_id = packet.header.message_id;
        trace::emit(&scope, TransferEvent::DataReceived { size: bytes.len() });

        let key = ExchangeKey::new(from, packet.get_token());
        if let Some(tx) = self.exchanges.get(&key) {
            match tx.send(ExchangeMsg::Recv(packet)).await {
                Ok(()) => return,
                Err(error) => {
                    // Raced with the exchange's own teardown.
                    self.exchanges.remove(&key);
                    if let ExchangeMsg::Recv(packet) = error.0 {
                        self.on_unknown(packet, from, key).await;
                    }
                    return;
                }
            }
        }
        self.on_unknown(packet, from, key).await;
    }

    async fn on_unknown(&mut self, packet: Packet, from: SocketAddr, key: ExchangeKey) {
        match (self.role, packet.header.message_type) {
            (EndpointRole::Server, MessageType::Confirmable | MessageType::NonConfirmable) => {
                let handle = self.spawn_exchange(from, key, self.params.clone());
                let _ = handle.cmd.send(ExchangeMsg::Recv(packet)).await;
                if let Some(accept_tx) = &self.accept_tx {
                    if accept_tx.send(handle).await.is_err() {
                        debug!("endpoint: accept stream gone, exchange dropped");
                    }
                }
            }
            (EndpointRole::Server, _) => {
                debug!(
                    "endpoint: {:?} from {} matches no exchange, dropped",
                    packet.header.message_type, from
                );
            }
            (EndpointRole::Client, _) => {
                warn!(
                    "endpoint: datagram from {} for unknown token, dropped",
                    from
                );
            }
        }
    }

    fn spawn_exchange(
        &mut self,
        peer: SocketAddr,
        key: ExchangeKey,
        params: TransmissionParameters,
    ) -> ExchangeHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (rr_tx, rr_rx) = mpsc::channel(CHANNEL_CAPACITY);

        self.exchanges.insert(key.clone(), cmd_tx.clone());
        tokio::spawn(drive_exchange(
            key.clone(),
            peer,
            params,
            cmd_rx,
            self.outbound_tx.clone(),
            rr_tx,
            self.reaper_tx.clone(),
        ));

        ExchangeHandle {
            peer,
            token: key.token,
            cmd: cmd_tx,
            events: rr_rx,
            message_ids: MessageIdGenerator::new(&mut rand::thread_rng()),
        }
    }

    async fn on_outbound(&mut self, out: Outbound) {
        let bytes = match out.packet.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!("endpoint: unencodable outbound message: {}", error);
                return;
            }
        };
        let mut scope = ExchangeScope::new(out.peer, out.packet.get_token().to_vec());
        scope.message_id = out.packet.header.message_id;
        trace::emit(&scope, TransferEvent::DataSent { size: bytes.len() });
        let _ = self
            .adapter
            .cmd
            .send(AdapterCmd::Send(bytes, out.peer))
            .await;
    }

    async fn on_cmd(&mut self, cmd: EndpointCmd) {
        match cmd {
            EndpointCmd::OpenExchange {
                host,
                port,
                token,
                params,
                reply,
            } => {
                let _ = reply.send(self.open_exchange(host, port, token, params).await);
            }
            EndpointCmd::SendRaw(packet, to, reply) => {
                let result = match packet.to_bytes() {
                    Ok(bytes) => {
                        let _ = self.adapter.cmd.send(AdapterCmd::Send(bytes, to)).await;
                        Ok(())
                    }
                    Err(error) => Err(TransferError::Encode(error)),
                };
                let _ = reply.send(result);
            }
            EndpointCmd::SetBroadcast(on, reply) => {
                let (tx, rx) = oneshot::channel();
                if self
                    .adapter
                    .cmd
                    .send(AdapterCmd::SetBroadcast(on, tx))
                    .await
                    .is_err()
                {
                    let _ = reply.send(Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "socket adapter gone",
                    )));
                    return;
                }
                match rx.await {
                    Ok(result) => {
                        let _ = reply.send(result);
                    }
                    Err(_) => {
                        let _ = reply.send(Err(io::Error::new(
                            io::ErrorKind::NotConnected,
                            "socket adapter gone",
                        )));
                    }
                }
            }
        }
    }

    async fn open_exchange(
        &mut self,
        host: String,
        port: u16,
        token: Vec<u8>,
        params: TransmissionParameters,
    ) -> Result<ExchangeHandle, TransferError> {
        let mut resolved = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(TransferError::Socket)?;
        let peer = resolved
            .next()
            .ok_or(TransferError::InvalidUrl("host resolved to no addresses"))?;

        let key = ExchangeKey::new(peer, &token);
        Ok(self.spawn_exchange(peer, key, params))
    }

    /// Replace a dead adapter. On failure every live exchange is told the
    /// socket is gone and the endpoint winds down.
    async fn reopen(&mut self) -> bool {
        match self.factory.open().await {
            Ok(adapter) => {
                debug!("endpoint: socket adapter reopened");
                let (events_tx, events_rx) = mpsc::channel(64);
                self.adapter = socket::spawn(adapter, events_tx);
                self.adapter_events = events_rx;
                true
            }
            Err(error) => {
                warn!("endpoint: could not reopen socket adapter: {}", error);
                let kind = error.kind();
                for tx in self.exchanges.values() {
                    let _ = tx.send(ExchangeMsg::SocketGone(kind)).await;
                }
                false
            }
        }
    }
}

/// Drives one sans-io [`Exchange`] from a mailbox, a retransmit timer and an
/// idle timer, performing the events it emits.
async fn drive_exchange(
    key: ExchangeKey,
    peer: SocketAddr,
    params: TransmissionParameters,
    mut inbox: mpsc::Receiver<ExchangeMsg>,
    outbound: mpsc::Sender<Outbound>,
    rr: mpsc::Sender<RrEvent>,
    reaper: mpsc::Sender<ExchangeKey>,
) {
    let mut fsm = Exchange::new(params);
    let mut scope = ExchangeScope::new(peer, key.token.clone());
    trace::emit(&scope, TransferEvent::ConnectionStarted);

    'drive: loop {
        let retransmit_at = fsm.poll_timeout().map(TokioInstant::from_std);
        tokio::select! {
            msg = inbox.recv() => match msg {
                Some(ExchangeMsg::Command(command)) => {
                    fsm.handle(Instant::now(), Input::Command(command));
                }
                Some(ExchangeMsg::Recv(packet)) => {
                    fsm.handle(Instant::now(), Input::Recv(packet));
                }
                Some(ExchangeMsg::SocketGone(kind)) => {
                    let _ = rr.send(RrEvent::Socket(kind)).await;
                    break 'drive;
                }
                Some(ExchangeMsg::Close) | None => break 'drive,
            },
            _ = sleep_until(retransmit_at.unwrap_or_else(|| TokioInstant::now() + EXCHANGE_LIFETIME)),
                if retransmit_at.is_some() =>
            {
                fsm.handle_timeout(Instant::now());
            }
            _ = sleep(EXCHANGE_LIFETIME) => {
                debug!("exchange with {} idle for {:?}, closing", peer, EXCHANGE_LIFETIME);
                break 'drive;
            }
        }

        while let Some(event) = fsm.poll_event() {
            match event {
                Event::Transmit(packet) => {
                    scope.message_id = packet.header.message_id;
                    if outbound.send(Outbound { packet, peer }).await.is_err() {
                        break 'drive;
                    }
                }
                Event::Retransmit(packet, remaining_retries) => {
                    scope.message_id = packet.header.message_id;
                    let size = packet.payload.len();
                    trace::emit(
                        &scope,
                        TransferEvent::Retried {
                            size,
                            remaining_retries,
                        },
                    );
                    if outbound.send(Outbound { packet, peer }).await.is_err() {
                        break 'drive;
                    }
                }
                Event::Deliver(packet) => {
                    if rr.send(RrEvent::Rx(packet, peer)).await.is_err() {
                        break 'drive;
                    }
                }
                Event::Failed(message_id, reason) => {
                    scope.message_id = message_id;
                    if reason == FailReason::Timeout {
                        trace::emit(&scope, TransferEvent::TimedOut);
                    }
                    let _ = rr.send(RrEvent::Fail(message_id, reason)).await;
                    break 'drive;
                }
            }
        }
    }

    trace::emit(&scope, TransferEvent::ConnectionEnded);
    let _ = reaper.send(key).await;
}
