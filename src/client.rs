//! The user-facing client: builds requests, drives exchanges, and unwraps
//! piggybacked, separate and block-wise responses.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::debug;
use rand::Rng;
use regex::Regex;
use url::Url;

use crate::block::{BlockValue, Multipart, Reassembly, Segmenter};
use crate::endpoint::{Endpoint, ExchangeHandle, RrEvent};
use crate::error::TransferError;
use crate::exchange::{Command, FailReason, TransmissionParameters};
use crate::message::header::{MessageClass, MessageType, ResponseType};
use crate::message::option::{CoapOption, OptionValueU16};
use crate::message::packet::Packet;
use crate::request::{CoapRequest, Method};
use crate::socket::{AdapterFactory, UdpFactory};
use crate::trace::{self, ExchangeScope, TransferEvent};

/// Per-request knobs. The defaults follow RFC 7252 §4.8 plus a 5 second
/// response wait and 512 byte block1 segments.
#[derive(Clone)]
pub struct RequestOptions {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    /// `con` when true, `non` otherwise.
    pub confirmable: bool,
    /// Overall wait for the response at this layer. Expiry does not cancel
    /// the message layer; an unanswered confirmable keeps retrying and the
    /// exchange winds itself down.
    pub timeout: Duration,
    /// Forces the uri-host option; a hostname parsed from the URL is used
    /// when absent (never a literal IP).
    pub uri_host: Option<String>,
    /// Forces the uri-port option and the port actually addressed.
    pub uri_port: Option<u16>,
    /// Largest payload sent without block-wise segmentation.
    pub block1_size: usize,
    /// Replacement transport; `coap://` URLs default to plain UDP. Any
    /// adapter-specific configuration travels inside the factory.
    pub socket_adapter: Option<Arc<dyn AdapterFactory>>,
}

impl Default for RequestOptions {
    fn default() -> RequestOptions {
        RequestOptions {
            ack_timeout: Duration::from_millis(2000),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            confirmable: true,
            timeout: Duration::from_millis(5000),
            uri_host: None,
            uri_port: None,
            block1_size: 512,
            socket_adapter: None,
        }
    }
}

impl RequestOptions {
    fn transmission_parameters(&self) -> TransmissionParameters {
        TransmissionParameters {
            ack_timeout: self.ack_timeout,
            ack_random_factor: self.ack_random_factor,
            max_retransmit: self.max_retransmit,
            ..TransmissionParameters::default()
        }
    }
}

struct UrlTarget {
    host: String,
    is_literal: bool,
    port: u16,
    path: String,
    queries: Option<String>,
}

/// A client endpoint bound for one peer.
pub struct CoAPClient {
    endpoint: Endpoint,
    peer: SocketAddr,
    options: RequestOptions,
}

impl CoAPClient {
    /// Resolve `host` once and bind an ephemeral socket of the matching
    /// address family.
    pub async fn new(host: &str, port: u16) -> Result<CoAPClient, TransferError> {
        CoAPClient::with_options(host, port, RequestOptions::default()).await
    }

    pub async fn with_options(
        host: &str,
        port: u16,
        options: RequestOptions,
    ) -> Result<CoAPClient, TransferError> {
        let peer = tokio::net::lookup_host((host, port))
            .await
            .map_err(TransferError::Socket)?
            .next()
            .ok_or(TransferError::InvalidUrl("host resolved to no addresses"))?;

        let factory: Arc<dyn AdapterFactory> = match &options.socket_adapter {
            Some(factory) => factory.clone(),
            None => Arc::new(UdpFactory::client_for(peer)),
        };
        let endpoint = Endpoint::client(factory, options.transmission_parameters())
            .await
            .map_err(TransferError::Socket)?;

        Ok(CoAPClient {
            endpoint,
            peer,
            options,
        })
    }

    /// Execute a single get request with a coap url.
    pub async fn get(url: &str) -> Result<Packet, TransferError> {
        Self::request(url, Method::Get, None).await
    }

    /// Execute a single get request with a coap url and a specific timeout.
    pub async fn get_with_timeout(url: &str, timeout: Duration) -> Result<Packet, TransferError> {
        let options = RequestOptions {
            timeout,
            ..RequestOptions::default()
        };
        Self::request_with_options(url, Method::Get, None, options).await
    }

    /// Execute a single post request with a coap url.
    pub async fn post(url: &str, data: Vec<u8>) -> Result<Packet, TransferError> {
        Self::request(url, Method::Post, Some(data)).await
    }

    pub async fn post_with_timeout(
        url: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Packet, TransferError> {
        let options = RequestOptions {
            timeout,
            ..RequestOptions::default()
        };
        Self::request_with_options(url, Method::Post, Some(data), options).await
    }

    /// Execute a single put request with a coap url.
    pub async fn put(url: &str, data: Vec<u8>) -> Result<Packet, TransferError> {
        Self::request(url, Method::Put, Some(data)).await
    }

    pub async fn put_with_timeout(
        url: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Packet, TransferError> {
        let options = RequestOptions {
            timeout,
            ..RequestOptions::default()
        };
        Self::request_with_options(url, Method::Put, Some(data), options).await
    }

    /// Execute a single delete request with a coap url.
    pub async fn delete(url: &str) -> Result<Packet, TransferError> {
        Self::request(url, Method::Delete, None).await
    }

    pub async fn delete_with_timeout(url: &str, timeout: Duration) -> Result<Packet, TransferError> {
        let options = RequestOptions {
            timeout,
            ..RequestOptions::default()
        };
        Self::request_with_options(url, Method::Delete, None, options).await
    }

    /// Execute a single request (GET, POST, PUT, DELETE) against a coap url.
    pub async fn request(
        url: &str,
        method: Method,
        data: Option<Vec<u8>>,
    ) -> Result<Packet, TransferError> {
        Self::request_with_options(url, method, data, RequestOptions::default()).await
    }

    /// As [`request`](Self::request), with explicit options. The client
    /// endpoint lives for just this operation.
    pub async fn request_with_options(
        url: &str,
        method: Method,
        data: Option<Vec<u8>>,
        options: RequestOptions,
    ) -> Result<Packet, TransferError> {
        let target = Self::parse_coap_url(url, options.socket_adapter.is_some())?;
        let port = options.uri_port.unwrap_or(target.port);
        let client = CoAPClient::with_options(&target.host, port, options).await?;
        let domain = match client.options.uri_host.clone() {
            Some(host) => Some(host),
            None if !target.is_literal => Some(target.host.clone()),
            None => None,
        };
        client
            .request_path(&target.path, method, data, target.queries.clone(), domain)
            .await
    }

    /// Execute a request against this client's peer.
    pub async fn request_path(
        &self,
        path: &str,
        method: Method,
        data: Option<Vec<u8>>,
        queries: Option<String>,
        domain: Option<String>,
    ) -> Result<Packet, TransferError> {
        if method == Method::UnKnown {
            return Err(TransferError::InvalidMethod);
        }
        let mut request = CoapRequest::new();
        request.set_method(method);
        request.set_path(path);
        if let Some(queries) = queries {
            request
                .message
                .add_option(CoapOption::UriQuery, queries.into_bytes());
        }
        if let Some(domain) = domain {
            request
                .message
                .add_option(CoapOption::UriHost, domain.into_bytes());
        }
        if let Some(port) = self.options.uri_port {
            request
                .message
                .add_option_as(CoapOption::UriPort, OptionValueU16(port));
        }
        request.message.header.message_type = if self.options.confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        };
        if let Some(data) = data {
            request.message.payload = data;
        }

        self.perform(request.message).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Set the largest payload sent without block-wise segmentation.
    pub fn set_block1_size(&mut self, block1_size: usize) {
        self.options.block1_size = block1_size;
    }

    pub async fn set_broadcast(&self, on: bool) -> Result<(), TransferError> {
        self.endpoint.set_broadcast(on).await.map_err(TransferError::Socket)
    }

    /// Send a non-confirmable request to all CoAP devices.
    /// - IPv4 AllCoAP multicast address is '224.0.1.187'
    /// - IPv6 AllCoAp multicast addresses are 'ff0?::fd'
    /// Parameter segment is used with IPv6 to determine the first octet.
    /// It's value can be between 0x0 and 0xf. To address multiple segments,
    /// you have to call send_all_coap for each of the segments.
    pub async fn send_all_coap(
        &self,
        request: &CoapRequest,
        segment: u8,
    ) -> Result<(), TransferError> {
        assert!(segment <= 0xf);
        let addr = match self.peer {
            SocketAddr::V4(val) => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(224, 0, 1, 187)), val.port())
            }
            SocketAddr::V6(val) => SocketAddr::new(
                IpAddr::V6(Ipv6Addr::new(
                    0xff00 + segment as u16,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0xfd,
                )),
                val.port(),
            ),
        };
        self.endpoint.send_raw(request.message.clone(), addr).await
    }

    /// One full request/response round, block-wise transfers included.
    async fn perform(&self, mut request: Packet) -> Result<Packet, TransferError> {
        let token: Vec<u8> = rand::thread_rng().gen::<[u8; 4]>().to_vec();
        request.set_token(token.clone());

        let mut exchange = self
            .endpoint
            .open_exchange(
                &self.peer.ip().to_string(),
                self.peer.port(),
                token.clone(),
                self.options.transmission_parameters(),
            )
            .await?;
        let deadline = Instant::now() + self.options.timeout;

        let result = self
            .drive_transfer(&mut exchange, request, deadline)
            .await;
        match &result {
            // The message layer was not cancelled; it winds down on its own.
            Err(TransferError::Timeout) => {}
            _ => exchange.close().await,
        }
        result
    }

    async fn drive_transfer(
        &self,
        exchange: &mut ExchangeHandle,
        mut request: Packet,
        deadline: Instant,
    ) -> Result<Packet, TransferError> {
        let mut scope = ExchangeScope::new(exchange.peer, exchange.token.clone());

        // Outbound segmentation kicks in above the block1 threshold.
        let mut segmenter = if request.payload.len() > self.options.block1_size {
            Some(Segmenter::new(
                Bytes::from(mem::take(&mut request.payload)),
                self.options.block1_size,
            )?)
        } else {
            None
        };
        let mut block_num: u32 = 0;
        let mut control: Option<BlockValue> = None;
        let mut reassembly = Reassembly::new();

        loop {
            let mut outgoing = request.clone();
            outgoing.header.message_id = exchange.message_ids.next_id();
            scope.message_id = outgoing.header.message_id;

            let mut sent_block = None;
            if let Some(segmenter) = &segmenter {
                let (bytes, block) = segmenter.segment(block_num);
                trace::emit(
                    &scope,
                    TransferEvent::BlockSent {
                        size: bytes.len(),
                        block_number: block.num,
                        more: block.more,
                    },
                );
                outgoing.payload = bytes.to_vec();
                sent_block = Some(block);
            }
            if sent_block.is_some() || control.is_some() {
                let mut view = Multipart::of(&outgoing)?;
                view.description = sent_block.clone();
                view.control = control.take();
                view.apply(&mut outgoing);
            }
            // Surface encode problems before the message layer caches the
            // message for retransmission.
            outgoing.to_bytes()?;

            let message_id = outgoing.header.message_id;
            if outgoing.header.message_type == MessageType::Confirmable {
                exchange.command(Command::ReliableSend(outgoing)).await?;
            } else {
                exchange.command(Command::UnreliableSend(outgoing)).await?;
            }

            let reply = Self::await_reply(exchange, message_id, &request, deadline).await?;
            let view = Multipart::of(&reply)?;

            // Upload in progress: move to the next segment while the peer
            // keeps saying continue.
            let mut upload_done = false;
            if let Some(active) = &mut segmenter {
                let (_, current) = active.segment(block_num);
                if current.more {
                    if reply.header.code != MessageClass::Response(ResponseType::Continue) {
                        // The peer cut the transfer short; its say is final.
                        return Ok(reply);
                    }
                    let mut next = block_num + 1;
                    if let Some(ctrl) = &view.control {
                        if ctrl.size() < active.size() {
                            debug!("client: peer lowered block1 size to {}", ctrl.size());
                            next = active.resize(next, ctrl.size())?;
                        }
                    }
                    block_num = next;
                    continue;
                }
                // Final segment answered; from here any block work is the
                // response's.
                upload_done = true;
            }
            if upload_done {
                segmenter = None;
            }

            // Download in progress: collect segments until the description
            // clears its more flag.
            if let Some(desc) = &view.description {
                trace::emit(
                    &scope,
                    TransferEvent::BlockReceived {
                        size: reply.payload.len(),
                        block_number: desc.num,
                        more: desc.more,
                    },
                );
                if desc.more {
                    reassembly.insert(desc, &reply.payload)?;
                    control = Some(BlockValue {
                        num: desc.num + 1,
                        more: false,
                        size_exponent: desc.size_exponent,
                    });
                    request.payload.clear();
                    block_num = 0;
                    continue;
                }
                if !reassembly.is_empty() {
                    let assembled = reassembly.flush(desc, &reply.payload)?;
                    let mut complete = reply;
                    complete.payload = assembled;
                    return Ok(complete);
                }
            }
            return Ok(reply);
        }
    }

    /// The response wait: first for the ack (piggybacked or empty), then,
    /// after an empty ack, for the separate reply correlated by token.
    async fn await_reply(
        exchange: &mut ExchangeHandle,
        message_id: u16,
        request: &Packet,
        deadline: Instant,
    ) -> Result<Packet, TransferError> {
        let token = request.get_token().to_vec();
        let mut separate = false;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(TransferError::Timeout)?;
            let event = tokio::time::timeout(remaining, exchange.events.recv())
                .await
                .map_err(|_| TransferError::Timeout)?
                .ok_or(TransferError::ExchangeClosed)?;

            match event {
                RrEvent::Fail(_, FailReason::Reset) => return Err(TransferError::Reset),
                RrEvent::Fail(_, FailReason::Timeout) => return Err(TransferError::Timeout),
                RrEvent::Socket(kind) => return Err(TransferError::Socket(kind.into())),
                RrEvent::Rx(message, _from) => match message.header.message_type {
                    MessageType::Acknowledgement
                        if !separate && message.header.message_id == message_id =>
                    {
                        if message.is_empty_code() {
                            // Separate-response mode; the real answer comes
                            // later as a fresh confirmable.
                            separate = true;
                            continue;
                        }
                        if message.get_token() == token {
                            return Ok(message);
                        }
                        debug!("client: ack with foreign token dropped");
                    }
                    MessageType::NonConfirmable if message.get_token() == token => {
                        return Ok(message);
                    }
                    MessageType::Confirmable if message.get_token() == token => {
                        let ack = Packet::empty_ack(message.header.message_id);
                        exchange.command(Command::Accept(ack)).await?;
                        return Ok(message);
                    }
                    _ => {
                        debug!(
                            "client: reply {:?} mid {} does not match this request, dropped",
                            message.header.message_type, message.header.message_id
                        );
                    }
                },
            }
        }
    }

    fn parse_coap_url(url: &str, has_adapter: bool) -> Result<UrlTarget, TransferError> {
        let parsed = Url::parse(url).map_err(|_| TransferError::InvalidUrl("not a url"))?;

        match parsed.scheme() {
            "coap" => {}
            // Secured transports ride a caller-supplied adapter; this crate
            // only moves their datagrams.
            "coaps" if has_adapter => {}
            scheme => return Err(TransferError::UnsupportedScheme(scheme.to_string())),
        }

        let host = match parsed.host_str() {
            Some("") | None => return Err(TransferError::InvalidUrl("missing host")),
            Some(host) => host,
        };
        let host = Regex::new(r"^\[(.*?)]$")
            .unwrap()
            .replace(host, "$1")
            .to_string();
        let is_literal = host.parse::<std::net::IpAddr>().is_ok();

        let port = parsed.port().unwrap_or(5683);
        let path = parsed.path().to_string();
        let queries = parsed.query().map(|q| q.to_string());

        Ok(UrlTarget {
            host,
            is_literal,
            port,
            path,
            queries,
        })
    }
}
