//! The server coordinator: accepts exchanges from the endpoint, reassembles
//! block-wise uploads, runs the application handler, and answers with a
//! piggybacked ack when the handler is fast or an empty ack plus a separate
//! confirmable when it is not.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use lru_time_cache::LruCache;
use tokio::sync::mpsc;

use crate::block::{BlockValue, Multipart, Reassembly};
use crate::endpoint::{Endpoint, ExchangeHandle, RrEvent};
use crate::error::TransferError;
use crate::exchange::{Command, TransmissionParameters};
use crate::message::header::{MessageClass, MessageType};
use crate::message::packet::Packet;
use crate::request::{CoapRequest, CoapResponse, Status};
use crate::socket::UdpFactory;
use crate::trace::{self, ExchangeScope, TransferEvent};

/// Server-side block-wise state outlives single exchanges for this long.
const BLOCK_STATE_EXPIRY: Duration = Duration::from_secs(120);

/// Largest response payload served without block2 slicing.
const DEFAULT_BLOCK2_SIZE: usize = 512;

/// The application side of a server: one call per complete request.
///
/// Returning `None` suppresses the reply (a confirmable request still gets
/// its empty ack so the peer stops retransmitting).
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: CoapRequest) -> Option<CoapResponse>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(CoapRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<CoapResponse>> + Send + 'static,
{
    async fn handle(&self, request: CoapRequest) -> Option<CoapResponse> {
        (self)(request).await
    }
}

/// Keys the cross-exchange block cache the way requests repeat: same peer,
/// same path, same method.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ServeKey {
    method_ord: u8,
    path: String,
    requester: SocketAddr,
}

impl ServeKey {
    fn of(request: &CoapRequest) -> ServeKey {
        ServeKey {
            method_ord: u8::from(request.message.header.code),
            path: request.get_path(),
            requester: request.source.unwrap_or(([0, 0, 0, 0], 0).into()),
        }
    }
}

#[derive(Default)]
struct ServeState {
    /// Upload being accumulated from a series of block1 requests.
    reassembly: Reassembly,
    /// Response being served out as block2 slices.
    cached_response: Option<Packet>,
}

type ServeStates = Arc<Mutex<LruCache<ServeKey, ServeState>>>;

/// A CoAP server bound to one UDP address.
pub struct Server {
    endpoint: Endpoint,
    accepted: mpsc::Receiver<ExchangeHandle>,
    params: TransmissionParameters,
}

impl Server {
    pub async fn new<A: tokio::net::ToSocketAddrs>(addr: A) -> io::Result<Server> {
        Server::with_parameters(addr, TransmissionParameters::default()).await
    }

    pub async fn with_parameters<A: tokio::net::ToSocketAddrs>(
        addr: A,
        params: TransmissionParameters,
    ) -> io::Result<Server> {
        let addr = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no address"))?;
        let factory = Arc::new(UdpFactory::bind(addr));
        let (endpoint, accepted) = Endpoint::server(factory, params.clone()).await?;
        Ok(Server {
            endpoint,
            accepted,
            params,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Serve until the endpoint dies. Each exchange gets its own task, so a
    /// slow handler only stalls its own peer.
    pub async fn run<H: Handler>(mut self, handler: H) -> io::Result<()> {
        let handler = Arc::new(handler);
        let states: ServeStates = Arc::new(Mutex::new(LruCache::with_expiry_duration(
            BLOCK_STATE_EXPIRY,
        )));

        while let Some(exchange) = self.accepted.recv().await {
            tokio::spawn(serve_exchange(
                exchange,
                handler.clone(),
                self.params.clone(),
                states.clone(),
            ));
        }
        Ok(())
    }
}

/// Drain one exchange: requests come in here in arrival order, interleaved
/// with the acks for any separate responses we sent.
async fn serve_exchange(
    mut exchange: ExchangeHandle,
    handler: Arc<dyn Handler>,
    params: TransmissionParameters,
    states: ServeStates,
) {
    while let Some(event) = exchange.events.recv().await {
        match event {
            RrEvent::Rx(message, from) => {
                if !message.header.code.is_request() {
                    debug!(
                        "server: non-request {:?} from {} ignored",
                        message.header.code, from
                    );
                    continue;
                }
                if let Err(error) =
                    serve_request(&mut exchange, message, from, &handler, &params, &states).await
                {
                    warn!("server: request from {} failed: {}", from, error);
                    break;
                }
            }
            RrEvent::Fail(message_id, reason) => {
                warn!(
                    "server: separate response mid {} failed: {:?}",
                    message_id, reason
                );
                break;
            }
            RrEvent::Socket(kind) => {
                warn!("server: socket failed under exchange: {:?}", kind);
                break;
            }
        }
    }
}

async fn serve_request(
    exchange: &mut ExchangeHandle,
    mut message: Packet,
    from: SocketAddr,
    handler: &Arc<dyn Handler>,
    params: &TransmissionParameters,
    states: &ServeStates,
) -> Result<(), TransferError> {
    let confirmable = message.header.message_type == MessageType::Confirmable;
    let request_mid = message.header.message_id;
    let mut scope = ExchangeScope::new(from, message.get_token().to_vec());
    scope.message_id = request_mid;

    let view = Multipart::of(&message)?;
    let probe = CoapRequest::from_packet(message.clone(), &from);
    let key = ServeKey::of(&probe);

    // Block1 upload: bank the segment and ask for the next one.
    if let Some(desc) = &view.description {
        trace::emit(
            &scope,
            TransferEvent::BlockReceived {
                size: message.payload.len(),
                block_number: desc.num,
                more: desc.more,
            },
        );
        if desc.more {
            {
                let mut states = states.lock().unwrap();
                let state = states.entry(key).or_insert(ServeState::default());
                state.reassembly.insert(desc, &message.payload)?;
            }
            let mut interim = Packet::new();
            if !confirmable {
                interim.header.message_type = MessageType::NonConfirmable;
            }
            interim.header.code = MessageClass::Response(Status::Continue);
            interim.set_token(message.get_token().to_vec());
            Multipart {
                description: None,
                control: Some(desc.clone()),
            }
            .apply(&mut interim);
            respond(exchange, confirmable, request_mid, interim).await?;
            return Ok(());
        }
        // Final block: fold the accumulated payload back into the request.
        let assembled = {
            let mut states = states.lock().unwrap();
            match states.get_mut(&key) {
                Some(state) if !state.reassembly.is_empty() => {
                    Some(state.reassembly.flush(desc, &message.payload)?)
                }
                _ => None,
            }
        };
        if let Some(assembled) = assembled {
            message.payload = assembled;
        }
    }

    // Block2 follow-up: serve the requested slice of the cached response.
    if let Some(ctrl) = &view.control {
        if ctrl.num > 0 {
            let cached = {
                let mut states = states.lock().unwrap();
                states
                    .get_mut(&key)
                    .and_then(|state| state.cached_response.clone())
            };
            if let Some(full) = cached {
                let reply = slice_response(&full, ctrl, request_mid, &mut scope);
                respond(exchange, confirmable, request_mid, reply).await?;
                return Ok(());
            }
            debug!("server: block2 follow-up with no cached response");
        }
    }

    // Run the handler, racing the piggyback window for confirmables.
    let request = CoapRequest::from_packet(message.clone(), &from);
    let handler = handler.clone();
    let mut work = tokio::spawn(async move { handler.handle(request).await });

    let (outcome, piggybacked) = if confirmable {
        match tokio::time::timeout(params.processing_delay, &mut work).await {
            Ok(joined) => (joined, true),
            Err(_) => {
                // The application is slow; free the peer's retransmit timer
                // now and promise a separate response.
                debug!("server: processing delay hit, acking mid {} empty", request_mid);
                exchange
                    .command(Command::Accept(Packet::empty_ack(request_mid)))
                    .await?;
                (work.await, false)
            }
        }
    } else {
        (work.await, false)
    };

    let response = match outcome {
        Ok(response) => response,
        Err(join_error) => {
            warn!("server: handler panicked: {}", join_error);
            let mut failed = CoapResponse::new(&message).expect("request messages have replies");
            failed.set_status(Status::InternalServerError);
            Some(failed)
        }
    };

    let Some(mut response) = response else {
        // Nothing to say; a confirmable peer still deserves its ack.
        if confirmable && piggybacked {
            exchange
                .command(Command::Accept(Packet::empty_ack(request_mid)))
                .await?;
        }
        return Ok(());
    };
    scope.tag = response.tag.clone();

    // Oversized responses get cached whole and served as block2 slices. The
    // client may have named its preferred size up front.
    let block2_size = view
        .control
        .as_ref()
        .map(|ctrl| ctrl.size())
        .unwrap_or(DEFAULT_BLOCK2_SIZE)
        .min(DEFAULT_BLOCK2_SIZE);
    if response.message.payload.len() > block2_size {
        let full = response.message.clone();
        {
            let mut states = states.lock().unwrap();
            let state = states.entry(key).or_insert(ServeState::default());
            state.cached_response = Some(full.clone());
        }
        let first = BlockValue::new(0, true, block2_size)
            .expect("block2 sizes are bounded by the descriptor range");
        let reply = slice_response(&full, &first, request_mid, &mut scope);
        respond(exchange, confirmable && piggybacked, request_mid, reply).await?;
        return Ok(());
    }

    if confirmable && piggybacked {
        respond(exchange, true, request_mid, response.message).await?;
    } else {
        respond(exchange, false, request_mid, response.message).await?;
    }
    Ok(())
}

/// Cut one block2 slice out of a cached response.
fn slice_response(
    full: &Packet,
    wanted: &BlockValue,
    request_mid: u16,
    scope: &mut ExchangeScope,
) -> Packet {
    let size = wanted.size();
    let start = (wanted.num as usize * size).min(full.payload.len());
    let end = (start + size).min(full.payload.len());
    let more = end < full.payload.len();

    let mut reply = full.clone();
    reply.header.message_id = request_mid;
    reply.payload = full.payload[start..end].to_vec();
    Multipart {
        description: Some(BlockValue {
            num: wanted.num,
            more,
            size_exponent: wanted.size_exponent,
        }),
        control: None,
    }
    .apply(&mut reply);

    trace::emit(
        scope,
        TransferEvent::BlockSent {
            size: reply.payload.len(),
            block_number: wanted.num,
            more,
        },
    );
    reply
}

/// Send a reply: as the piggybacked ack when the window is still open, as a
/// fresh confirmable (separate response) or non-confirmable otherwise.
async fn respond(
    exchange: &mut ExchangeHandle,
    piggyback: bool,
    request_mid: u16,
    mut reply: Packet,
) -> Result<(), TransferError> {
    if piggyback {
        reply.header.message_type = MessageType::Acknowledgement;
        reply.header.message_id = request_mid;
        exchange.command(Command::Accept(reply)).await
    } else if reply.header.message_type == MessageType::NonConfirmable {
        reply.header.message_id = exchange.message_ids.next_id();
        exchange.command(Command::UnreliableSend(reply)).await
    } else {
        reply.header.message_type = MessageType::Confirmable;
        reply.header.message_id = exchange.message_ids.next_id();
        exchange.command(Command::ReliableSend(reply)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::CoAPClient;
    use crate::message::option::CoapOption;
    use crate::request::Method;

    async fn echo_handler(request: CoapRequest) -> Option<CoapResponse> {
        let path = request.get_path();
        let mut response = request.response?;
        response.message.payload = path.into_bytes();
        Some(response)
    }

    async fn spawn_server<H: Handler>(handler: H) -> SocketAddr {
        let server = Server::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(handler));
        addr
    }

    #[tokio::test]
    async fn test_echo_server() {
        let addr = spawn_server(echo_handler).await;
        let reply = CoAPClient::get(&format!("coap://{}/test-echo", addr))
            .await
            .unwrap();
        assert_eq!(reply.payload, b"test-echo".to_vec());
        assert_eq!(reply.header.message_type, MessageType::Acknowledgement);
    }

    #[tokio::test]
    async fn test_echo_server_no_token_path() {
        let addr = spawn_server(echo_handler).await;
        let client = CoAPClient::new(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        let reply = client
            .request_path("/echo/sub", Method::Get, None, None, None)
            .await
            .unwrap();
        assert_eq!(reply.payload, b"echo/sub".to_vec());
    }

    #[tokio::test]
    async fn test_handler_sees_query_options() {
        async fn query_handler(request: CoapRequest) -> Option<CoapResponse> {
            let query = request
                .message
                .get_first_option(CoapOption::UriQuery)
                .cloned()
                .unwrap_or_default();
            let mut response = request.response?;
            response.message.payload = query;
            Some(response)
        }

        let addr = spawn_server(query_handler).await;
        let reply = CoAPClient::get(&format!("coap://{}/q?who=world", addr))
            .await
            .unwrap();
        assert_eq!(reply.payload, b"who=world".to_vec());
    }

    #[tokio::test]
    async fn test_none_reply_still_acks() {
        async fn silent_handler(_request: CoapRequest) -> Option<CoapResponse> {
            None
        }

        let addr = spawn_server(silent_handler).await;
        let error = CoAPClient::get_with_timeout(
            &format!("coap://{}/quiet", addr),
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();
        // The empty ack arrives but no response ever does.
        assert!(matches!(error, TransferError::Timeout));
    }

    #[tokio::test]
    async fn test_handler_panic_maps_to_server_error() {
        async fn broken_handler(_request: CoapRequest) -> Option<CoapResponse> {
            panic!("handler exploded");
        }

        let addr = spawn_server(broken_handler).await;
        let reply = CoAPClient::get(&format!("coap://{}/boom", addr))
            .await
            .unwrap();
        assert_eq!(
            reply.header.code,
            MessageClass::Response(Status::InternalServerError)
        );
    }
}
