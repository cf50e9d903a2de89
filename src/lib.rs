//! Implementation of the [CoAP Protocol][spec] over UDP, client and server.
//!
//! The interesting part lives below the user API: every exchange runs a
//! small reliability state machine that retransmits confirmables with
//! jittered exponential backoff, answers inbound confirmables, and feeds a
//! request/response coordinator that understands piggybacked replies,
//! separate replies and block-wise transfers ([RFC 7959]).
//!
//! Features:
//! - CoAP core protocol [RFC 7252](https://tools.ietf.org/rfc/rfc7252.txt)
//! - Block-wise transfers [RFC 7959](https://tools.ietf.org/html/rfc7959)
//! - Pluggable datagram transports (plain UDP ships in the box)
//!
//! # Example
//!
//! ## Server:
//! ```no_run
//! use coap_peer::{CoapRequest, CoapResponse, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new("127.0.0.1:5683").await.unwrap();
//!     println!("Server up on {}", server.local_addr());
//!
//!     server
//!         .run(|request: CoapRequest| async move {
//!             let mut response = request.response?;
//!             response.message.payload = b"OK".to_vec();
//!             Some(response)
//!         })
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! ## Client:
//! ```no_run
//! use coap_peer::CoAPClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let url = "coap://127.0.0.1:5683/Rust";
//!     println!("Client request: {}", url);
//!
//!     let response = CoAPClient::get(url).await.unwrap();
//!     println!(
//!         "Server reply: {}",
//!         String::from_utf8(response.payload).unwrap()
//!     );
//! }
//! ```
//!
//! [spec]: https://tools.ietf.org/rfc/rfc7252.txt
//! [RFC 7959]: https://tools.ietf.org/html/rfc7959

pub mod block;
pub mod client;
mod endpoint;
pub mod error;
pub mod exchange;
pub mod message;
pub mod request;
pub mod server;
pub mod socket;
pub mod trace;

pub use crate::block::BlockValue;
pub use crate::client::{CoAPClient, RequestOptions};
pub use crate::error::{BlockError, EncodeError, ParseError, TransferError};
pub use crate::exchange::TransmissionParameters;
pub use crate::message::header::{MessageClass, MessageType};
pub use crate::message::option::{CoapOption, ContentFormat};
pub use crate::message::packet::Packet;
pub use crate::request::{CoapRequest, CoapResponse, Method, Status};
pub use crate::server::{Handler, Server};
pub use crate::socket::{AdapterFactory, SocketAdapter, UdpAdapter, UdpFactory};
