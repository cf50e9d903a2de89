//! Structured transfer events, emitted through the `log` facade.

use std::net::SocketAddr;

use log::debug;

/// Identity attached to every transfer event.
#[derive(Debug, Clone)]
pub struct ExchangeScope {
    pub peer: SocketAddr,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub tag: Option<String>,
}

impl ExchangeScope {
    pub fn new(peer: SocketAddr, token: Vec<u8>) -> ExchangeScope {
        ExchangeScope {
            peer,
            message_id: 0,
            token,
            tag: None,
        }
    }

    fn token_hex(&self) -> String {
        self.token.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// The lifecycle and data-movement points an exchange reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    ConnectionStarted,
    ConnectionEnded,
    DataSent { size: usize },
    DataReceived { size: usize },
    BlockSent { size: usize, block_number: u32, more: bool },
    BlockReceived { size: usize, block_number: u32, more: bool },
    Retried { size: usize, remaining_retries: u32 },
    TimedOut,
}

pub fn emit(scope: &ExchangeScope, event: TransferEvent) {
    let detail = match event {
        TransferEvent::ConnectionStarted => "connection_started".to_string(),
        TransferEvent::ConnectionEnded => "connection_ended".to_string(),
        TransferEvent::DataSent { size } => format!("data_sent size={}", size),
        TransferEvent::DataReceived { size } => format!("data_received size={}", size),
        TransferEvent::BlockSent {
            size,
            block_number,
            more,
        } => format!(
            "block_sent size={} block_number={} more={}",
            size, block_number, more
        ),
        TransferEvent::BlockReceived {
            size,
            block_number,
            more,
        } => format!(
            "block_received size={} block_number={} more={}",
            size, block_number, more
        ),
        TransferEvent::Retried {
            size,
            remaining_retries,
        } => format!("re_tried size={} remaining_retries={}", size, remaining_retries),
        TransferEvent::TimedOut => "timed_out".to_string(),
    };
    debug!(
        "{} host={} port={} message_id={} token={} tag={}",
        detail,
        scope.peer.ip(),
        scope.peer.port(),
        scope.message_id,
        scope.token_hex(),
        scope.tag.as_deref().unwrap_or("-"),
    );
}
