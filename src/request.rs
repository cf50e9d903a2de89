use std::net::SocketAddr;
use std::str;

use crate::message::header::{MessageClass, MessageType};
use crate::message::option::CoapOption;
use crate::message::packet::Packet;

pub use crate::message::header::RequestType as Method;
pub use crate::message::header::ResponseType as Status;

/// An inbound or outbound request plus the reply template derived from it.
#[derive(Debug)]
pub struct CoapRequest {
    pub message: Packet,
    pub response: Option<CoapResponse>,
    pub source: Option<SocketAddr>,
}

impl CoapRequest {
    pub fn new() -> CoapRequest {
        CoapRequest {
            response: None,
            message: Packet::new(),
            source: None,
        }
    }

    pub fn from_packet(packet: Packet, source: &SocketAddr) -> CoapRequest {
        CoapRequest {
            response: CoapResponse::new(&packet),
            message: packet,
            source: Some(*source),
        }
    }

    pub fn set_method(&mut self, method: Method) {
        self.message.header.code = MessageClass::Request(method);
    }

    pub fn get_method(&self) -> Method {
        match self.message.header.code {
            MessageClass::Request(method) => method,
            _ => Method::UnKnown,
        }
    }

    pub fn set_path(&mut self, path: &str) {
        self.message.clear_option(CoapOption::UriPath);
        for seg in path.split('/') {
            if seg.is_empty() {
                continue;
            }
            self.message
                .add_option(CoapOption::UriPath, seg.as_bytes().to_vec());
        }
    }

    pub fn get_path(&self) -> String {
        match self.message.get_option(CoapOption::UriPath) {
            Some(segments) => segments
                .iter()
                .filter_map(|seg| str::from_utf8(seg).ok())
                .collect::<Vec<_>>()
                .join("/"),
            None => String::new(),
        }
    }
}

impl Default for CoapRequest {
    fn default() -> CoapRequest {
        CoapRequest::new()
    }
}

/// A reply being built for one request.
#[derive(Debug, Clone)]
pub struct CoapResponse {
    pub message: Packet,
    /// Label attached to subsequent transfer events for this exchange.
    pub tag: Option<String>,
}

impl CoapResponse {
    /// Reply template for a request: an ack for a confirmable, a non for a
    /// non-confirmable. The message-id is echoed only on the ack (a separate
    /// reply gets a fresh one); the token is always echoed. Status defaults
    /// to 2.05 and the payload starts empty.
    pub fn new(request: &Packet) -> Option<CoapResponse> {
        let mut packet = Packet::new();

        match request.header.message_type {
            MessageType::Confirmable => {
                packet.header.message_type = MessageType::Acknowledgement;
                packet.header.message_id = request.header.message_id;
            }
            MessageType::NonConfirmable => {
                packet.header.message_type = MessageType::NonConfirmable;
            }
            _ => return None,
        };
        packet.header.code = MessageClass::Response(Status::Content);
        packet.set_token(request.get_token().to_vec());

        Some(CoapResponse {
            message: packet,
            tag: None,
        })
    }

    pub fn set_status(&mut self, status: Status) {
        self.message.header.code = MessageClass::Response(status);
    }

    pub fn get_status(&self) -> Status {
        match self.message.header.code {
            MessageClass::Response(status) => status,
            _ => Status::UnKnown,
        }
    }

    /// Tag the exchange for observability.
    pub fn tag(&mut self, tag: &str) {
        self.tag = Some(tag.to_string());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_method_codes() {
        let mut request = CoapRequest::new();

        request.message.header.set_code("0.01");
        assert_eq!(Method::Get, request.get_method());

        request.message.header.set_code("0.03");
        assert_eq!(Method::Put, request.get_method());

        request.set_method(Method::Delete);
        assert_eq!("0.04", request.message.header.get_code());
    }

    #[test]
    fn test_path_split_and_join() {
        let mut request = CoapRequest::new();

        request.set_path("test-interface");
        assert_eq!("test-interface", request.get_path());

        request.set_path("/sensors//temperature/");
        let segments: Vec<_> = request
            .message
            .get_option(CoapOption::UriPath)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(segments, vec![b"sensors".to_vec(), b"temperature".to_vec()]);
        assert_eq!("sensors/temperature", request.get_path());
    }

    #[test]
    fn test_empty_path_adds_no_option() {
        let mut request = CoapRequest::new();
        request.set_path("/");
        assert!(request.message.get_option(CoapOption::UriPath).is_none());
    }

    #[test]
    fn test_response_template_for_con() {
        let mut request = Packet::new();
        request.header.message_type = MessageType::Confirmable;
        request.header.message_id = 81;
        request.set_token(vec![0xAA, 0xBB]);
        request.payload = b"request body".to_vec();

        let response = CoapResponse::new(&request).unwrap();
        assert_eq!(
            response.message.header.message_type,
            MessageType::Acknowledgement
        );
        assert_eq!(response.message.header.message_id, 81);
        assert_eq!(response.message.get_token(), &[0xAA, 0xBB]);
        // The reply template never inherits the request payload.
        assert!(response.message.payload.is_empty());
    }

    #[test]
    fn test_response_template_for_non() {
        let mut request = Packet::new();
        request.header.message_type = MessageType::NonConfirmable;
        request.header.message_id = 82;
        request.set_token(vec![0x01]);

        let response = CoapResponse::new(&request).unwrap();
        assert_eq!(
            response.message.header.message_type,
            MessageType::NonConfirmable
        );
        assert_eq!(response.message.header.message_id, 0);
        assert_eq!(response.message.get_token(), &[0x01]);
    }

    #[test]
    fn test_no_template_for_ack() {
        let mut request = Packet::new();
        request.header.message_type = MessageType::Acknowledgement;
        assert!(CoapResponse::new(&request).is_none());
    }

    #[test]
    fn test_from_packet_keeps_source() {
        let source = SocketAddr::from_str("127.0.0.1:1234").unwrap();
        let mut packet = Packet::new();
        packet.header.message_type = MessageType::Confirmable;
        let request = CoapRequest::from_packet(packet, &source);
        assert_eq!(request.source, Some(source));
        assert!(request.response.is_some());
    }
}
