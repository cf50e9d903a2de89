//! The CoAP message model and its wire codec.

pub mod header;
pub mod option;
pub mod packet;

pub use self::header::{Header, MessageClass, MessageType, RequestType, ResponseType};
pub use self::option::{
    CoapOption, ContentFormat, OptionValueString, OptionValueType, OptionValueU16, OptionValueU32,
};
pub use self::packet::Packet;
