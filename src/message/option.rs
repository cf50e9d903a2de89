use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::IncompatibleOptionValue;

/// CoAP option numbers, with an escape hatch for numbers this crate has no
/// name for. Unknown options are carried opaquely and re-emitted unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoapOption {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
    NoResponse,
    Unknown(u16),
}

impl From<u16> for CoapOption {
    fn from(number: u16) -> CoapOption {
        match number {
            1 => CoapOption::IfMatch,
            3 => CoapOption::UriHost,
            4 => CoapOption::ETag,
            5 => CoapOption::IfNoneMatch,
            6 => CoapOption::Observe,
            7 => CoapOption::UriPort,
            8 => CoapOption::LocationPath,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            14 => CoapOption::MaxAge,
            15 => CoapOption::UriQuery,
            17 => CoapOption::Accept,
            20 => CoapOption::LocationQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size2,
            35 => CoapOption::ProxyUri,
            39 => CoapOption::ProxyScheme,
            60 => CoapOption::Size1,
            258 => CoapOption::NoResponse,
            n => CoapOption::Unknown(n),
        }
    }
}

impl From<CoapOption> for u16 {
    fn from(option: CoapOption) -> u16 {
        match option {
            CoapOption::IfMatch => 1,
            CoapOption::UriHost => 3,
            CoapOption::ETag => 4,
            CoapOption::IfNoneMatch => 5,
            CoapOption::Observe => 6,
            CoapOption::UriPort => 7,
            CoapOption::LocationPath => 8,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::MaxAge => 14,
            CoapOption::UriQuery => 15,
            CoapOption::Accept => 17,
            CoapOption::LocationQuery => 20,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size2 => 28,
            CoapOption::ProxyUri => 35,
            CoapOption::ProxyScheme => 39,
            CoapOption::Size1 => 60,
            CoapOption::NoResponse => 258,
            CoapOption::Unknown(n) => n,
        }
    }
}

impl CoapOption {
    /// Options whose values form an ordered sequence on the wire.
    pub fn is_repeatable(&self) -> bool {
        matches!(
            self,
            CoapOption::IfMatch
                | CoapOption::ETag
                | CoapOption::LocationPath
                | CoapOption::UriPath
                | CoapOption::UriQuery
                | CoapOption::LocationQuery
        )
    }

    /// Options carrying an unsigned integer value.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            CoapOption::UriPort
                | CoapOption::MaxAge
                | CoapOption::Accept
                | CoapOption::Size1
                | CoapOption::Size2
                | CoapOption::Observe
                | CoapOption::ContentFormat
        )
    }
}

/// Conversions between typed option values and their wire bytes.
///
/// Integers encode as the shortest big-endian unsigned form, empty for zero.
pub trait OptionValueType:
    Into<Vec<u8>> + TryFrom<Vec<u8>, Error = IncompatibleOptionValue>
{
}

fn shortest_be(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn scalar_from_be(value: &[u8], max_len: usize) -> Result<u32, IncompatibleOptionValue> {
    if value.len() > max_len {
        return Err(IncompatibleOptionValue::new("integer value too wide"));
    }
    Ok(value.iter().fold(0u32, |acc, b| acc << 8 | u32::from(*b)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionValueU16(pub u16);

impl From<OptionValueU16> for Vec<u8> {
    fn from(value: OptionValueU16) -> Vec<u8> {
        shortest_be(u32::from(value.0))
    }
}

impl TryFrom<Vec<u8>> for OptionValueU16 {
    type Error = IncompatibleOptionValue;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Ok(OptionValueU16(scalar_from_be(&value, 2)? as u16))
    }
}

impl OptionValueType for OptionValueU16 {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionValueU32(pub u32);

impl From<OptionValueU32> for Vec<u8> {
    fn from(value: OptionValueU32) -> Vec<u8> {
        shortest_be(value.0)
    }
}

impl TryFrom<Vec<u8>> for OptionValueU32 {
    type Error = IncompatibleOptionValue;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Ok(OptionValueU32(scalar_from_be(&value, 4)?))
    }
}

impl OptionValueType for OptionValueU32 {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionValueString(pub String);

impl From<OptionValueString> for Vec<u8> {
    fn from(value: OptionValueString) -> Vec<u8> {
        value.0.into_bytes()
    }
}

impl TryFrom<Vec<u8>> for OptionValueString {
    type Error = IncompatibleOptionValue;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        String::from_utf8(value)
            .map(OptionValueString)
            .map_err(|_| IncompatibleOptionValue::new("not valid utf-8"))
    }
}

impl OptionValueType for OptionValueString {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ContentFormat {
    TextPlain = 0,
    ApplicationLinkFormat = 40,
    ApplicationXML = 41,
    ApplicationOctetStream = 42,
    ApplicationEXI = 47,
    ApplicationJSON = 50,
    ApplicationCBOR = 60,
    ApplicationSenmlJSON = 110,
    ApplicationSensmlJSON = 111,
    ApplicationSenmlCBOR = 112,
    ApplicationSensmlCBOR = 113,
    ApplicationSenmlExi = 114,
    ApplicationSensmlExi = 115,
    ApplicationSenmlXML = 310,
    ApplicationSensmlXML = 311,
}

impl ContentFormat {
    pub fn from_u16(number: u16) -> Option<ContentFormat> {
        FromPrimitive::from_u16(number)
    }

    /// Map a media-type string onto its registered content-format number.
    pub fn from_mime_type(mime: &str) -> Option<ContentFormat> {
        match mime {
            "text/plain" => Some(ContentFormat::TextPlain),
            "application/link-format" => Some(ContentFormat::ApplicationLinkFormat),
            "application/xml" => Some(ContentFormat::ApplicationXML),
            "application/octet-stream" => Some(ContentFormat::ApplicationOctetStream),
            "application/exi" => Some(ContentFormat::ApplicationEXI),
            "application/json" => Some(ContentFormat::ApplicationJSON),
            "application/cbor" => Some(ContentFormat::ApplicationCBOR),
            _ => None,
        }
    }
}
