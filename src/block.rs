//! Block-wise transfer: descriptors, payload segmentation and reassembly.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{BlockError, IncompatibleOptionValue};
use crate::message::option::{CoapOption, OptionValueType};
use crate::message::packet::Packet;

/// A block descriptor: block number, more-follows flag and block size.
///
/// The scalar form packs `num << 4 | more << 3 | size_exponent` and is
/// emitted in 1, 2 or 4 bytes for `num` below 16, 4096 and 2^28.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub size_exponent: u8,
}

const MAX_BLOCK_NUM: u32 = (1 << 28) - 1;

impl BlockValue {
    pub fn new(num: usize, more: bool, size: usize) -> Result<Self, IncompatibleOptionValue> {
        let true_size_exponent = Self::largest_power_of_2_not_in_excess(size)
            .ok_or_else(|| IncompatibleOptionValue::new("block size of zero"))?;

        let size_exponent = u8::try_from(true_size_exponent.saturating_sub(4))
            .map_err(|_| IncompatibleOptionValue::new("block size out of range"))?;
        if size_exponent > 0x6 {
            return Err(IncompatibleOptionValue::new("block size above 1024"));
        }
        let num =
            u32::try_from(num).map_err(|_| IncompatibleOptionValue::new("block number too big"))?;
        if num > MAX_BLOCK_NUM {
            return Err(IncompatibleOptionValue::new("block number too big"));
        }
        Ok(Self {
            num,
            more,
            size_exponent,
        })
    }

    /// Finds the largest power of 2 that does not exceed `target`.
    fn largest_power_of_2_not_in_excess(target: usize) -> Option<usize> {
        if target == 0 {
            return None;
        }
        let max_power = usize::try_from(usize::BITS).unwrap();
        match (0..max_power).find(|i| (1usize << i) > target) {
            Some(power) => Some(power - 1),
            None => Some(max_power),
        }
    }

    pub fn size(&self) -> usize {
        1 << (self.size_exponent + 4)
    }

    /// `(0, false)` carries no transfer structure; such a descriptor is
    /// interchangeable with the option being absent.
    pub fn is_trivial(&self) -> bool {
        self.num == 0 && !self.more
    }
}

impl From<BlockValue> for Vec<u8> {
    fn from(block: BlockValue) -> Vec<u8> {
        let scalar: u32 =
            block.num << 4 | u32::from(block.more) << 3 | u32::from(block.size_exponent & 0x7);
        if block.num < 16 {
            vec![scalar as u8]
        } else if block.num < 4096 {
            (scalar as u16).to_be_bytes().to_vec()
        } else {
            scalar.to_be_bytes().to_vec()
        }
    }
}

impl TryFrom<Vec<u8>> for BlockValue {
    type Error = IncompatibleOptionValue;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() > 4 {
            return Err(IncompatibleOptionValue::new("block value wider than 4 bytes"));
        }
        let scalar = value.iter().fold(0u32, |acc, b| acc << 8 | u32::from(*b));

        let num = scalar >> 4;
        let more = scalar >> 3 & 0x1 == 0x1;
        let size_exponent = (scalar & 0x7) as u8;
        if size_exponent > 0x6 {
            return Err(IncompatibleOptionValue::new("reserved block size exponent"));
        }
        Ok(Self {
            num,
            more,
            size_exponent,
        })
    }
}

impl OptionValueType for BlockValue {}

/// The block1/block2 pair on one message, viewed by role.
///
/// `description` says what this message's payload is a segment of;
/// `control` says what the next peer message should carry. On requests the
/// description rides in block1 and the control in block2; responses invert
/// the mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multipart {
    pub description: Option<BlockValue>,
    pub control: Option<BlockValue>,
}

impl Multipart {
    pub fn of(packet: &Packet) -> Result<Multipart, IncompatibleOptionValue> {
        let block1 = packet
            .get_first_option_as::<BlockValue>(CoapOption::Block1)
            .transpose()?;
        let block2 = packet
            .get_first_option_as::<BlockValue>(CoapOption::Block2)
            .transpose()?;

        Ok(if packet.header.code.is_request() {
            Multipart {
                description: block1,
                control: block2,
            }
        } else {
            Multipart {
                description: block2,
                control: block1,
            }
        })
    }

    /// Write this view back onto a packet, eliding trivial descriptors.
    pub fn apply(&self, packet: &mut Packet) {
        packet.clear_option(CoapOption::Block1);
        packet.clear_option(CoapOption::Block2);

        let (desc_option, ctrl_option) = if packet.header.code.is_request() {
            (CoapOption::Block1, CoapOption::Block2)
        } else {
            (CoapOption::Block2, CoapOption::Block1)
        };
        if let Some(desc) = self.description.as_ref().filter(|b| !b.is_trivial()) {
            packet.add_option_as(desc_option, desc.clone());
        }
        if let Some(ctrl) = self.control.as_ref().filter(|b| !b.is_trivial()) {
            packet.add_option_as(ctrl_option, ctrl.clone());
        }
    }
}

/// Splits an outbound payload into fixed-size segments.
#[derive(Debug, Clone)]
pub struct Segmenter {
    data: Bytes,
    size: usize,
}

impl Segmenter {
    pub fn new(data: Bytes, size: usize) -> Result<Segmenter, IncompatibleOptionValue> {
        // Validate the size the same way a descriptor would.
        BlockValue::new(0, false, size)?;
        Ok(Segmenter { data, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Shrink the segment size on peer request. Returns the rescaled block
    /// number that keeps the current byte offset aligned.
    pub fn resize(&mut self, num: u32, size: usize) -> Result<u32, IncompatibleOptionValue> {
        BlockValue::new(0, false, size)?;
        let offset = num as usize * self.size;
        self.size = size;
        Ok((offset / size) as u32)
    }

    /// Bytes and descriptor for segment `num`. A zero-length payload yields
    /// the single segment `(0, false, size)`.
    pub fn segment(&self, num: u32) -> (Bytes, BlockValue) {
        let start = (num as usize * self.size).min(self.data.len());
        let end = (start + self.size).min(self.data.len());
        let more = end < self.data.len();
        let block =
            BlockValue::new(num as usize, more, self.size).expect("validated at construction");
        (self.data.slice(start..end), block)
    }
}

/// Accumulates inbound segments until the final block closes the transfer.
#[derive(Debug, Clone, Default)]
pub struct Reassembly {
    segments: BTreeMap<u32, Vec<u8>>,
}

impl Reassembly {
    pub fn new() -> Reassembly {
        Reassembly::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Store one non-final segment. A duplicate with identical bytes is
    /// ignored; a duplicate with different bytes is a conflict.
    pub fn insert(&mut self, block: &BlockValue, bytes: &[u8]) -> Result<(), BlockError> {
        match self.segments.get(&block.num) {
            Some(existing) if existing == bytes => Ok(()),
            Some(_) => Err(BlockError::Conflict(block.num)),
            None => {
                self.segments.insert(block.num, bytes.to_vec());
                Ok(())
            }
        }
    }

    /// Store the final segment and concatenate everything in block order,
    /// verifying there are no gaps. The accumulator is consumed either way.
    pub fn flush(&mut self, last: &BlockValue, bytes: &[u8]) -> Result<Vec<u8>, BlockError> {
        self.insert(last, bytes)?;
        let segments = std::mem::take(&mut self.segments);

        let mut assembled = Vec::new();
        for expected in 0..=last.num {
            match segments.get(&expected) {
                Some(part) => assembled.extend_from_slice(part),
                None => return Err(BlockError::MissingBlock(expected)),
            }
        }
        Ok(assembled)
    }
}
