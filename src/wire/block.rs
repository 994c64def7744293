use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::DecodeError;

/// The leading byte of every encoded block, identifying its variant.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i8)]
pub enum BlockTag {
    Multi = -1,
    Ignore = 0,
    Hello = 1,
    Ping = 2,
    MessageCtl = 3,
    MessageData = 4,
    MessageAck = 5,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HelloKind {
    Knock = 0,
    Hello = 1,
    Busy = 2,
    Bye = 3,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PingKind {
    Ping = 0,
    Pong = 1,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CtlKind {
    /// announces a message id and its total size ahead of the first fragment
    New = 0,
    /// the announced id is not known on the receiving side - the sender should re-announce
    Unknown = 1,
    /// the sender has transmitted the full payload (not necessarily acknowledged)
    Sent = 2,
    /// the receiver has assembled the full payload
    Complete = 3,
    /// the sender aborts the message
    ErrorSend = 4,
    /// the receiver aborts the message
    ErrorRecv = 5,
    /// the sender asks for the message's delivery status
    WhatsUp = 6,
    /// the receiver is still missing parts of the message
    Pending = 7,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AckKind {
    Acknowledge = 0,
    Repeat = 1,
}

/// One wire-format unit: the atomic thing handed to (and received from) the
///  transport. Every encoded block starts with a [BlockTag] byte; `Multi`
///  length-prefixes each nested block so that variable-size sub-blocks can be
///  sliced out before dispatch to the matching decoder.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Block {
    Multi(Vec<Block>),
    /// padding / alignment filler, skipped on receive
    Ignore(Bytes),
    Hello { kind: HelloKind, version: u64 },
    Ping { kind: PingKind, id: u64 },
    /// `aux` carries the expected total size on `New` and is ignored otherwise
    MessageCtl { kind: CtlKind, message_id: u64, aux: u64 },
    MessageData { message_id: u64, offset: u32, payload: Bytes },
    MessageAck { kind: AckKind, message_id: u64, offset: u32, length: u32 },
}

impl Block {
    pub const HELLO_SIZE: usize = 10;
    pub const PING_SIZE: usize = 10;
    pub const MESSAGE_CTL_SIZE: usize = 18;
    pub const MESSAGE_DATA_HEADER_SIZE: usize = 17;
    pub const MESSAGE_ACK_SIZE: usize = 18;

    /// exact encoded size - `encode(b).len() == b.wire_size()` holds for every
    ///  variant so callers can pre-compute allocations
    pub fn wire_size(&self) -> usize {
        match self {
            Block::Multi(blocks) => 5 + blocks.iter()
                .map(|b| 4 + b.wire_size())
                .sum::<usize>(),
            Block::Ignore(padding) => 5 + padding.len(),
            Block::Hello { .. } => Self::HELLO_SIZE,
            Block::Ping { .. } => Self::PING_SIZE,
            Block::MessageCtl { .. } => Self::MESSAGE_CTL_SIZE,
            Block::MessageData { payload, .. } => Self::MESSAGE_DATA_HEADER_SIZE + payload.len(),
            Block::MessageAck { .. } => Self::MESSAGE_ACK_SIZE,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Block::Multi(blocks) => {
                buf.put_i8(BlockTag::Multi.into());
                buf.put_u32(blocks.len() as u32);
                for block in blocks {
                    buf.put_u32(block.wire_size() as u32);
                    block.ser(buf);
                }
            }
            Block::Ignore(padding) => {
                buf.put_i8(BlockTag::Ignore.into());
                buf.put_u32(padding.len() as u32);
                buf.put_slice(padding);
            }
            Block::Hello { kind, version } => {
                buf.put_i8(BlockTag::Hello.into());
                buf.put_u8((*kind).into());
                buf.put_u64(*version);
            }
            Block::Ping { kind, id } => {
                buf.put_i8(BlockTag::Ping.into());
                buf.put_u8((*kind).into());
                buf.put_u64(*id);
            }
            Block::MessageCtl { kind, message_id, aux } => {
                buf.put_i8(BlockTag::MessageCtl.into());
                buf.put_u8((*kind).into());
                buf.put_u64(*message_id);
                buf.put_u64(*aux);
            }
            Block::MessageData { message_id, offset, payload } => {
                buf.put_i8(BlockTag::MessageData.into());
                buf.put_u64(*message_id);
                buf.put_u32(*offset);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            Block::MessageAck { kind, message_id, offset, length } => {
                buf.put_i8(BlockTag::MessageAck.into());
                buf.put_u64(*message_id);
                buf.put_u32(*offset);
                buf.put_u32(*length);
                buf.put_u8((*kind).into());
            }
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.ser(&mut buf);
        debug_assert_eq!(buf.len(), self.wire_size());
        buf
    }

    /// Decodes one block from the buffer, consuming exactly its wire
    ///  representation. Never reads past the supplied buffer, and never trusts
    ///  an embedded length that exceeds the remaining bytes.
    pub fn try_read(buf: &mut impl Buf) -> Result<Block, DecodeError> {
        let raw_tag = try_get_i8(buf)?;
        let tag = BlockTag::try_from(raw_tag)
            .map_err(|_| DecodeError::UnknownTag(raw_tag))?;

        match tag {
            BlockTag::Multi => {
                let count = try_get_u32(buf)? as usize;
                let mut blocks = Vec::new();
                for _ in 0..count {
                    let sub_len = try_get_u32(buf)? as usize;
                    if sub_len > buf.remaining() {
                        return Err(DecodeError::LengthOutOfBounds { length: sub_len, remaining: buf.remaining() });
                    }
                    let mut sub_buf = buf.copy_to_bytes(sub_len);
                    let block = Block::try_read(&mut sub_buf)?;
                    if sub_buf.has_remaining() {
                        return Err(DecodeError::TrailingBytes(sub_buf.remaining()));
                    }
                    blocks.push(block);
                }
                Ok(Block::Multi(blocks))
            }
            BlockTag::Ignore => {
                let len = try_get_u32(buf)? as usize;
                if len > buf.remaining() {
                    return Err(DecodeError::LengthOutOfBounds { length: len, remaining: buf.remaining() });
                }
                Ok(Block::Ignore(buf.copy_to_bytes(len)))
            }
            BlockTag::Hello => {
                let kind = try_get_discriminator::<HelloKind>(buf, "hello kind")?;
                let version = try_get_u64(buf)?;
                Ok(Block::Hello { kind, version })
            }
            BlockTag::Ping => {
                let kind = try_get_discriminator::<PingKind>(buf, "ping kind")?;
                let id = try_get_u64(buf)?;
                Ok(Block::Ping { kind, id })
            }
            BlockTag::MessageCtl => {
                let kind = try_get_discriminator::<CtlKind>(buf, "message ctl kind")?;
                let message_id = try_get_u64(buf)?;
                let aux = try_get_u64(buf)?;
                Ok(Block::MessageCtl { kind, message_id, aux })
            }
            BlockTag::MessageData => {
                let message_id = try_get_u64(buf)?;
                let offset = try_get_u32(buf)?;
                let length = try_get_u32(buf)? as usize;
                if length > buf.remaining() {
                    return Err(DecodeError::LengthOutOfBounds { length, remaining: buf.remaining() });
                }
                Ok(Block::MessageData { message_id, offset, payload: buf.copy_to_bytes(length) })
            }
            BlockTag::MessageAck => {
                let message_id = try_get_u64(buf)?;
                let offset = try_get_u32(buf)?;
                let length = try_get_u32(buf)?;
                let kind = try_get_discriminator::<AckKind>(buf, "ack kind")?;
                Ok(Block::MessageAck { kind, message_id, offset, length })
            }
        }
    }
}

fn try_get_i8(buf: &mut impl Buf) -> Result<i8, DecodeError> {
    if buf.remaining() < 1 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_i8())
}

fn try_get_u8(buf: &mut impl Buf) -> Result<u8, DecodeError> {
    if buf.remaining() < 1 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_u8())
}

fn try_get_u32(buf: &mut impl Buf) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_u32())
}

fn try_get_u64(buf: &mut impl Buf) -> Result<u64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_u64())
}

fn try_get_discriminator<T: TryFrom<u8>>(buf: &mut impl Buf, field: &'static str) -> Result<T, DecodeError> {
    let value = try_get_u8(buf)?;
    T::try_from(value).map_err(|_| DecodeError::UnknownDiscriminator { field, value })
}
