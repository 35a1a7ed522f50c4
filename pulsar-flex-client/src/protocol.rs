//! Protocol types and framing for the Pulsar binary protocol
//!
//! Every frame is `u32 length | u8 command type | body`; the length covers
//! the type byte and the body. The same codec is used in both directions so
//! a broker-side peer can reuse it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use crate::error::{PulsarFlexError, ServerError};

pub type ProducerId = u64;
pub type RequestId = u64;
pub type SequenceId = u64;

/// Protocol version announced in `Connect`
pub const PROTOCOL_VERSION: u32 = 19;

/// Frames larger than this are rejected by the decoder
pub const DEFAULT_MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

/// Broker-enforced publishing policy negotiated at producer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Any number of producers may publish
    Shared = 0,
    /// Registration fails if another producer is connected
    Exclusive = 1,
    /// Registration waits until the current exclusive producer leaves
    WaitForExclusive = 2,
    /// Registration fences out the current exclusive producer
    ExclusiveWithFencing = 3,
}

impl AccessMode {
    pub const ALL: [AccessMode; 4] = [
        AccessMode::Shared,
        AccessMode::Exclusive,
        AccessMode::WaitForExclusive,
        AccessMode::ExclusiveWithFencing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Shared => "Shared",
            AccessMode::Exclusive => "Exclusive",
            AccessMode::WaitForExclusive => "WaitForExclusive",
            AccessMode::ExclusiveWithFencing => "ExclusiveWithFencing",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for AccessMode {
    type Error = PulsarFlexError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        AccessMode::ALL
            .into_iter()
            .find(|mode| *mode as u8 == value)
            .ok_or_else(|| PulsarFlexError::protocol(format!("Unknown access mode {}", value)))
    }
}

/// A message handed to the producer by the caller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProducerMessage {
    pub payload: Option<Bytes>,
    pub properties: HashMap<String, String>,
}

impl ProducerMessage {
    /// Create a message with the given payload and no properties
    pub fn new<P: Into<Bytes>>(payload: P) -> Self {
        Self {
            payload: Some(payload.into()),
            properties: HashMap::new(),
        }
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Validate the message and turn it into its wire form
    pub(crate) fn to_entry(&self) -> Result<MessageEntry, PulsarFlexError> {
        let payload = self
            .payload
            .clone()
            .ok_or(PulsarFlexError::PayloadMissing)?;

        if let Some((key, value)) = self.properties.iter().find(|(k, v)| {
            k.len() > wire::MAX_STRING_LEN || v.len() > wire::MAX_STRING_LEN
        }) {
            return Err(PulsarFlexError::protocol(format!(
                "Property {:.32} of {} bytes exceeds maximum {}",
                key,
                key.len().max(value.len()),
                wire::MAX_STRING_LEN
            )));
        }

        let mut properties: Vec<(String, String)> = self
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        properties.sort();

        Ok(MessageEntry {
            payload,
            properties,
        })
    }
}

/// One message as carried inside a `Send` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub payload: Bytes,
    pub properties: Vec<(String, String)>,
}

/// Publish command for a single message or a batch occupying one sequence id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSend {
    pub producer_id: ProducerId,
    pub sequence_id: SequenceId,
    pub producer_name: String,
    pub publish_time: u64,
    pub batched: bool,
    pub entries: Vec<MessageEntry>,
}

impl CommandSend {
    pub fn num_messages(&self) -> usize {
        self.entries.len()
    }

    pub fn payload_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.payload.len()).sum()
    }
}

/// Broker acknowledgment of a persisted send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub producer_id: ProducerId,
    pub sequence_id: SequenceId,
    pub ledger_id: u64,
    pub entry_id: u64,
}

/// Commands exchanged with the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseCommand {
    Connect {
        client_version: String,
        auth_method: Option<String>,
        auth_data: Option<Bytes>,
        protocol_version: u32,
    },
    Connected {
        server_version: String,
        protocol_version: u32,
    },
    Producer {
        topic: String,
        producer_id: ProducerId,
        request_id: RequestId,
        producer_name: Option<String>,
        access_mode: AccessMode,
        epoch: u64,
    },
    ProducerSuccess {
        request_id: RequestId,
        producer_name: String,
        last_sequence_id: i64,
    },
    Success {
        request_id: RequestId,
    },
    Error {
        request_id: RequestId,
        error: ServerError,
        message: String,
    },
    CloseProducer {
        producer_id: ProducerId,
        request_id: RequestId,
    },
    Send(CommandSend),
    SendReceipt(SendReceipt),
    SendError {
        producer_id: ProducerId,
        sequence_id: SequenceId,
        error: ServerError,
        message: String,
    },
    Ping,
    Pong,
}

mod command_type {
    pub const CONNECT: u8 = 2;
    pub const CONNECTED: u8 = 3;
    pub const PRODUCER: u8 = 5;
    pub const SEND: u8 = 6;
    pub const SEND_RECEIPT: u8 = 7;
    pub const SEND_ERROR: u8 = 8;
    pub const SUCCESS: u8 = 13;
    pub const ERROR: u8 = 14;
    pub const CLOSE_PRODUCER: u8 = 15;
    pub const PRODUCER_SUCCESS: u8 = 17;
    pub const PING: u8 = 18;
    pub const PONG: u8 = 19;
}

impl BaseCommand {
    /// Command name as used in logs
    pub fn name(&self) -> &'static str {
        match self {
            BaseCommand::Connect { .. } => "connect",
            BaseCommand::Connected { .. } => "connected",
            BaseCommand::Producer { .. } => "producer",
            BaseCommand::ProducerSuccess { .. } => "producerSuccess",
            BaseCommand::Success { .. } => "success",
            BaseCommand::Error { .. } => "error",
            BaseCommand::CloseProducer { .. } => "closeProducer",
            BaseCommand::Send(_) => "send",
            BaseCommand::SendReceipt(_) => "sendReceipt",
            BaseCommand::SendError { .. } => "sendError",
            BaseCommand::Ping => "ping",
            BaseCommand::Pong => "pong",
        }
    }

    fn type_code(&self) -> u8 {
        match self {
            BaseCommand::Connect { .. } => command_type::CONNECT,
            BaseCommand::Connected { .. } => command_type::CONNECTED,
            BaseCommand::Producer { .. } => command_type::PRODUCER,
            BaseCommand::ProducerSuccess { .. } => command_type::PRODUCER_SUCCESS,
            BaseCommand::Success { .. } => command_type::SUCCESS,
            BaseCommand::Error { .. } => command_type::ERROR,
            BaseCommand::CloseProducer { .. } => command_type::CLOSE_PRODUCER,
            BaseCommand::Send(_) => command_type::SEND,
            BaseCommand::SendReceipt(_) => command_type::SEND_RECEIPT,
            BaseCommand::SendError { .. } => command_type::SEND_ERROR,
            BaseCommand::Ping => command_type::PING,
            BaseCommand::Pong => command_type::PONG,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), PulsarFlexError> {
        match self {
            BaseCommand::Connect {
                client_version,
                auth_method,
                auth_data,
                protocol_version,
            } => {
                wire::put_string(buf, client_version)?;
                wire::put_opt_string(buf, auth_method.as_deref())?;
                wire::put_opt_bytes(buf, auth_data.as_deref());
                buf.put_u32(*protocol_version);
            }
            BaseCommand::Connected {
                server_version,
                protocol_version,
            } => {
                wire::put_string(buf, server_version)?;
                buf.put_u32(*protocol_version);
            }
            BaseCommand::Producer {
                topic,
                producer_id,
                request_id,
                producer_name,
                access_mode,
                epoch,
            } => {
                wire::put_string(buf, topic)?;
                buf.put_u64(*producer_id);
                buf.put_u64(*request_id);
                wire::put_opt_string(buf, producer_name.as_deref())?;
                buf.put_u8(*access_mode as u8);
                buf.put_u64(*epoch);
            }
            BaseCommand::ProducerSuccess {
                request_id,
                producer_name,
                last_sequence_id,
            } => {
                buf.put_u64(*request_id);
                wire::put_string(buf, producer_name)?;
                buf.put_i64(*last_sequence_id);
            }
            BaseCommand::Success { request_id } => buf.put_u64(*request_id),
            BaseCommand::Error {
                request_id,
                error,
                message,
            } => {
                buf.put_u64(*request_id);
                buf.put_u8(*error as u8);
                wire::put_string(buf, message)?;
            }
            BaseCommand::CloseProducer {
                producer_id,
                request_id,
            } => {
                buf.put_u64(*producer_id);
                buf.put_u64(*request_id);
            }
            BaseCommand::Send(send) => {
                buf.put_u64(send.producer_id);
                buf.put_u64(send.sequence_id);
                wire::put_string(buf, &send.producer_name)?;
                buf.put_u64(send.publish_time);
                buf.put_u8(send.batched as u8);
                buf.put_u32(send.entries.len() as u32);
                for entry in &send.entries {
                    buf.put_u32(entry.properties.len() as u32);
                    for (key, value) in &entry.properties {
                        wire::put_string(buf, key)?;
                        wire::put_string(buf, value)?;
                    }
                    wire::put_bytes(buf, &entry.payload);
                }
            }
            BaseCommand::SendReceipt(receipt) => {
                buf.put_u64(receipt.producer_id);
                buf.put_u64(receipt.sequence_id);
                buf.put_u64(receipt.ledger_id);
                buf.put_u64(receipt.entry_id);
            }
            BaseCommand::SendError {
                producer_id,
                sequence_id,
                error,
                message,
            } => {
                buf.put_u64(*producer_id);
                buf.put_u64(*sequence_id);
                buf.put_u8(*error as u8);
                wire::put_string(buf, message)?;
            }
            BaseCommand::Ping | BaseCommand::Pong => {}
        }
        Ok(())
    }

    fn decode_body(code: u8, buf: &mut Bytes) -> Result<Self, PulsarFlexError> {
        let command = match code {
            command_type::CONNECT => BaseCommand::Connect {
                client_version: wire::get_string(buf)?,
                auth_method: wire::get_opt_string(buf)?,
                auth_data: wire::get_opt_bytes(buf)?,
                protocol_version: wire::get_u32(buf)?,
            },
            command_type::CONNECTED => BaseCommand::Connected {
                server_version: wire::get_string(buf)?,
                protocol_version: wire::get_u32(buf)?,
            },
            command_type::PRODUCER => BaseCommand::Producer {
                topic: wire::get_string(buf)?,
                producer_id: wire::get_u64(buf)?,
                request_id: wire::get_u64(buf)?,
                producer_name: wire::get_opt_string(buf)?,
                access_mode: AccessMode::try_from(wire::get_u8(buf)?)?,
                epoch: wire::get_u64(buf)?,
            },
            command_type::PRODUCER_SUCCESS => BaseCommand::ProducerSuccess {
                request_id: wire::get_u64(buf)?,
                producer_name: wire::get_string(buf)?,
                last_sequence_id: wire::get_i64(buf)?,
            },
            command_type::SUCCESS => BaseCommand::Success {
                request_id: wire::get_u64(buf)?,
            },
            command_type::ERROR => BaseCommand::Error {
                request_id: wire::get_u64(buf)?,
                error: ServerError::from(wire::get_u8(buf)?),
                message: wire::get_string(buf)?,
            },
            command_type::CLOSE_PRODUCER => BaseCommand::CloseProducer {
                producer_id: wire::get_u64(buf)?,
                request_id: wire::get_u64(buf)?,
            },
            command_type::SEND => {
                let producer_id = wire::get_u64(buf)?;
                let sequence_id = wire::get_u64(buf)?;
                let producer_name = wire::get_string(buf)?;
                let publish_time = wire::get_u64(buf)?;
                let batched = wire::get_u8(buf)? != 0;
                let count = wire::get_u32(buf)? as usize;

                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let property_count = wire::get_u32(buf)? as usize;
                    let mut properties = Vec::with_capacity(property_count.min(64));
                    for _ in 0..property_count {
                        properties.push((wire::get_string(buf)?, wire::get_string(buf)?));
                    }
                    entries.push(MessageEntry {
                        properties,
                        payload: wire::get_bytes(buf)?,
                    });
                }

                BaseCommand::Send(CommandSend {
                    producer_id,
                    sequence_id,
                    producer_name,
                    publish_time,
                    batched,
                    entries,
                })
            }
            command_type::SEND_RECEIPT => BaseCommand::SendReceipt(SendReceipt {
                producer_id: wire::get_u64(buf)?,
                sequence_id: wire::get_u64(buf)?,
                ledger_id: wire::get_u64(buf)?,
                entry_id: wire::get_u64(buf)?,
            }),
            command_type::SEND_ERROR => BaseCommand::SendError {
                producer_id: wire::get_u64(buf)?,
                sequence_id: wire::get_u64(buf)?,
                error: ServerError::from(wire::get_u8(buf)?),
                message: wire::get_string(buf)?,
            },
            command_type::PING => BaseCommand::Ping,
            command_type::PONG => BaseCommand::Pong,
            other => {
                return Err(PulsarFlexError::protocol(format!(
                    "Unknown command type {}",
                    other
                )))
            }
        };

        if buf.has_remaining() {
            return Err(PulsarFlexError::protocol(format!(
                "{} trailing bytes after {} command",
                buf.remaining(),
                command.name()
            )));
        }

        Ok(command)
    }
}

/// Milliseconds since the Unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Primitive field encoding shared by all commands
pub mod wire {
    use super::*;

    const ABSENT: u16 = u16::MAX;

    /// Longest string a length prefix can carry
    pub const MAX_STRING_LEN: usize = ABSENT as usize - 1;

    fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<(), PulsarFlexError> {
        if buf.remaining() < needed {
            return Err(PulsarFlexError::protocol(format!(
                "Insufficient bytes for {}",
                what
            )));
        }
        Ok(())
    }

    pub fn get_u8(buf: &mut Bytes) -> Result<u8, PulsarFlexError> {
        ensure(buf, 1, "u8")?;
        Ok(buf.get_u8())
    }

    pub fn get_u32(buf: &mut Bytes) -> Result<u32, PulsarFlexError> {
        ensure(buf, 4, "u32")?;
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut Bytes) -> Result<u64, PulsarFlexError> {
        ensure(buf, 8, "u64")?;
        Ok(buf.get_u64())
    }

    pub fn get_i64(buf: &mut Bytes) -> Result<i64, PulsarFlexError> {
        ensure(buf, 8, "i64")?;
        Ok(buf.get_i64())
    }

    /// Write a length-prefixed string. Lengths of `u16::MAX` and above do not
    /// fit the prefix, which reserves `u16::MAX` for absence.
    pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), PulsarFlexError> {
        if s.len() > MAX_STRING_LEN {
            return Err(PulsarFlexError::protocol(format!(
                "String of {} bytes exceeds maximum {}",
                s.len(),
                MAX_STRING_LEN
            )));
        }
        buf.put_u16(s.len() as u16);
        buf.put_slice(s.as_bytes());
        Ok(())
    }

    /// Write an optional string; absence is encoded as a `u16::MAX` length
    pub fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) -> Result<(), PulsarFlexError> {
        match s {
            Some(s) => put_string(buf, s),
            None => {
                buf.put_u16(ABSENT);
                Ok(())
            }
        }
    }

    /// Read a length-prefixed string
    pub fn get_string(buf: &mut Bytes) -> Result<String, PulsarFlexError> {
        get_opt_string(buf)?.ok_or_else(|| PulsarFlexError::protocol("Required string is absent"))
    }

    pub fn get_opt_string(buf: &mut Bytes) -> Result<Option<String>, PulsarFlexError> {
        ensure(buf, 2, "string length")?;
        let len = buf.get_u16();
        if len == ABSENT {
            return Ok(None);
        }

        ensure(buf, len as usize, "string")?;
        let raw = buf.split_to(len as usize);
        let s = String::from_utf8(raw.to_vec())
            .map_err(|_| PulsarFlexError::protocol("Invalid UTF-8 string"))?;
        Ok(Some(s))
    }

    /// Write bytes array with length prefix
    pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
        buf.put_u32(bytes.len() as u32);
        buf.put_slice(bytes);
    }

    pub fn put_opt_bytes(buf: &mut BytesMut, bytes: Option<&[u8]>) {
        match bytes {
            Some(bytes) => {
                buf.put_u8(1);
                put_bytes(buf, bytes);
            }
            None => buf.put_u8(0),
        }
    }

    /// Read bytes array with length prefix
    pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes, PulsarFlexError> {
        let len = get_u32(buf)? as usize;
        ensure(buf, len, "bytes")?;
        Ok(buf.split_to(len))
    }

    pub fn get_opt_bytes(buf: &mut Bytes) -> Result<Option<Bytes>, PulsarFlexError> {
        match get_u8(buf)? {
            0 => Ok(None),
            _ => get_bytes(buf).map(Some),
        }
    }
}

/// Length-prefixed command codec for `Framed` transports
#[derive(Debug, Clone)]
pub struct PulsarCodec {
    max_frame_size: usize,
}

impl PulsarCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for PulsarCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl tokio_util::codec::Encoder<BaseCommand> for PulsarCodec {
    type Error = PulsarFlexError;

    fn encode(&mut self, item: BaseCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();

        // Frame length is filled in once the body is written
        dst.put_u32(0);
        dst.put_u8(item.type_code());
        if let Err(e) = item.encode_body(dst) {
            dst.truncate(start);
            return Err(e);
        }

        let frame_len = dst.len() - start - 4;
        if frame_len > self.max_frame_size {
            dst.truncate(start);
            return Err(PulsarFlexError::protocol(format!(
                "Frame of {} bytes exceeds maximum {}",
                frame_len, self.max_frame_size
            )));
        }
        (&mut dst[start..start + 4]).put_u32(frame_len as u32);

        Ok(())
    }
}

impl tokio_util::codec::Decoder for PulsarCodec {
    type Item = BaseCommand;
    type Error = PulsarFlexError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None); // Need at least length prefix
        }

        let frame_len = (&src[0..4]).get_u32() as usize;
        if frame_len == 0 || frame_len > self.max_frame_size {
            return Err(PulsarFlexError::protocol(format!(
                "Invalid frame length {}",
                frame_len
            )));
        }
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(frame_len).freeze();
        let code = frame.get_u8();
        BaseCommand::decode_body(code, &mut frame).map(Some)
    }
}
