//! Message framing for tokio-util
//!
//! Every message is `magic | command | length | checksum | payload`.

use crate::core::{EncodingError, Network};
use crate::crypto::double_sha256;
use crate::network::message::{Message, NetworkMessageParser, MAX_PAYLOAD_SIZE, MESSAGE_HEADER_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const COMMAND_SIZE: usize = 12;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Wrong network magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("Invalid command bytes")]
    BadCommand,
    #[error("Payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),
    #[error("Checksum mismatch for {0}")]
    BadChecksum(String),
    #[error("Malformed {command}: {source}")]
    Malformed {
        command: String,
        source: EncodingError,
    },
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Codec for one peer connection
#[derive(Clone)]
pub struct MessageCodec {
    magic: [u8; 4],
    parser: Arc<NetworkMessageParser>,
}

impl MessageCodec {
    pub fn new(network: Network, parser: Arc<NetworkMessageParser>) -> Self {
        Self {
            magic: network.magic(),
            parser,
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = item.command().as_bytes();
        if command.len() > COMMAND_SIZE || !command.is_ascii() {
            return Err(WireError::BadCommand);
        }
        let payload = item.serialize_payload();

        dst.reserve(MESSAGE_HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(command);
        dst.put_bytes(0, COMMAND_SIZE - command.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MESSAGE_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [src[0], src[1], src[2], src[3]];
        if magic != self.magic {
            return Err(WireError::BadMagic(magic));
        }

        let command_bytes = &src[4..4 + COMMAND_SIZE];
        let end = command_bytes.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
        if !command_bytes[end..].iter().all(|b| *b == 0) || !command_bytes[..end].is_ascii() {
            return Err(WireError::BadCommand);
        }
        let command = String::from_utf8_lossy(&command_bytes[..end]).into_owned();

        let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(length));
        }
        if src.len() < MESSAGE_HEADER_SIZE + length {
            src.reserve(MESSAGE_HEADER_SIZE + length - src.len());
            return Ok(None);
        }
        let expected = [src[20], src[21], src[22], src[23]];

        src.advance(MESSAGE_HEADER_SIZE);
        let payload = src.split_to(length);
        if checksum(&payload) != expected {
            return Err(WireError::BadChecksum(command));
        }

        self.parser
            .parse(&command, &payload)
            .map(Some)
            .map_err(|source| WireError::Malformed { command, source })
    }
}
