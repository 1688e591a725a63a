//! Bitcoin P2P messages
//!
//! Payload encoding and decoding for the messages an SPV node exchanges.
//! Decoding is dispatched by command string through
//! `NetworkMessageParser`, which accepts extra parsers for chain-specific
//! commands.

use crate::bloom::BloomFilter;
use crate::core::network::MIN_BLOOM_PROTOCOL_VERSION;
use crate::core::{write_var_bytes, write_var_int, BlockHeader, ByteReader, EncodingError, FullTransaction};
use crate::crypto::Hash256;
use bitflags::bitflags;
use bytes::BufMut;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// =============================================================================
// Constants
// =============================================================================

/// Wire header: magic, command, length, checksum
pub const MESSAGE_HEADER_SIZE: usize = 24;

/// Largest payload accepted from a peer
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Most inventory entries in one message
pub const MAX_INV_ENTRIES: usize = 50_000;

/// Most addresses in one `addr`
pub const MAX_ADDR_ENTRIES: usize = 1_000;

pub const USER_AGENT: &str = "/spv-kit:0.1.0/";

/// First protocol version with bloom filtering
const BIP37_PROTOCOL_VERSION: i32 = 70001;

bitflags! {
    /// Services a node advertises
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u64 {
        const NODE_NETWORK = 1;
        const NODE_BLOOM = 1 << 2;
        const NODE_WITNESS = 1 << 3;
        const NODE_NETWORK_LIMITED = 1 << 10;
    }
}

// =============================================================================
// Payload Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    WitnessTx,
    Unknown(u32),
}

impl InventoryType {
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Error => 0,
            Self::Tx => 1,
            Self::Block => 2,
            Self::FilteredBlock => 3,
            Self::WitnessTx => 0x4000_0001,
            Self::Unknown(value) => value,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Error,
            1 => Self::Tx,
            2 => Self::Block,
            3 => Self::FilteredBlock,
            0x4000_0001 => Self::WitnessTx,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    pub inv_type: InventoryType,
    pub hash: Hash256,
}

impl InventoryItem {
    pub fn new(inv_type: InventoryType, hash: Hash256) -> Self {
        Self { inv_type, hash }
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self.inv_type, InventoryType::Tx | InventoryType::WitnessTx)
    }

    pub fn is_block(&self) -> bool {
        matches!(self.inv_type, InventoryType::Block | InventoryType::FilteredBlock)
    }
}

/// Address as carried in `version` and `addr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddress {
    pub services: ServiceFlags,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(address: SocketAddr, services: ServiceFlags) -> Self {
        let ip = match address.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            services,
            ip,
            port: address.port(),
        }
    }

    pub fn unspecified() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), ServiceFlags::empty())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(self.ip), self.port),
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.services.bits());
        buf.put_slice(&self.ip.octets());
        buf.put_u16(self.port);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        let services = ServiceFlags::from_bits_retain(reader.read_u64_le()?);
        let ip = Ipv6Addr::from(reader.read_array::<16>()?);
        let port = reader.read_u16_be()?;
        Ok(Self { services, ip, port })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub receiver: NetworkAddress,
    pub sender: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    /// Newer peers must signal `NODE_BLOOM`; older ones filter implicitly
    pub fn has_bloom_support(&self) -> bool {
        self.services.contains(ServiceFlags::NODE_BLOOM)
            || (BIP37_PROTOCOL_VERSION..MIN_BLOOM_PROTOCOL_VERSION).contains(&self.version)
    }
}

/// Header, transaction count and partial merkle tree of a filtered block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Vec<u8>,
}

// =============================================================================
// Message
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionMessage),
    VerAck,
    Ping(u64),
    Pong(u64),
    Inv(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    NotFound(Vec<InventoryItem>),
    /// Timestamped addresses
    Addr(Vec<(u32, NetworkAddress)>),
    MemPool,
    Tx(FullTransaction),
    MerkleBlock(MerkleBlockMessage),
    FilterLoad(BloomFilter),
    GetBlocks {
        version: i32,
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    Reject(RejectMessage),
    /// A command with no registered parser
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    pub fn command(&self) -> &str {
        match self {
            Self::Version(_) => "version",
            Self::VerAck => "verack",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Inv(_) => "inv",
            Self::GetData(_) => "getdata",
            Self::NotFound(_) => "notfound",
            Self::Addr(_) => "addr",
            Self::MemPool => "mempool",
            Self::Tx(_) => "tx",
            Self::MerkleBlock(_) => "merkleblock",
            Self::FilterLoad(_) => "filterload",
            Self::GetBlocks { .. } => "getblocks",
            Self::Reject(_) => "reject",
            Self::Unknown { command, .. } => command.as_str(),
        }
    }

    pub fn serialize_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Version(v) => {
                buf.put_i32_le(v.version);
                buf.put_u64_le(v.services.bits());
                buf.put_i64_le(v.timestamp);
                v.receiver.write(&mut buf);
                v.sender.write(&mut buf);
                buf.put_u64_le(v.nonce);
                write_var_bytes(&mut buf, v.user_agent.as_bytes());
                buf.put_i32_le(v.start_height);
                buf.put_u8(v.relay as u8);
            }
            Self::VerAck | Self::MemPool => {}
            Self::Ping(nonce) | Self::Pong(nonce) => buf.put_u64_le(*nonce),
            Self::Inv(items) | Self::GetData(items) | Self::NotFound(items) => {
                write_var_int(&mut buf, items.len() as u64);
                for item in items {
                    buf.put_u32_le(item.inv_type.to_u32());
                    buf.put_slice(item.hash.as_bytes());
                }
            }
            Self::Addr(addresses) => {
                write_var_int(&mut buf, addresses.len() as u64);
                for (time, address) in addresses {
                    buf.put_u32_le(*time);
                    address.write(&mut buf);
                }
            }
            Self::Tx(tx) => buf = tx.serialize(),
            Self::MerkleBlock(block) => {
                buf.put_slice(&block.header.serialize());
                buf.put_u32_le(block.total_transactions);
                write_var_int(&mut buf, block.hashes.len() as u64);
                for hash in &block.hashes {
                    buf.put_slice(hash.as_bytes());
                }
                write_var_bytes(&mut buf, &block.flags);
            }
            Self::FilterLoad(filter) => buf = filter.serialize(),
            Self::GetBlocks { version, locator, stop } => {
                buf.put_i32_le(*version);
                write_var_int(&mut buf, locator.len() as u64);
                for hash in locator {
                    buf.put_slice(hash.as_bytes());
                }
                buf.put_slice(stop.as_bytes());
            }
            Self::Reject(reject) => {
                write_var_bytes(&mut buf, reject.message.as_bytes());
                buf.put_u8(reject.code);
                write_var_bytes(&mut buf, reject.reason.as_bytes());
                buf.put_slice(&reject.data);
            }
            Self::Unknown { payload, .. } => buf = payload.clone(),
        }
        buf
    }
}

// =============================================================================
// Parsers
// =============================================================================

fn read_inventory(reader: &mut ByteReader<'_>) -> Result<Vec<InventoryItem>, EncodingError> {
    let count = reader.read_var_int()? as usize;
    if count > MAX_INV_ENTRIES {
        return Err(EncodingError::TooLarge(count as u64));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = InventoryType::from_u32(reader.read_u32_le()?);
        items.push(InventoryItem::new(inv_type, reader.read_hash()?));
    }
    Ok(items)
}

fn parse_version(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    let version = reader.read_i32_le()?;
    let services = ServiceFlags::from_bits_retain(reader.read_u64_le()?);
    let timestamp = reader.read_i64_le()?;
    let receiver = NetworkAddress::read(reader)?;
    let sender = NetworkAddress::read(reader)?;
    let nonce = reader.read_u64_le()?;
    let user_agent = reader.read_var_string()?;
    let start_height = reader.read_i32_le()?;
    // absent before BIP37
    let relay = if reader.is_empty() { true } else { reader.read_bool()? };
    Ok(Message::Version(VersionMessage {
        version,
        services,
        timestamp,
        receiver,
        sender,
        nonce,
        user_agent,
        start_height,
        relay,
    }))
}

fn parse_verack(_: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    Ok(Message::VerAck)
}

fn parse_mempool(_: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    Ok(Message::MemPool)
}

fn parse_ping(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    Ok(Message::Ping(reader.read_u64_le()?))
}

fn parse_pong(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    Ok(Message::Pong(reader.read_u64_le()?))
}

fn parse_inv(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    Ok(Message::Inv(read_inventory(reader)?))
}

fn parse_getdata(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    Ok(Message::GetData(read_inventory(reader)?))
}

fn parse_notfound(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    Ok(Message::NotFound(read_inventory(reader)?))
}

fn parse_addr(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    let count = reader.read_var_int()? as usize;
    if count > MAX_ADDR_ENTRIES {
        return Err(EncodingError::TooLarge(count as u64));
    }
    let mut addresses = Vec::with_capacity(count);
    for _ in 0..count {
        let time = reader.read_u32_le()?;
        addresses.push((time, NetworkAddress::read(reader)?));
    }
    Ok(Message::Addr(addresses))
}

fn parse_tx(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    Ok(Message::Tx(FullTransaction::read(reader)?))
}

fn parse_merkleblock(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    let header = BlockHeader::deserialize(reader)?;
    let total_transactions = reader.read_u32_le()?;
    let count = reader.read_var_int()? as usize;
    if count > reader.remaining() / 32 {
        return Err(EncodingError::TooLarge(count as u64));
    }
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(reader.read_hash()?);
    }
    let flags = reader.read_var_bytes()?;
    Ok(Message::MerkleBlock(MerkleBlockMessage {
        header,
        total_transactions,
        hashes,
        flags,
    }))
}

fn parse_filterload(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    Ok(Message::FilterLoad(BloomFilter::deserialize(reader)?))
}

fn parse_getblocks(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    let version = reader.read_i32_le()?;
    let count = reader.read_var_int()? as usize;
    if count > 500 {
        return Err(EncodingError::TooLarge(count as u64));
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(reader.read_hash()?);
    }
    let stop = reader.read_hash()?;
    Ok(Message::GetBlocks { version, locator, stop })
}

fn parse_reject(reader: &mut ByteReader<'_>) -> Result<Message, EncodingError> {
    let message = reader.read_var_string()?;
    let code = reader.read_u8()?;
    let reason = reader.read_var_string()?;
    let data = reader.read_bytes(reader.remaining())?.to_vec();
    Ok(Message::Reject(RejectMessage {
        message,
        code,
        reason,
        data,
    }))
}

pub type ParseFn = fn(&mut ByteReader<'_>) -> Result<Message, EncodingError>;

/// Payload decoders keyed by command
#[derive(Clone)]
pub struct NetworkMessageParser {
    parsers: HashMap<String, ParseFn>,
}

impl Default for NetworkMessageParser {
    fn default() -> Self {
        let mut parser = Self {
            parsers: HashMap::new(),
        };
        let standard: [(&str, ParseFn); 14] = [
            ("version", parse_version),
            ("verack", parse_verack),
            ("ping", parse_ping),
            ("pong", parse_pong),
            ("inv", parse_inv),
            ("getdata", parse_getdata),
            ("notfound", parse_notfound),
            ("addr", parse_addr),
            ("mempool", parse_mempool),
            ("tx", parse_tx),
            ("merkleblock", parse_merkleblock),
            ("filterload", parse_filterload),
            ("getblocks", parse_getblocks),
            ("reject", parse_reject),
        ];
        for (command, parse) in standard {
            parser.register(command, parse);
        }
        parser
    }
}

impl NetworkMessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the parser of `command`
    pub fn register(&mut self, command: &str, parse: ParseFn) {
        self.parsers.insert(command.to_string(), parse);
    }

    pub fn parse(&self, command: &str, payload: &[u8]) -> Result<Message, EncodingError> {
        match self.parsers.get(command) {
            Some(parse) => parse(&mut ByteReader::new(payload)),
            None => Ok(Message::Unknown {
                command: command.to_string(),
                payload: payload.to_vec(),
            }),
        }
    }
}
