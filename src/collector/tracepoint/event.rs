//! P2P message events emitted by the node's `net` USDT tracepoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tor v3 and I2P addresses plus `:port`.
pub const MAX_PEER_ADDR_LENGTH: usize = 68;
pub const MAX_PEER_CONN_TYPE_LENGTH: usize = 20;
pub const MAX_MSG_TYPE_LENGTH: usize = 20;

// Offsets of `struct p2p_message` in bpf/p2p_net.bpf.c.
const PEER_ID_OFFSET: usize = 0;
const PEER_ADDR_OFFSET: usize = 8;
const CONN_TYPE_OFFSET: usize = PEER_ADDR_OFFSET + MAX_PEER_ADDR_LENGTH;
const MSG_TYPE_OFFSET: usize = CONN_TYPE_OFFSET + MAX_PEER_CONN_TYPE_LENGTH;
/// `msg_size` is 8-byte aligned after the 116 bytes above.
const MSG_SIZE_OFFSET: usize = 120;
const FLOW_OFFSET: usize = 128;

/// Size of one ring buffer record.
pub const RAW_EVENT_SIZE: usize = 136;

const FLOW_INBOUND: u8 = 0;
const FLOW_OUTBOUND: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelEventType {
    InboundMessage,
    OutboundMessage,
}

/// One P2P message observed at the node's network layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelEvent {
    pub event_type: KernelEventType,
    /// Userspace receive time; the tracepoint does not carry a clock.
    pub timestamp: DateTime<Utc>,
    pub peer_id: u64,
    pub peer_addr: String,
    pub peer_conn_type: String,
    pub msg_type: String,
    pub size: u64,
}

/// Why a raw record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Short(usize),
    UnknownFlow(u8),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Short(len) => {
                write!(f, "record too short: {} < {} bytes", len, RAW_EVENT_SIZE)
            }
            DecodeError::UnknownFlow(v) => write!(f, "unknown flow byte {}", v),
        }
    }
}

impl std::error::Error for DecodeError {}

impl KernelEvent {
    /// Decodes one ring buffer record.
    pub fn decode(data: &[u8], timestamp: DateTime<Utc>) -> Result<Self, DecodeError> {
        if data.len() < RAW_EVENT_SIZE {
            return Err(DecodeError::Short(data.len()));
        }
        let event_type = match data[FLOW_OFFSET] {
            FLOW_INBOUND => KernelEventType::InboundMessage,
            FLOW_OUTBOUND => KernelEventType::OutboundMessage,
            other => return Err(DecodeError::UnknownFlow(other)),
        };
        Ok(Self {
            event_type,
            timestamp,
            peer_id: read_u64(data, PEER_ID_OFFSET),
            peer_addr: read_cstr(&data[PEER_ADDR_OFFSET..CONN_TYPE_OFFSET]),
            peer_conn_type: read_cstr(&data[CONN_TYPE_OFFSET..MSG_TYPE_OFFSET]),
            msg_type: read_cstr(&data[MSG_TYPE_OFFSET..MSG_TYPE_OFFSET + MAX_MSG_TYPE_LENGTH]),
            size: read_u64(data, MSG_SIZE_OFFSET),
        })
    }
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_ne_bytes(buf)
}

/// NUL-terminated (or full-width) C string, lossily decoded.
fn read_cstr(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
pub(crate) fn encode_for_test(
    flow: u8,
    peer_id: u64,
    addr: &str,
    conn: &str,
    msg: &str,
    size: u64,
) -> Vec<u8> {
    let mut raw = vec![0u8; RAW_EVENT_SIZE];
    raw[PEER_ID_OFFSET..PEER_ID_OFFSET + 8].copy_from_slice(&peer_id.to_ne_bytes());
    raw[PEER_ADDR_OFFSET..PEER_ADDR_OFFSET + addr.len()].copy_from_slice(addr.as_bytes());
    raw[CONN_TYPE_OFFSET..CONN_TYPE_OFFSET + conn.len()].copy_from_slice(conn.as_bytes());
    raw[MSG_TYPE_OFFSET..MSG_TYPE_OFFSET + msg.len()].copy_from_slice(msg.as_bytes());
    raw[MSG_SIZE_OFFSET..MSG_SIZE_OFFSET + 8].copy_from_slice(&size.to_ne_bytes());
    raw[FLOW_OFFSET] = flow;
    raw
}
