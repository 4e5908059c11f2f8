//! The node RPC methods we sample and how each reply is shaped.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value, json};

use crate::collector::CollectError;

const PEER_FIELDS: &[&str] = &[
    "id",
    "addr",
    "network",
    "services",
    "relaytxes",
    "minping",
    "version",
    "subver",
    "inbound",
    "addr_relay_enabled",
    "addr_processed",
    "minfeefilter",
    "connection_type",
    "bytessent",
    "bytesrecv",
];

const TXOUTSET_FIELDS: &[&str] = &[
    "height",
    "bestblock",
    "txouts",
    "bogosize",
    "hash_serialized_2",
    "hash_serialized_3",
    "total_amount",
    "transactions",
    "disk_size",
];

/// Networks reported by `getnodeaddresses`.
const NETWORKS: &[&str] = &["ipv4", "ipv6", "onion", "i2p", "cjdns"];

const ADDRMAN_TABLES: &[&str] = &["new", "tried"];
const ADDRMAN_FIELDS: &[&str] = &["address", "port", "network", "services", "time"];

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RpcMethod {
    GetConnectionCount,
    GetPeerInfo,
    GetTxOutSetInfo,
    GetNodeAddresses,
    GetRawAddrman,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 5] = [
        RpcMethod::GetConnectionCount,
        RpcMethod::GetPeerInfo,
        RpcMethod::GetTxOutSetInfo,
        RpcMethod::GetNodeAddresses,
        RpcMethod::GetRawAddrman,
    ];

    /// RPC method name; also the source name.
    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::GetConnectionCount => "getconnectioncount",
            RpcMethod::GetPeerInfo => "getpeerinfo",
            RpcMethod::GetTxOutSetInfo => "gettxoutsetinfo",
            RpcMethod::GetNodeAddresses => "getnodeaddresses",
            RpcMethod::GetRawAddrman => "getrawaddrman",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    pub fn params(&self) -> Vec<Value> {
        match self {
            // 0 = return every known address
            RpcMethod::GetNodeAddresses => vec![json!(0)],
            _ => Vec::new(),
        }
    }

    pub fn default_interval(&self) -> Duration {
        match self {
            RpcMethod::GetConnectionCount | RpcMethod::GetPeerInfo => Duration::from_secs(60),
            RpcMethod::GetNodeAddresses => Duration::from_secs(600),
            RpcMethod::GetTxOutSetInfo | RpcMethod::GetRawAddrman => DAY,
        }
    }

    /// Per-call timeout override. `gettxoutsetinfo` hashes the whole UTXO
    /// set and takes minutes on mainnet.
    pub fn default_timeout(&self) -> Option<Duration> {
        match self {
            RpcMethod::GetTxOutSetInfo => Some(Duration::from_secs(600)),
            _ => None,
        }
    }

    /// Turns the raw `result` into the persisted payload.
    pub fn shape(&self, result: Value) -> Result<Value, CollectError> {
        match self {
            RpcMethod::GetConnectionCount => shape_connection_count(result),
            RpcMethod::GetPeerInfo => shape_peer_info(result),
            RpcMethod::GetTxOutSetInfo => Ok(Value::Object(pick(as_object(&result, self)?, TXOUTSET_FIELDS))),
            RpcMethod::GetNodeAddresses => shape_node_addresses(result),
            RpcMethod::GetRawAddrman => shape_raw_addrman(result),
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn as_object<'a>(v: &'a Value, method: &RpcMethod) -> Result<&'a Map<String, Value>, CollectError> {
    v.as_object()
        .ok_or_else(|| CollectError::protocol(format!("{method}: expected an object")))
}

fn as_array<'a>(v: &'a Value, method: &RpcMethod) -> Result<&'a Vec<Value>, CollectError> {
    v.as_array()
        .ok_or_else(|| CollectError::protocol(format!("{method}: expected an array")))
}

/// Copies the listed fields that are present.
fn pick(obj: &Map<String, Value>, fields: &[&str]) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|f| obj.get(*f).map(|v| (f.to_string(), v.clone())))
        .collect()
}

fn shape_connection_count(result: Value) -> Result<Value, CollectError> {
    let count = result
        .as_u64()
        .ok_or_else(|| CollectError::protocol("getconnectioncount: expected an integer"))?;
    Ok(json!({ "connection_count": count }))
}

fn shape_peer_info(result: Value) -> Result<Value, CollectError> {
    let peers = as_array(&result, &RpcMethod::GetPeerInfo)?;
    let shaped: Vec<Value> = peers
        .iter()
        .filter_map(Value::as_object)
        .map(|p| Value::Object(pick(p, PEER_FIELDS)))
        .collect();
    Ok(json!({ "peer_count": shaped.len(), "peers": shaped }))
}

fn shape_node_addresses(result: Value) -> Result<Value, CollectError> {
    let addrs = as_array(&result, &RpcMethod::GetNodeAddresses)?;
    let mut counts: BTreeMap<&str, u64> = NETWORKS.iter().map(|n| (*n, 0)).collect();
    for addr in addrs {
        let network = addr.get("network").and_then(Value::as_str).unwrap_or("");
        if let Some(n) = counts.get_mut(network) {
            *n += 1;
        }
    }
    let mut payload: Map<String, Value> =
        counts.into_iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
    payload.insert("total".into(), json!(addrs.len()));
    Ok(Value::Object(payload))
}

/// `getrawaddrman` returns `{"new": {"bucket/position": {...}}, "tried": {...}}`;
/// flatten it into one entry list tagged with table and position.
fn shape_raw_addrman(result: Value) -> Result<Value, CollectError> {
    let tables = as_object(&result, &RpcMethod::GetRawAddrman)?;
    let mut entries = Vec::new();
    let mut payload = Map::new();
    for table in ADDRMAN_TABLES {
        let slots = tables.get(*table).and_then(Value::as_object);
        payload.insert(table.to_string(), json!(slots.map_or(0, |s| s.len())));
        for (position, entry) in slots.into_iter().flatten() {
            let Some(entry) = entry.as_object() else {
                continue;
            };
            let mut shaped = pick(entry, ADDRMAN_FIELDS);
            shaped.insert("table".into(), json!(table));
            shaped.insert("position".into(), json!(position));
            entries.push(Value::Object(shaped));
        }
    }
    payload.insert("entries".into(), Value::Array(entries));
    Ok(Value::Object(payload))
}
