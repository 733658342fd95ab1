//! Debug snapshot codec.
//!
//! The wire format is five successively encoded JSON values: node name,
//! namespace map, pod map, list map, set map. Decode accepts exactly that
//! order and rejects both truncation and trailing data.

use crate::error::{Error, Result};
use crate::state::{NamespaceRecord, PodRecord};

use polman_dataplane::ipset::SetEntry;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub node_name: String,
    pub ns_map: HashMap<String, NamespaceRecord>,
    pub pod_map: HashMap<String, PodRecord>,
    pub list_map: HashMap<String, SetEntry>,
    pub set_map: HashMap<String, SetEntry>,
}

impl Snapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        encode_value(&mut buf, &self.node_name)?;
        encode_value(&mut buf, &self.ns_map)?;
        encode_value(&mut buf, &self.pod_map)?;
        encode_value(&mut buf, &self.list_map)?;
        encode_value(&mut buf, &self.set_map)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter();

        let snapshot = Self {
            node_name: next_value(&mut stream, "node name")?,
            ns_map: next_value(&mut stream, "namespace map")?,
            pod_map: next_value(&mut stream, "pod map")?,
            list_map: next_value(&mut stream, "list map")?,
            set_map: next_value(&mut stream, "set map")?,
        };

        if stream.next().is_some() {
            return Err(Error::MissingData(
                "snapshot stream carries trailing data".to_string(),
            ));
        }
        Ok(snapshot)
    }
}

fn encode_value(buf: &mut Vec<u8>, value: &impl Serialize) -> Result<()> {
    serde_json::to_writer(&mut *buf, value)
        .map_err(|e| Error::SerializationError("failed to encode snapshot value".to_string(), e))
}

fn next_value<'de, R, T>(
    stream: &mut serde_json::StreamDeserializer<'de, R, serde_json::Value>,
    field: &str,
) -> Result<T>
where
    R: serde_json::de::Read<'de>,
    T: DeserializeOwned,
{
    let value = stream
        .next()
        .ok_or_else(|| Error::MissingData(format!("snapshot stream ended before {field}")))?
        .map_err(|e| Error::SerializationError(format!("malformed snapshot {field}"), e))?;
    serde_json::from_value(value)
        .map_err(|e| Error::SerializationError(format!("unexpected snapshot {field}"), e))
}
