//! ---
//! permdir_section: "02-messaging-replication"
//! permdir_subsection: "module"
//! permdir_type: "source"
//! permdir_scope: "code"
//! permdir_description: "Channel message envelopes, bus abstraction, and payload codecs."
//! permdir_version: "v0.1.0"
//! permdir_owner: "tbd"
//! ---
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Serialization format used for channel message payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadCodec {
    /// UTF-8 JSON, easy to inspect on the wire.
    #[default]
    Json,
    /// Compact binary CBOR.
    Cbor,
}

impl PayloadCodec {
    /// Encode a value into payload bytes.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(match self {
            PayloadCodec::Json => serde_json::to_vec(value)?,
            PayloadCodec::Cbor => serde_cbor::to_vec(value)?,
        })
    }

    /// Decode payload bytes into a value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(match self {
            PayloadCodec::Json => serde_json::from_slice(bytes)?,
            PayloadCodec::Cbor => serde_cbor::from_slice(bytes)?,
        })
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            PayloadCodec::Json => "json",
            PayloadCodec::Cbor => "cbor",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn both_codecs_preserve_structured_payloads() {
        let mut value = BTreeMap::new();
        value.insert("group".to_string(), vec!["admin".to_string(), "default".to_string()]);

        for codec in [PayloadCodec::Json, PayloadCodec::Cbor] {
            let bytes = codec.encode(&value).expect("encode");
            let decoded: BTreeMap<String, Vec<String>> = codec.decode(&bytes).expect("decode");
            assert_eq!(decoded, value, "codec {}", codec.name());
        }
    }

    #[test]
    fn borrowed_collections_encode_like_owned_ones() {
        let owned = vec!["admin".to_string(), "default".to_string()];
        let borrowed: Vec<&String> = owned.iter().collect();

        for codec in [PayloadCodec::Json, PayloadCodec::Cbor] {
            let bytes = codec.encode(&borrowed).expect("encode");
            assert_eq!(bytes, codec.encode(&owned).expect("encode"));
            let decoded: Vec<String> = codec.decode(&bytes).expect("decode");
            assert_eq!(decoded, owned, "codec {}", codec.name());
        }
    }

    #[test]
    fn garbage_input_is_an_error() {
        assert!(PayloadCodec::Json.decode::<Vec<String>>(b"{not json").is_err());
        assert!(PayloadCodec::Cbor.decode::<Vec<String>>(&[0xff, 0x00]).is_err());
    }
}
