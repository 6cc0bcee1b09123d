//! Self-describing message envelope and its length-prefixed framing.
//!
//! Every message on the wire is a JSON map with a required `verb` key; the
//! verb alone drives dispatch on the receiver. Frames are length-prefixed
//! so a receiver can stream-decode without lookahead.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown verb or malformed payload; fatal to this message only.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The recognised verbs and their payloads.
///
/// `ack_id` on broker-outbound messages identifies the expected
/// acknowledgement; `extras` on [`Message::AckMsg`] carries the freeform
/// keys (status, result, db_id, crash detail) that ride along with an ack.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Message {
    ClientStartup {
        client_type: String,
    },
    ClientReady {
        queue: String,
    },
    DbReady,
    NewTestCase {
        /// The producer's ack id for this test; also its duplicate key.
        id: u64,
        data: Vec<u8>,
        crc32: u32,
        queue: String,
        tag: String,
        #[serde(default)]
        options: Value,
    },
    Deliver {
        ack_id: u64,
        data: Vec<u8>,
        server_id: u64,
        producer_ack_id: u64,
        crc32: u32,
        tag: String,
        #[serde(default)]
        options: Value,
    },
    TestResult {
        ack_id: u64,
        server_id: u64,
        status: String,
        data: Vec<u8>,
        detail: String,
        queue: String,
        tag: String,
        crc32: u32,
        #[serde(default)]
        template_hash: Option<String>,
    },
    AckMsg {
        ack_id: u64,
        #[serde(flatten)]
        extras: BTreeMap<String, Value>,
    },
    /// Broker-initiated request that a producer re-announce itself.
    Reset,
}

impl Message {
    /// Convenience constructor for an ack without extras.
    pub fn ack(ack_id: u64) -> Self {
        Message::AckMsg {
            ack_id,
            extras: BTreeMap::new(),
        }
    }

    /// An ack carrying extra keys.
    pub fn ack_with(ack_id: u64, extras: Vec<(&str, Value)>) -> Self {
        Message::AckMsg {
            ack_id,
            extras: extras
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

/// Serializes a message to one frame payload.
pub fn encode_message(msg: &Message) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

/// Decodes one frame payload; unknown verbs come back as
/// [`ProtocolError::Malformed`] and poison only that frame.
pub fn decode_message(bytes: &[u8]) -> Result<Message, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Wraps a TCP stream in the length-prefixed codec shared by every
/// component.
pub fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    Framed::new(stream, LengthDelimitedCodec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_tag_round_trips() {
        let msg = Message::NewTestCase {
            id: 1,
            data: vec![0, 1],
            crc32: 0xB6CC_4292,
            queue: "default".to_string(),
            tag: "t".to_string(),
            options: Value::Null,
        };
        let encoded = encode_message(&msg).unwrap();
        let json: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(json["verb"], "new_test_case");
        assert_eq!(decode_message(&encoded).unwrap(), msg);
    }

    #[test]
    fn unit_verbs_serialize_as_bare_maps() {
        let encoded = encode_message(&Message::DbReady).unwrap();
        let json: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(json, serde_json::json!({"verb": "db_ready"}));
    }

    #[test]
    fn ack_extras_flatten_into_the_map() {
        let msg = Message::ack_with(
            7,
            vec![
                ("result", Value::from("success")),
                ("db_id", Value::from(42)),
            ],
        );
        let encoded = encode_message(&msg).unwrap();
        let json: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(json["verb"], "ack_msg");
        assert_eq!(json["ack_id"], 7);
        assert_eq!(json["result"], "success");
        assert_eq!(json["db_id"], 42);

        match decode_message(&encoded).unwrap() {
            Message::AckMsg { ack_id, extras } => {
                assert_eq!(ack_id, 7);
                assert_eq!(extras["result"], "success");
            }
            other => panic!("wrong decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_verb_is_a_malformed_message() {
        let err = decode_message(br#"{"verb":"warp_drive"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        let err = decode_message(b"not json at all").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
