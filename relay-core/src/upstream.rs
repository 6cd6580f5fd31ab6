//! Upstream feed wire format
//!
//! Requests are `{"op": ..., "args": [...]}` frames. Data frames carry a
//! `topic`, a `type` of `snapshot` or `delta`, and the book levels in `data`.

use serde::{Deserialize, Serialize};

use crate::book::{BookKey, WireLevel};
use crate::error::{RelayError, RelayResult};

/// Update id the upstream uses after a service restart
pub const RESTART_UPDATE_ID: u64 = 1;

// ============================================================================
// Data messages
// ============================================================================

/// Kind of book message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookMessageType {
    /// Full replacement of both sides
    Snapshot,
    /// Incremental upsert/delete patch
    Delta,
}

/// Order-book data message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookMessage {
    pub topic: String,
    #[serde(rename = "type")]
    pub message_type: BookMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    pub data: BookData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookData {
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(rename = "b", default)]
    pub bids: Vec<WireLevel>,
    #[serde(rename = "a", default)]
    pub asks: Vec<WireLevel>,
    #[serde(rename = "u")]
    pub update_id: u64,
    #[serde(default)]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl BookMessage {
    /// Whether this message carries the restart sentinel update id
    pub fn is_restart(&self) -> bool {
        self.data.update_id == RESTART_UPDATE_ID
    }

    /// Message timestamp, preferring the envelope over the payload
    pub fn timestamp(&self) -> Option<i64> {
        self.ts.or(self.data.ts)
    }

    /// Key of the book this message belongs to
    pub fn key(&self) -> RelayResult<BookKey> {
        BookKey::from_topic(&self.topic)
    }
}

// ============================================================================
// Control messages
// ============================================================================

/// Acknowledgment or heartbeat response from the upstream
#[derive(Debug, Clone, Deserialize)]
pub struct ControlMessage {
    pub op: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub ret_msg: Option<String>,
    #[serde(default)]
    pub conn_id: Option<String>,
}

impl ControlMessage {
    /// Whether this acknowledges a heartbeat
    pub fn is_pong(&self) -> bool {
        self.op == "pong" || (self.op == "ping" && self.ret_msg.as_deref() == Some("pong"))
    }
}

/// Any frame received from the upstream
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UpstreamFrame {
    Book(BookMessage),
    Control(ControlMessage),
}

impl UpstreamFrame {
    pub fn parse(text: &str) -> RelayResult<Self> {
        serde_json::from_str(text).map_err(|e| RelayError::parse(format!("upstream frame: {}", e)))
    }
}

/// Rewrite a message's `type` to `snapshot`, keeping every other field
pub fn retag_as_snapshot(text: &str) -> RelayResult<String> {
    let mut value: serde_json::Value = serde_json::from_str(text)?;
    match value.as_object_mut() {
        Some(object) => {
            object.insert("type".to_string(), serde_json::Value::from("snapshot"));
            Ok(value.to_string())
        }
        None => Err(RelayError::parse("book message is not a JSON object")),
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamOp {
    Subscribe,
    Unsubscribe,
    Ping,
}

/// Request sent to the upstream
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub op: UpstreamOp,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl UpstreamRequest {
    pub fn subscribe(keys: &[BookKey]) -> Self {
        Self {
            op: UpstreamOp::Subscribe,
            args: keys.iter().map(BookKey::topic).collect(),
        }
    }

    pub fn unsubscribe(keys: &[BookKey]) -> Self {
        Self {
            op: UpstreamOp::Unsubscribe,
            args: keys.iter().map(BookKey::topic).collect(),
        }
    }

    pub fn ping() -> Self {
        Self {
            op: UpstreamOp::Ping,
            args: Vec::new(),
        }
    }

    pub fn to_json(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Depth;

    const SNAPSHOT: &str = r#"{
        "topic": "orderbook.50.BTCUSDT",
        "type": "snapshot",
        "ts": 1672304484978,
        "data": {
            "s": "BTCUSDT",
            "b": [["16493.50", "0.006"], ["16493.00", "0.100"]],
            "a": [["16611.00", "0.029"]],
            "u": 18521288,
            "seq": 7961638724
        },
        "cts": 1672304484976
    }"#;

    #[test]
    fn test_parse_snapshot() {
        let frame = UpstreamFrame::parse(SNAPSHOT).unwrap();
        let UpstreamFrame::Book(book) = frame else {
            panic!("expected a book message");
        };

        assert_eq!(book.message_type, BookMessageType::Snapshot);
        assert_eq!(book.data.bids.len(), 2);
        assert_eq!(book.data.asks[0], WireLevel::new("16611.00", "0.029"));
        assert_eq!(book.data.update_id, 18521288);
        assert_eq!(book.data.seq, 7961638724);
        assert_eq!(book.timestamp(), Some(1672304484978));
        assert!(!book.is_restart());
        assert_eq!(book.key().unwrap().symbol, "BTCUSDT");
    }

    #[test]
    fn test_parse_delta_without_sides() {
        let text = r#"{"topic":"orderbook.1.ETHUSDT","type":"delta","data":{"b":[],"u":1}}"#;
        let UpstreamFrame::Book(book) = UpstreamFrame::parse(text).unwrap() else {
            panic!("expected a book message");
        };
        assert_eq!(book.message_type, BookMessageType::Delta);
        assert!(book.data.asks.is_empty());
        assert!(book.is_restart());
        assert_eq!(book.timestamp(), None);
    }

    #[test]
    fn test_parse_control_frames() {
        let ack = r#"{"success":true,"ret_msg":"","conn_id":"abc","op":"subscribe"}"#;
        let UpstreamFrame::Control(ack) = UpstreamFrame::parse(ack).unwrap() else {
            panic!("expected a control message");
        };
        assert_eq!(ack.op, "subscribe");
        assert_eq!(ack.success, Some(true));
        assert!(!ack.is_pong());

        let pong = r#"{"success":true,"ret_msg":"pong","conn_id":"abc","op":"ping"}"#;
        let UpstreamFrame::Control(pong) = UpstreamFrame::parse(pong).unwrap() else {
            panic!("expected a control message");
        };
        assert!(pong.is_pong());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(UpstreamFrame::parse("not json").is_err());
        assert!(UpstreamFrame::parse(r#"{"topic":"orderbook.50.BTCUSDT"}"#).is_err());
    }

    #[test]
    fn test_requests() {
        let depth = Depth::new(200).unwrap();
        let keys = vec![
            BookKey::new("BTCUSDT", depth).unwrap(),
            BookKey::new("ETHUSDT", depth).unwrap(),
        ];

        assert_eq!(
            UpstreamRequest::subscribe(&keys).to_json().unwrap(),
            r#"{"op":"subscribe","args":["orderbook.200.BTCUSDT","orderbook.200.ETHUSDT"]}"#
        );
        assert_eq!(
            UpstreamRequest::unsubscribe(&keys[..1]).to_json().unwrap(),
            r#"{"op":"unsubscribe","args":["orderbook.200.BTCUSDT"]}"#
        );
        assert_eq!(UpstreamRequest::ping().to_json().unwrap(), r#"{"op":"ping"}"#);
    }

    #[test]
    fn test_retag_keeps_other_fields() {
        let text = r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","cts":5,"data":{"u":1}}"#;
        let retagged: serde_json::Value =
            serde_json::from_str(&retag_as_snapshot(text).unwrap()).unwrap();
        assert_eq!(retagged["type"], "snapshot");
        assert_eq!(retagged["cts"], 5);
        assert_eq!(retagged["data"]["u"], 1);

        assert!(retag_as_snapshot("[1,2]").is_err());
    }
}
