//! Wire protocol messages exchanged between nodes.

use serde::{Deserialize, Serialize};

use crate::chain::Score;
use crate::types::Block;

/// Serialisable summary of a [`Score`], carried on the wire so a peer can
/// tell at a glance whether it's behind without decoding a whole chain.
/// `Score`'s own `Reverse<String>` tie-breaker isn't meaningfully portable
/// (it only matters relative to another local score), so this drops it and
/// keeps just the two totals fork-choice compares first. The derived `Ord`
/// compares `primary` before `secondary`, same as `Score` itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub primary: u128,
    pub secondary: u64,
}

impl From<&Score> for ScoreSummary {
    fn from(score: &Score) -> Self {
        Self {
            primary: score.primary,
            secondary: score.secondary,
        }
    }
}

/// A gossip protocol message.
///
/// Serialised as `{"kind": "...", "payload": ...}` so peers running a
/// newer message set can still dispatch on `kind` before deserialising an
/// unfamiliar payload shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// Sent immediately after connecting, identifying the sender and its
    /// current tip so the peer can decide whether to request a catch-up.
    Hello {
        node_id: u64,
        tip_hash: Option<String>,
        tip_score: Option<ScoreSummary>,
    },
    /// Gossip of a single newly produced or relayed block.
    Block { block: Block },
    /// Requests a specific block by hash, e.g. to resolve an orphan.
    GetBlock { hash: String },
    /// Response to a `GetBlock` or a multi-block catch-up.
    Blocks { blocks: Vec<Block> },
    /// Liveness probe, carrying the sender's wall-clock time.
    Ping { timestamp: u64 },
    /// Reply to a [`Message::Ping`], echoing its timestamp.
    Pong { timestamp: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message::Blocks {
            blocks: vec![Block::genesis()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn hello_tag_is_stable_and_carries_tip_info() {
        let json = serde_json::to_value(Message::Hello {
            node_id: 3,
            tip_hash: Some("abc".to_string()),
            tip_score: Some(ScoreSummary {
                primary: 5,
                secondary: 0,
            }),
        })
        .unwrap();
        assert_eq!(json["kind"], "hello");
        assert_eq!(json["payload"]["node_id"], 3);
        assert_eq!(json["payload"]["tip_hash"], "abc");
        assert_eq!(json["payload"]["tip_score"]["primary"], 5);
    }

    #[test]
    fn block_singular_round_trips() {
        let msg = Message::Block {
            block: Block::genesis(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn ping_pong_carry_timestamp() {
        let json = serde_json::to_value(Message::Ping { timestamp: 123 }).unwrap();
        assert_eq!(json["payload"]["timestamp"], 123);
    }
}
