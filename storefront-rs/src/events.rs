//! What the server pushes (and the client sends) on each channel.
//! Frames look like `{"topic": "cart-updated", "payload": {...}}`.

use chrono::{DateTime, Utc};
use tandem::{ChannelEvent, ChannelId};

use crate::entities::{Balance, CartLine, Order};

pub const COMMERCE: ChannelId = ChannelId("commerce-events");
pub const CHAT: ChannelId = ChannelId("chat");

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
pub enum CommerceEvent {
    OrderUpdated(Order),
    CartUpdated(CartUpdate),
    FavoriteUpdated(FavoriteUpdate),
    BalanceUpdated(Balance),
    AnnouncementUpdated(Announcement),
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, tsify::Tsify,
)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "kebab-case")]
pub enum CommerceTopic {
    OrderUpdated,
    CartUpdated,
    FavoriteUpdated,
    BalanceUpdated,
    AnnouncementUpdated,
}

impl ChannelEvent for CommerceEvent {
    type Topic = CommerceTopic;

    fn topic(&self) -> CommerceTopic {
        match self {
            CommerceEvent::OrderUpdated(_) => CommerceTopic::OrderUpdated,
            CommerceEvent::CartUpdated(_) => CommerceTopic::CartUpdated,
            CommerceEvent::FavoriteUpdated(_) => CommerceTopic::FavoriteUpdated,
            CommerceEvent::BalanceUpdated(_) => CommerceTopic::BalanceUpdated,
            CommerceEvent::AnnouncementUpdated(_) => CommerceTopic::AnnouncementUpdated,
        }
    }
}

/// The server either sends the whole cart or a single line.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(untagged, rename_all = "camelCase")]
pub enum CartUpdate {
    #[serde(rename_all = "camelCase")]
    Replace {
        items: Vec<CartLine>,
        updated_at: DateTime<Utc>,
    },
    /// Sets one line's quantity; 0 removes it.
    #[serde(rename_all = "camelCase")]
    Line { item_id: String, qty: u32 },
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteUpdate {
    pub product_id: String,
    pub favorited: bool,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: String,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
pub enum ChatEvent {
    RoomJoin(RoomMember),
    RoomLeave(RoomMember),
    MessageSend(OutgoingMessage),
    NewMessage(ChatMessage),
    Typing(RoomMember),
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, tsify::Tsify,
)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "kebab-case")]
pub enum ChatTopic {
    RoomJoin,
    RoomLeave,
    MessageSend,
    NewMessage,
    Typing,
}

impl ChannelEvent for ChatEvent {
    type Topic = ChatTopic;

    fn topic(&self) -> ChatTopic {
        match self {
            ChatEvent::RoomJoin(_) => ChatTopic::RoomJoin,
            ChatEvent::RoomLeave(_) => ChatTopic::RoomLeave,
            ChatEvent::MessageSend(_) => ChatTopic::MessageSend,
            ChatEvent::NewMessage(_) => ChatTopic::NewMessage,
            ChatEvent::Typing(_) => ChatTopic::Typing,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub room_id: String,
    /// Lets the sender match the server's `new-message` echo to what it sent.
    pub client_id: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: String,
    pub room_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cart_line_frame_decodes() {
        let event =
            CommerceEvent::decode(r#"{"topic":"cart-updated","payload":{"itemId":"a","qty":2}}"#)
                .unwrap();
        assert_eq!(
            event,
            CommerceEvent::CartUpdated(CartUpdate::Line {
                item_id: "a".to_string(),
                qty: 2
            })
        );
        assert_eq!(event.topic(), CommerceTopic::CartUpdated);
    }

    #[test]
    fn full_cart_frame_decodes() {
        let event = CommerceEvent::decode(
            r#"{"topic":"cart-updated","payload":{"items":[{"itemId":"a","qty":1}],"updatedAt":"2025-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        let CommerceEvent::CartUpdated(CartUpdate::Replace { items, .. }) = event else {
            panic!("expected a full cart, got {event:?}");
        };
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn unknown_topics_are_rejected() {
        assert!(CommerceEvent::decode(r#"{"topic":"auction-bid","payload":{}}"#).is_err());
    }

    #[test]
    fn chat_events_encode_with_kebab_case_topics() {
        let frame = ChatEvent::Typing(RoomMember {
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
        })
        .encode()
        .unwrap();
        assert_eq!(
            frame,
            r#"{"topic":"typing","payload":{"roomId":"r1","userId":"u1"}}"#
        );
    }
}
