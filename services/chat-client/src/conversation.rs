//! Room resource wire types

use chat_channel::{ChannelId, Message};
use serde::{Deserialize, Serialize};

/// A conversation between the user and one other participant.
///
/// Field names follow the server (`chatRoomId`, `userId`, `sellerId`); the
/// generic names are accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(rename = "chatRoomId", alias = "channelId")]
    pub channel_id: ChannelId,
    #[serde(rename = "userId", alias = "participantId", default)]
    pub participant_id: Option<i64>,
    #[serde(rename = "sellerId", alias = "otherParticipantId", default)]
    pub other_participant_id: Option<i64>,
    /// History at the time of the fetch
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Body of `POST /v1/chatRoom`.
#[derive(Debug, Serialize)]
pub struct OpenConversation {
    #[serde(rename = "sellerId")]
    pub other_participant_id: i64,
}
