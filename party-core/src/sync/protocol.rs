//! Party Protocol Messages
//!
//! Everything that travels over the party channel is a JSON envelope
//! `{"type": ..., "payload": ...}`. Client actions are typed here so they are
//! validated once, at the boundary, before they reach the party state.

use serde::{Deserialize, Deserializer, Serialize};

/// Identity of a connected member (the `user_id` of the channel)
pub type MemberId = String;

/// Identity of a party (a party code, see [`crate::party_code`])
pub type PartyId = String;

/// Catalog identity of a track
pub type TrackId = String;

/// Who may author changes in a party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyMode {
    /// Only the host may change playback
    #[default]
    Host,
    /// Every member may change playback
    Democratic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off,
    All,
    One,
}

/// A party member as shown to other members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
}

/// Playback commands a member can issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlayerAction {
    Play,
    Pause,
    Seek {
        #[serde(rename = "currentTime")]
        current_time: f64,
    },
    ChangeTrack {
        #[serde(deserialize_with = "track_id_from_any")]
        track_id: TrackId,
    },
    NextTrack,
    PrevTrack,
    SetVolume {
        volume: f32,
    },
}

impl PlayerAction {
    pub fn name(&self) -> &'static str {
        match self {
            PlayerAction::Play => "play",
            PlayerAction::Pause => "pause",
            PlayerAction::Seek { .. } => "seek",
            PlayerAction::ChangeTrack { .. } => "change_track",
            PlayerAction::NextTrack => "next_track",
            PlayerAction::PrevTrack => "prev_track",
            PlayerAction::SetVolume { .. } => "set_volume",
        }
    }
}

/// Queue edits a member can issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum QueueAction {
    Add {
        #[serde(deserialize_with = "track_id_from_any")]
        track_id: TrackId,
    },
    Remove {
        position: usize,
    },
    Clear,
}

impl QueueAction {
    pub fn name(&self) -> &'static str {
        match self {
            QueueAction::Add { .. } => "add",
            QueueAction::Remove { .. } => "remove",
            QueueAction::Clear => "clear",
        }
    }
}

/// Messages sent by a client to the party server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    // === Lobby ===
    /// Register the display name for this connection
    UserJoin { name: String },

    /// Create a party and become its host
    CreateParty {},

    /// Join an existing party by code
    JoinParty { party_id: PartyId },

    /// Leave the current party
    LeaveParty {},

    // === Playback (authority + admission checked) ===
    PlayerAction(PlayerAction),

    QueueAction(QueueAction),

    ToggleShuffle {},

    SetRepeatMode { mode: RepeatMode },

    // === Host only ===
    /// Switch between host and democratic mode
    SetMode { mode: PartyMode },

    /// Hand host privileges to another member
    TransferHost { member_id: MemberId },

    /// Periodic live position report from the host
    SyncUpdate {
        #[serde(rename = "currentTime")]
        current_time: f64,
        is_playing: bool,
    },
}

impl ClientMessage {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::UserJoin { .. } => "user_join",
            ClientMessage::CreateParty {} => "create_party",
            ClientMessage::JoinParty { .. } => "join_party",
            ClientMessage::LeaveParty {} => "leave_party",
            ClientMessage::PlayerAction(action) => action.name(),
            ClientMessage::QueueAction(action) => action.name(),
            ClientMessage::ToggleShuffle {} => "toggle_shuffle",
            ClientMessage::SetRepeatMode { .. } => "set_repeat_mode",
            ClientMessage::SetMode { .. } => "set_mode",
            ClientMessage::TransferHost { .. } => "transfer_host",
            ClientMessage::SyncUpdate { .. } => "sync_update",
        }
    }

    /// Whether this message is a user-initiated playback mutation
    pub fn is_playback_mutation(&self) -> bool {
        matches!(
            self,
            ClientMessage::PlayerAction(_)
                | ClientMessage::QueueAction(_)
                | ClientMessage::ToggleShuffle {}
                | ClientMessage::SetRepeatMode { .. }
        )
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Authoritative copy of a party's playback timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub party_id: PartyId,
    /// Incremented by the server on every committed change
    pub version: u64,
    pub host_id: MemberId,
    pub mode: PartyMode,
    pub members: Vec<Member>,
    pub queue: Vec<TrackId>,
    /// Index into `queue`, or -1 when nothing is selected
    pub current_index: i64,
    pub current_track_id: Option<TrackId>,
    /// Playback offset in seconds
    #[serde(rename = "currentTime")]
    pub current_time: f64,
    pub is_playing: bool,
    pub repeat_mode: RepeatMode,
    pub is_shuffled: bool,
    pub volume: f32,
    /// Member whose action produced this version, if any
    pub last_actor: Option<MemberId>,
    /// Server wall clock when the snapshot was taken (ms since epoch)
    pub sent_at_ms: u64,
}

impl Snapshot {
    pub fn current_index(&self) -> Option<usize> {
        usize::try_from(self.current_index).ok()
    }

    pub fn is_host(&self, member_id: &str) -> bool {
        self.host_id == member_id
    }
}

/// One line of the lobby's party list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartySummary {
    pub party_id: PartyId,
    pub host_name: String,
    pub member_count: usize,
    pub current_track_id: Option<TrackId>,
    pub current_track_title: Option<String>,
    pub mode: PartyMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Authority denial: the caller may not author this change
    NotPermitted,
    /// Admission denial: the caller acted too soon after its last action
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PartyNotFound,
    NotInParty,
    AlreadyInParty,
    TrackNotInQueue,
    InvalidPosition,
    InvalidTime,
    MemberNotFound,
    InvalidMessage,
    Internal,
}

/// Messages sent by the party server to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full authoritative state of the caller's party
    PartySync(Snapshot),

    /// Lobby roster and party list
    StateUpdate {
        users: Vec<Member>,
        parties: Vec<PartySummary>,
    },

    ActionRejected { reason: RejectReason },

    Error { code: ErrorCode, message: String },

    /// The party was dissolved while the receiver was a member
    PartyEnded { party_id: PartyId, reason: String },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Get current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Catalog ids are integers on some servers; accept either form.
pub fn track_id_from_any<'de, D>(deserializer: D) -> Result<TrackId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(id) => id,
        RawId::Number(id) => id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_player_action_wire_format() {
        let msg = ClientMessage::from_json(
            r#"{"type":"player_action","payload":{"action":"seek","currentTime":42.5}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::PlayerAction(PlayerAction::Seek { current_time: 42.5 })
        );
        assert_eq!(msg.kind(), "seek");
        assert!(msg.is_playback_mutation());
    }

    #[test]
    fn test_numeric_track_id_accepted() {
        let msg = ClientMessage::from_json(
            r#"{"type":"queue_action","payload":{"action":"add","track_id":17}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::QueueAction(QueueAction::Add {
                track_id: "17".to_string()
            })
        );
    }

    #[test]
    fn test_empty_payload_messages() {
        let encoded = ClientMessage::CreateParty {}.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, json!({"type": "create_party", "payload": {}}));

        let decoded =
            ClientMessage::from_json(r#"{"type":"leave_party","payload":{}}"#).unwrap();
        assert_eq!(decoded, ClientMessage::LeaveParty {});
    }

    #[test]
    fn test_unknown_message_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"chat","payload":{"text":"hi"}}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_server_error_code_format() {
        let msg = ServerMessage::error(ErrorCode::PartyNotFound, "no such party");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "PARTY_NOT_FOUND");

        let rejected = ServerMessage::ActionRejected {
            reason: RejectReason::RateLimited,
        };
        let value: serde_json::Value =
            serde_json::from_str(&rejected.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"]["reason"], "rate_limited");
    }

    #[test]
    fn test_snapshot_index_conversion() {
        let snapshot = Snapshot {
            party_id: "ABCDEFGH".into(),
            version: 3,
            host_id: "alice".into(),
            mode: PartyMode::Host,
            members: vec![],
            queue: vec![],
            current_index: -1,
            current_track_id: None,
            current_time: 0.0,
            is_playing: false,
            repeat_mode: RepeatMode::Off,
            is_shuffled: false,
            volume: 1.0,
            last_actor: None,
            sent_at_ms: 0,
        };
        assert_eq!(snapshot.current_index(), None);
        assert!(snapshot.is_host("alice"));

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["currentTime"], 0.0);
        assert_eq!(value["repeat_mode"], "off");
    }
}
