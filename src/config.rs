use std::env;

use crate::signaling::ParticipantInfo;

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:5000";
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Everything needed to join (or create) one meeting room.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub signaling_url: String,
    pub room_id: String,
    pub participant: ParticipantInfo,
    /// The host created the room and is its first approved member; only the
    /// host sees the waiting list and may admit others.
    pub is_host: bool,
    pub ice_servers: Vec<String>,
}

impl RoomConfig {
    pub fn new(room_id: impl Into<String>, participant: ParticipantInfo, is_host: bool) -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            room_id: room_id.into(),
            participant,
            is_host,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }

    pub fn from_env() -> Self {
        let participant = ParticipantInfo {
            name: env::var("DISPLAY_NAME")
                .unwrap_or_else(|_| format!("guest-{}", rand::random::<u32>())),
            email: env::var("USER_EMAIL").unwrap_or_else(|_| "guest@local".to_string()),
        };

        Self {
            signaling_url: env::var("SIGNALING_URL")
                .unwrap_or_else(|_| DEFAULT_SIGNALING_URL.to_string()),
            room_id: env::var("ROOM_ID").unwrap_or_else(|_| "main".to_string()),
            participant,
            is_host: env::var("ROOM_HOST")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            ice_servers: env::var("STUN_SERVER")
                .map(|s| vec![s])
                .unwrap_or_else(|_| vec![DEFAULT_STUN_SERVER.to_string()]),
        }
    }
}
