//! Client-side coordinator for host-gated peer-to-peer meeting rooms.
//!
//! A participant joins a room through a signaling server; the host approves
//! waiting participants, and every approved pair negotiates one direct media
//! connection, with already-joined members initiating toward newcomers. The
//! [`room::RoomCoordinator`] dispatch loop owns all room state and publishes
//! [`room::RoomView`] snapshots for presentation.

pub mod admission;
pub mod audio;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod room;
pub mod signaling;

pub use config::RoomConfig;
pub use error::{Error, Result};
pub use room::{RoomCoordinator, RoomHandle, RoomView};
pub use signaling::{ParticipantInfo, SignalingClient, SignalingMessage};
