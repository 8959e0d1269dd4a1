//! Edge server: socket ingress, membership, and bus fan-out.

pub mod bridge;
pub mod membership;
pub mod server;

pub use bridge::BusBridge;
pub use membership::{BroadcastOutcome, ConnId, Outbound, RoomMembership, CLOSE_GOING_AWAY};
pub use server::{handle_frame, parse_room, router, EdgeApp, FrameOutcome, CLOSE_INVALID_ROOM};
