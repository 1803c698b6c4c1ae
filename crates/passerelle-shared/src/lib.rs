//! Types shared between the Passerelle bridge core and its collaborators:
//! identifiers, the room-side event content model, capability descriptors,
//! and the message-status error surface.

pub mod capabilities;
pub mod event;
pub mod ids;
pub mod status;

pub use capabilities::{NetworkFeatures, RoomCapabilities, ServerCapabilities};
pub use ids::{
    ChatId, EmojiId, EventId, FileUrl, LoginId, PartId, PortalKey, RemoteMessageId, RemoteUserId,
    RoomId, RoomTag, RoomUserId,
};
pub use status::{BridgeError, ErrorReason, MessageStatus, StatusKind, StatusTarget};
