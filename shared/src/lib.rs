//! Protocol definitions shared by the replication client and server.
//!
//! Everything that must agree byte-for-byte across the wire lives here:
//! primitive encoding ([`codec`]), message framing ([`frame`]), message
//! types and payload layouts ([`message`]), and the delta-tracked fields
//! ([`field`], [`schema`]) that drive variable replication.

pub mod codec;
pub mod field;
pub mod frame;
pub mod message;
pub mod schema;

pub use field::{DeltaField, FieldValue, DEFAULT_LERP_RATE};
pub use frame::{frame_message, FrameBuffer, SendQueue, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use message::{
    ClientMessage, CreatePayload, CreationSuccessPayload, ForceCreatePayload, LoginPayload,
    RepSnapshot, ServerMessage, VariableUpdatePayload, NO_PARENT,
};
pub use schema::{EntityFields, FieldHandle, FieldRegistry, POS_X, POS_Y, POS_Z};

// Re-exported so downstream crates use the exact math types the wire encodes.
pub use glam::{Quat, Vec3};
