//! Client side of the entity replication protocol.
//!
//! Game logic consumes this crate through a narrow surface: implement
//! [`EntityBehavior`] for each entity type, register the types by prefab
//! name in a [`PrefabRegistry`], then drive a [`Session`] once per tick.
//! The session owns the connection and every live [`Entity`]; behaviors
//! only ever see their own entity through the hook context.

pub mod entity;
pub mod session;

pub use entity::{CreateParams, Entity, EntityBehavior, EntityCtx, PrefabRegistry, Transform};
pub use session::{ConnectionStatus, Session, SessionError};
