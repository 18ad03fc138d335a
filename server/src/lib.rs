//! Authoritative server for the entity replication protocol.
//!
//! The server owns the only true copy of the world: every replicated entity
//! exists here as a [`Representation`] holding the last-known serialized
//! bytes of its fields. Connected clients see a per-client subset of that
//! world, decided each tick by proximity to their player ([`engine`]), and
//! the whole world survives restarts through the one-file-per-representation
//! save format ([`persist`]).
//!
//! Everything runs on a single tick-driven thread; see
//! [`ServerEngine::tick`](engine::ServerEngine::tick).

pub mod connection;
pub mod engine;
pub mod persist;
pub mod representation;
pub mod world;

pub use engine::{ServerConfig, ServerEngine, ServerError};
pub use persist::PersistError;
pub use representation::{Representation, DEFAULT_RADIUS};
pub use world::World;
