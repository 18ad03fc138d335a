//! Server-side shadows of client entities.
//!
//! A [`Representation`] stores the last-known serialized bytes of every
//! field rather than live values; the server never interprets game state
//! beyond the three reserved position fields it needs for proximity tests.
//! The same byte blocks feed snapshots for new observers and the on-disk
//! save format.

use glam::Vec3;

use shared::codec::read_f32;
use shared::message::{RepSnapshot, NO_PARENT};
use shared::schema::RESERVED_FIELDS;

/// Bounding radius applied to every representation. The pinned wire and
/// disk formats carry no radius field, so it is not negotiable per entity.
pub const DEFAULT_RADIUS: f32 = 5.0;

/// Authoritative shadow of one replicated entity.
pub struct Representation {
    pub network_id: i32,
    pub parent: Option<i32>,
    pub children: Vec<i32>,
    pub local_prefab: String,
    pub remote_prefab: String,
    pub radius: f32,
    fields: Vec<Vec<u8>>,
    /// Decoded copy of fields 0-2, refreshed on every write to them.
    position: Vec3,
}

impl Representation {
    /// Builds a representation from a full field snapshot.
    ///
    /// # Panics
    /// Panics when the snapshot has fewer fields than the reserved position
    /// prefix, or when any position field is not exactly 4 bytes. The
    /// registration contract puts position at indices 0-2 on every
    /// participant; anything else is a protocol violation.
    pub fn new(
        network_id: i32,
        parent: Option<i32>,
        local_prefab: String,
        remote_prefab: String,
        fields: Vec<Vec<u8>>,
    ) -> Self {
        if fields.len() < RESERVED_FIELDS.len() {
            panic!(
                "protocol violation: snapshot for entity {} has {} fields, fewer than the {} reserved position fields",
                network_id,
                fields.len(),
                RESERVED_FIELDS.len()
            );
        }
        let position = decode_position(&fields);
        Self {
            network_id,
            parent,
            children: Vec::new(),
            local_prefab,
            remote_prefab,
            radius: DEFAULT_RADIUS,
            fields,
            position,
        }
    }

    pub fn from_snapshot(snapshot: RepSnapshot) -> Self {
        let parent = (snapshot.parent_id != NO_PARENT).then_some(snapshot.parent_id);
        Self::new(
            snapshot.network_id,
            parent,
            snapshot.local_prefab,
            snapshot.remote_prefab,
            snapshot.fields,
        )
    }

    /// Full serialization, shared by CREATE_LOCAL/CREATE_REMOTE payloads and
    /// the persisted file format.
    pub fn snapshot(&self) -> RepSnapshot {
        RepSnapshot {
            network_id: self.network_id,
            parent_id: self.parent.unwrap_or(NO_PARENT),
            local_prefab: self.local_prefab.clone(),
            remote_prefab: self.remote_prefab.clone(),
            fields: self.fields.clone(),
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_bytes(&self, index: usize) -> &[u8] {
        &self.fields[index]
    }

    /// Stores an incoming field diff.
    ///
    /// # Panics
    /// Panics on an out-of-range index, and on a position field (index 0-2)
    /// whose payload is not exactly 4 bytes.
    pub fn set_field(&mut self, index: usize, bytes: Vec<u8>) {
        if index >= self.fields.len() {
            panic!(
                "protocol violation: field index {} out of range for entity {} ({} fields)",
                index,
                self.network_id,
                self.fields.len()
            );
        }
        if index < RESERVED_FIELDS.len() && bytes.len() != 4 {
            panic!(
                "protocol violation: position field {} of entity {} got a {}-byte payload, expected 4",
                index,
                self.network_id,
                bytes.len()
            );
        }
        self.fields[index] = bytes;
        if index < RESERVED_FIELDS.len() {
            self.position = decode_position(&self.fields);
        }
    }
}

/// Decodes the cached position from the reserved field prefix.
///
/// # Panics
/// Panics if any of the three blocks is not exactly 4 bytes.
fn decode_position(fields: &[Vec<u8>]) -> Vec3 {
    let mut parts = [0.0f32; 3];
    for (index, part) in parts.iter_mut().enumerate() {
        let block = &fields[index];
        if block.len() != 4 {
            panic!(
                "protocol violation: position field {} is {} bytes, expected 4",
                index,
                block.len()
            );
        }
        let mut cursor = 0;
        *part = read_f32(block, &mut cursor);
    }
    Vec3::from_array(parts)
}
