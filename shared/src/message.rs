//! Message type bytes and typed payload layouts for both wire directions.
//!
//! The type byte travels in the frame header; payload layouts are fixed per
//! type and encoded with the [`codec`](crate::codec) primitives. The
//! [`RepSnapshot`] layout is shared three ways: CREATE_LOCAL and
//! CREATE_REMOTE payloads, and the on-disk save format.

use glam::Vec3;

use crate::codec;

/// Parent-id sentinel meaning "top-level, no parent". Never a valid id.
pub const NO_PARENT: i32 = 0;

/// Messages a client sends to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    /// Username plus password digest; first message on every connection.
    Login = 1,
    /// Graceful logout; the connection closes after this.
    Disconnect = 2,
    /// A locally created entity asking for a permanent id.
    Create = 3,
    /// Destroy a registered entity everywhere.
    Delete = 4,
    /// New interest radius for proximity loading.
    RenderRangeUpdate = 5,
    /// One field diff for one entity.
    VariableUpdate = 6,
}

impl ClientMessage {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Login),
            2 => Some(Self::Disconnect),
            3 => Some(Self::Create),
            4 => Some(Self::Delete),
            5 => Some(Self::RenderRangeUpdate),
            6 => Some(Self::VariableUpdate),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessage {
    /// Instantiate a representation as this client's own entity.
    CreateLocal = 1,
    /// Instantiate a representation as someone else's entity.
    CreateRemote = 2,
    /// Server-initiated creation, e.g. spawning a fresh avatar at login.
    ForceCreate = 3,
    /// Remove an entity (and locally, its children) from this client.
    Unload = 4,
    /// Maps a provisional local id to the permanent global id.
    CreationSuccess = 5,
    /// One field diff for one entity.
    VariableUpdate = 6,
}

impl ServerMessage {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::CreateLocal),
            2 => Some(Self::CreateRemote),
            3 => Some(Self::ForceCreate),
            4 => Some(Self::Unload),
            5 => Some(Self::CreationSuccess),
            6 => Some(Self::VariableUpdate),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Writes `[i32 len][bytes]` per field, in index order.
pub fn write_field_blocks(out: &mut Vec<u8>, fields: &[Vec<u8>]) {
    for field in fields {
        codec::write_i32(out, field.len() as i32);
        out.extend_from_slice(field);
    }
}

/// Reads `[i32 len][bytes]` blocks until the buffer is exhausted.
pub fn read_field_blocks(buf: &[u8], cursor: &mut usize) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    while *cursor < buf.len() {
        let len = codec::read_i32(buf, cursor);
        if len < 0 {
            panic!("protocol violation: negative field block length {}", len);
        }
        blocks.push(codec::read_bytes(buf, cursor, len as usize).to_vec());
    }
    blocks
}

/// LOGIN: `[len: u8][username][32-byte sha256(password)]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPayload {
    pub username: String,
    pub password_hash: [u8; 32],
}

impl LoginPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::write_string(&mut out, &self.username);
        out.extend_from_slice(&self.password_hash);
        out
    }

    pub fn decode(payload: &[u8]) -> Self {
        let mut cursor = 0;
        let username = codec::read_string(payload, &mut cursor);
        let digest = codec::read_bytes(payload, &mut cursor, 32);
        let mut password_hash = [0u8; 32];
        password_hash.copy_from_slice(digest);
        if cursor != payload.len() {
            panic!("protocol violation: {} trailing bytes after LOGIN", payload.len() - cursor);
        }
        Self { username, password_hash }
    }
}

/// CREATE: a client-originated entity with its full first-tick snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePayload {
    pub local_id: i32,
    pub parent_id: i32,
    pub local_prefab: String,
    pub remote_prefab: String,
    pub field_snapshot: Vec<Vec<u8>>,
}

impl CreatePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::write_i32(&mut out, self.local_id);
        codec::write_i32(&mut out, self.parent_id);
        codec::write_string(&mut out, &self.local_prefab);
        codec::write_string(&mut out, &self.remote_prefab);
        write_field_blocks(&mut out, &self.field_snapshot);
        out
    }

    pub fn decode(payload: &[u8]) -> Self {
        let mut cursor = 0;
        let local_id = codec::read_i32(payload, &mut cursor);
        let parent_id = codec::read_i32(payload, &mut cursor);
        let local_prefab = codec::read_string(payload, &mut cursor);
        let remote_prefab = codec::read_string(payload, &mut cursor);
        let field_snapshot = read_field_blocks(payload, &mut cursor);
        Self { local_id, parent_id, local_prefab, remote_prefab, field_snapshot }
    }
}

/// Full serialization of a representation. Used for CREATE_LOCAL and
/// CREATE_REMOTE payloads and as the persisted file format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepSnapshot {
    pub network_id: i32,
    pub parent_id: i32,
    pub local_prefab: String,
    pub remote_prefab: String,
    pub fields: Vec<Vec<u8>>,
}

impl RepSnapshot {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::write_i32(&mut out, self.network_id);
        codec::write_i32(&mut out, self.parent_id);
        codec::write_string(&mut out, &self.local_prefab);
        codec::write_string(&mut out, &self.remote_prefab);
        write_field_blocks(&mut out, &self.fields);
        out
    }

    pub fn decode(payload: &[u8]) -> Self {
        let mut cursor = 0;
        let network_id = codec::read_i32(payload, &mut cursor);
        let parent_id = codec::read_i32(payload, &mut cursor);
        let local_prefab = codec::read_string(payload, &mut cursor);
        let remote_prefab = codec::read_string(payload, &mut cursor);
        let fields = read_field_blocks(payload, &mut cursor);
        Self { network_id, parent_id, local_prefab, remote_prefab, fields }
    }
}

/// FORCE_CREATE: server pre-assigns the id and tells the client where to
/// spawn and from which prefabs.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceCreatePayload {
    pub network_id: i32,
    pub parent_id: i32,
    pub position: Vec3,
    pub local_prefab: String,
    pub remote_prefab: String,
}

impl ForceCreatePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::write_i32(&mut out, self.network_id);
        codec::write_i32(&mut out, self.parent_id);
        codec::write_vec3(&mut out, self.position);
        codec::write_string(&mut out, &self.local_prefab);
        codec::write_string(&mut out, &self.remote_prefab);
        out
    }

    pub fn decode(payload: &[u8]) -> Self {
        let mut cursor = 0;
        let network_id = codec::read_i32(payload, &mut cursor);
        let parent_id = codec::read_i32(payload, &mut cursor);
        let position = codec::read_vec3(payload, &mut cursor);
        let local_prefab = codec::read_string(payload, &mut cursor);
        let remote_prefab = codec::read_string(payload, &mut cursor);
        Self { network_id, parent_id, position, local_prefab, remote_prefab }
    }
}

/// CREATION_SUCCESS: the id-remap reply to a CREATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationSuccessPayload {
    pub local_id: i32,
    pub global_id: i32,
}

impl CreationSuccessPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::write_i32(&mut out, self.local_id);
        codec::write_i32(&mut out, self.global_id);
        out
    }

    pub fn decode(payload: &[u8]) -> Self {
        let mut cursor = 0;
        let local_id = codec::read_i32(payload, &mut cursor);
        let global_id = codec::read_i32(payload, &mut cursor);
        Self { local_id, global_id }
    }
}

/// VARIABLE_UPDATE: one field diff, both directions. The diff runs to the
/// end of the payload; its length is implied by the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableUpdatePayload {
    pub network_id: i32,
    pub field_index: i32,
    pub bytes: Vec<u8>,
}

impl VariableUpdatePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::write_i32(&mut out, self.network_id);
        codec::write_i32(&mut out, self.field_index);
        out.extend_from_slice(&self.bytes);
        out
    }

    pub fn decode(payload: &[u8]) -> Self {
        let mut cursor = 0;
        let network_id = codec::read_i32(payload, &mut cursor);
        let field_index = codec::read_i32(payload, &mut cursor);
        let bytes = payload[cursor..].to_vec();
        Self { network_id, field_index, bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_bytes_match_protocol_table() {
        assert_eq!(ClientMessage::Login.as_byte(), 1);
        assert_eq!(ClientMessage::Disconnect.as_byte(), 2);
        assert_eq!(ClientMessage::Create.as_byte(), 3);
        assert_eq!(ClientMessage::Delete.as_byte(), 4);
        assert_eq!(ClientMessage::RenderRangeUpdate.as_byte(), 5);
        assert_eq!(ClientMessage::VariableUpdate.as_byte(), 6);

        assert_eq!(ServerMessage::CreateLocal.as_byte(), 1);
        assert_eq!(ServerMessage::CreateRemote.as_byte(), 2);
        assert_eq!(ServerMessage::ForceCreate.as_byte(), 3);
        assert_eq!(ServerMessage::Unload.as_byte(), 4);
        assert_eq!(ServerMessage::CreationSuccess.as_byte(), 5);
        assert_eq!(ServerMessage::VariableUpdate.as_byte(), 6);

        for byte in 1..=6u8 {
            assert_eq!(ClientMessage::from_byte(byte).unwrap().as_byte(), byte);
            assert_eq!(ServerMessage::from_byte(byte).unwrap().as_byte(), byte);
        }
        assert!(ClientMessage::from_byte(0).is_none());
        assert!(ClientMessage::from_byte(7).is_none());
        assert!(ServerMessage::from_byte(200).is_none());
    }

    #[test]
    fn test_login_roundtrip() {
        let login = LoginPayload { username: "ada".into(), password_hash: [7u8; 32] };
        let decoded = LoginPayload::decode(&login.encode());
        assert_eq!(decoded, login);
    }

    #[test]
    #[should_panic(expected = "trailing bytes after LOGIN")]
    fn test_login_with_trailing_garbage_panics() {
        let mut bytes = LoginPayload { username: "ada".into(), password_hash: [0u8; 32] }.encode();
        bytes.push(0xff);
        LoginPayload::decode(&bytes);
    }

    #[test]
    fn test_create_roundtrip_with_fields() {
        let create = CreatePayload {
            local_id: -3,
            parent_id: NO_PARENT,
            local_prefab: "player".into(),
            remote_prefab: "player_remote".into(),
            field_snapshot: vec![vec![0, 0, 128, 63], vec![], vec![5, b'h', b'e', b'l', b'l', b'o']],
        };
        let decoded = CreatePayload::decode(&create.encode());
        assert_eq!(decoded, create);
    }

    #[test]
    fn test_rep_snapshot_roundtrip() {
        let snap = RepSnapshot {
            network_id: 12,
            parent_id: 4,
            local_prefab: "crate".into(),
            remote_prefab: "crate".into(),
            fields: vec![vec![1, 2, 3, 4]; 5],
        };
        assert_eq!(RepSnapshot::decode(&snap.encode()), snap);
    }

    #[test]
    fn test_force_create_roundtrip() {
        let force = ForceCreatePayload {
            network_id: 9,
            parent_id: NO_PARENT,
            position: Vec3::new(10.0, 0.0, -4.5),
            local_prefab: "player".into(),
            remote_prefab: "player_remote".into(),
        };
        assert_eq!(ForceCreatePayload::decode(&force.encode()), force);
    }

    #[test]
    fn test_variable_update_diff_runs_to_end() {
        let update = VariableUpdatePayload { network_id: 5, field_index: 0, bytes: vec![42, 0, 0, 0] };
        let decoded = VariableUpdatePayload::decode(&update.encode());
        assert_eq!(decoded, update);

        let empty = VariableUpdatePayload { network_id: 5, field_index: 3, bytes: vec![] };
        assert_eq!(VariableUpdatePayload::decode(&empty.encode()), empty);
    }
}
