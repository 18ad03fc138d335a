//! Client session engine.
//!
//! Owns the TCP connection and everything replicated over it: the entity
//! map, provisional id assignment, the deferred creation queue, and the
//! per-tick read/dispatch/flush pipeline. Game logic talks to this type
//! only through [`Session::create`], [`Session::delete_entity`], field
//! accessors on entities, and the behavior hooks.

use std::collections::{HashMap, VecDeque};
use std::net::TcpStream;

use glam::Quat;
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use shared::codec::{read_i32, write_f32};
use shared::frame::{FrameBuffer, SendQueue};
use shared::message::{
    ClientMessage, CreatePayload, CreationSuccessPayload, ForceCreatePayload, LoginPayload,
    RepSnapshot, ServerMessage, VariableUpdatePayload, NO_PARENT,
};

use crate::entity::{CreateParams, Entity, EntityBehavior, EntityCtx, PrefabRegistry};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not connected")]
    NotConnected,
}

/// Connection state polled by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    /// Login sent, waiting for the server to hand over a player avatar.
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectionStatus::Disconnected => "not connected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        };
        write!(f, "{}", text)
    }
}

pub struct Session {
    prefabs: PrefabRegistry,

    stream: Option<TcpStream>,
    recv: FrameBuffer,
    send: SendQueue,
    status: ConnectionStatus,

    entities: HashMap<i32, Entity>,
    /// Creation messages wait here until their entity is one tick old, so
    /// first-tick field values are captured and parents always flush
    /// before the children spawned from their creation hooks.
    pending_creates: VecDeque<i32>,
    next_provisional_id: i32,
    player_id: Option<i32>,
    tick_count: u64,
    render_range: Option<f32>,
}

impl Session {
    pub fn new(prefabs: PrefabRegistry) -> Self {
        Self {
            prefabs,
            stream: None,
            recv: FrameBuffer::new(),
            send: SendQueue::new(),
            status: ConnectionStatus::Disconnected,
            entities: HashMap::new(),
            pending_creates: VecDeque::new(),
            next_provisional_id: -1,
            player_id: None,
            tick_count: 0,
            render_range: None,
        }
    }

    /// Dials the server and queues the login. Any state from a previous
    /// connection is discarded first.
    pub fn connect(
        &mut self,
        addr: &str,
        username: &str,
        password: &str,
    ) -> Result<(), SessionError> {
        if self.stream.is_some() || !self.entities.is_empty() {
            self.drop_connection("reconnecting");
        }

        info!("Connecting to {} as '{}'", addr, username);
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);
        self.status = ConnectionStatus::Connecting;

        let login = LoginPayload {
            username: username.to_owned(),
            password_hash: Sha256::digest(password.as_bytes()).into(),
        };
        self.send
            .push(ClientMessage::Login.as_byte(), &login.encode());

        if let Some(range) = self.render_range {
            self.queue_render_range(range);
        }
        Ok(())
    }

    /// Announces the logout, flushes it, then tears the session down.
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        if self.stream.is_none() {
            return Err(SessionError::NotConnected);
        }
        self.send.push(ClientMessage::Disconnect.as_byte(), &[]);
        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = self.send.flush(stream) {
                warn!("Logout flush failed: {}", e);
            }
        }
        self.drop_connection("logged out");
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn player_id(&self) -> Option<i32> {
        self.player_id
    }

    pub fn entity(&self, network_id: i32) -> Option<&Entity> {
        self.entities.get(&network_id)
    }

    pub fn entity_mut(&mut self, network_id: i32) -> Option<&mut Entity> {
        self.entities.get_mut(&network_id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entity_ids(&self) -> Vec<i32> {
        self.entities.keys().copied().collect()
    }

    /// Creates a networked entity immediately under a provisional negative
    /// id and returns it. The creation message goes out on the next tick.
    pub fn create(&mut self, params: CreateParams) -> i32 {
        self.create_local_entity(params, None)
    }

    /// Removes a registered entity and its subtree, here and on the server.
    ///
    /// # Panics
    /// Panics when the id is still provisional or unknown; deleting an
    /// entity the server never confirmed is a caller bug.
    pub fn delete_entity(&mut self, network_id: i32) {
        if network_id <= 0 {
            panic!(
                "cannot delete entity {}: id is not server-registered",
                network_id
            );
        }
        if !self.entities.contains_key(&network_id) {
            panic!("cannot delete entity {}: not registered", network_id);
        }
        self.remove_subtree(network_id);
        let mut payload = Vec::new();
        shared::codec::write_i32(&mut payload, network_id);
        self.send.push(ClientMessage::Delete.as_byte(), &payload);
    }

    /// Updates this client's interest radius on the server.
    pub fn set_render_range(&mut self, range: f32) {
        self.render_range = Some(range);
        if self.stream.is_some() {
            self.queue_render_range(range);
        }
    }

    /// One cooperative tick: read everything available, dispatch it, flush
    /// due creation messages, run entity updates, then drain the outgoing
    /// queue. Never blocks.
    pub fn tick(&mut self, dt: f32) {
        self.tick_count += 1;

        if let Some(stream) = self.stream.as_mut() {
            let open = match self.recv.read_from(stream) {
                Ok(open) => open,
                Err(e) => {
                    error!("Read failed: {}", e);
                    self.drop_connection("read failure");
                    return;
                }
            };
            // Frames that rode in with a close are still dispatched before
            // the connection is torn down.
            for (msg_type, payload) in self.recv.drain_frames() {
                self.dispatch(msg_type, &payload);
            }
            if !open {
                self.drop_connection("server closed the connection");
                return;
            }
        }

        self.flush_pending_creates();
        self.network_update_all(dt);

        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = self.send.flush(stream) {
                error!("Write failed: {}", e);
                self.drop_connection("write failure");
            }
        }
    }

    fn queue_render_range(&mut self, range: f32) {
        let mut payload = Vec::new();
        write_f32(&mut payload, range);
        self.send
            .push(ClientMessage::RenderRangeUpdate.as_byte(), &payload);
    }

    fn dispatch(&mut self, msg_type: u8, payload: &[u8]) {
        let message = match ServerMessage::from_byte(msg_type) {
            Some(message) => message,
            None => panic!("protocol violation: unknown server message type {}", msg_type),
        };
        match message {
            ServerMessage::CreateLocal => self.handle_create(payload, true),
            ServerMessage::CreateRemote => self.handle_create(payload, false),
            ServerMessage::ForceCreate => self.handle_force_create(payload),
            ServerMessage::Unload => self.handle_unload(payload),
            ServerMessage::CreationSuccess => self.handle_creation_success(payload),
            ServerMessage::VariableUpdate => self.handle_variable_update(payload),
        }
    }

    /// Instantiates an entity the server already owns, as ours (`local`)
    /// or as someone else's.
    fn handle_create(&mut self, payload: &[u8], local: bool) {
        let snapshot = RepSnapshot::decode(payload);
        if self.entities.contains_key(&snapshot.network_id) {
            panic!(
                "protocol violation: duplicate registration of network id {}",
                snapshot.network_id
            );
        }

        let prefab = if local {
            &snapshot.local_prefab
        } else {
            &snapshot.remote_prefab
        };
        let behavior = match self.prefabs.instantiate(prefab) {
            Some(behavior) => behavior,
            None => panic!("unknown prefab '{}'", prefab),
        };

        let parent = (snapshot.parent_id != NO_PARENT).then_some(snapshot.parent_id);
        if let Some(parent_id) = parent {
            if !self.entities.contains_key(&parent_id) {
                panic!(
                    "protocol violation: entity {} arrived before its parent {}",
                    snapshot.network_id, parent_id
                );
            }
        }

        let mut entity = Entity::new(
            snapshot.network_id,
            local,
            snapshot.local_prefab.clone(),
            snapshot.remote_prefab.clone(),
            parent,
            behavior,
            self.tick_count,
        );
        entity.creation_sent = true;
        entity.fields.apply_snapshot(&snapshot.fields);
        entity.transform.position = entity.fields.position();
        entity.fields.seed_smoothing();

        let id = snapshot.network_id;
        self.entities.insert(id, entity);
        if let Some(parent_id) = parent {
            if let Some(parent) = self.entities.get_mut(&parent_id) {
                parent.children.push(id);
            }
        }

        self.run_entity_hook(id, 0.0, |behavior, ctx| behavior.on_create(ctx));
        if let Some(parent_id) = parent {
            self.run_entity_hook(parent_id, 0.0, move |behavior, ctx| {
                behavior.on_child_added(ctx, id)
            });
        }

        // A root entity loaded as "ours" is this connection's player.
        if local && parent.is_none() {
            self.claim_player(id);
        }
    }

    /// Server-initiated creation with a pre-assigned id, used to spawn a
    /// fresh avatar at first login. Confirmed back like a normal creation.
    fn handle_force_create(&mut self, payload: &[u8]) {
        let force = ForceCreatePayload::decode(payload);
        let params = CreateParams {
            position: force.position,
            rotation: Quat::IDENTITY,
            local_prefab: force.local_prefab,
            remote_prefab: Some(force.remote_prefab),
            parent: (force.parent_id != NO_PARENT).then_some(force.parent_id),
        };
        let id = self.create_local_entity(params, Some(force.network_id));
        self.claim_player(id);
    }

    fn handle_creation_success(&mut self, payload: &[u8]) {
        let confirm = CreationSuccessPayload::decode(payload);
        let mut entity = match self.entities.remove(&confirm.local_id) {
            Some(entity) => entity,
            None => {
                warn!(
                    "Creation confirm for unknown local id {}",
                    confirm.local_id
                );
                return;
            }
        };

        entity.network_id = confirm.global_id;
        let children = entity.children.clone();
        let parent = entity.parent;
        self.entities.insert(confirm.global_id, entity);

        for child_id in children {
            if let Some(child) = self.entities.get_mut(&child_id) {
                child.parent = Some(confirm.global_id);
            }
        }
        if let Some(parent_id) = parent {
            if let Some(parent) = self.entities.get_mut(&parent_id) {
                for slot in parent.children.iter_mut() {
                    if *slot == confirm.local_id {
                        *slot = confirm.global_id;
                    }
                }
            }
        }
        if self.player_id == Some(confirm.local_id) {
            self.player_id = Some(confirm.global_id);
        }
    }

    /// Removes the entity and everything under it. Redundant unloads for
    /// already-cascaded children are expected under latency and tolerated.
    fn handle_unload(&mut self, payload: &[u8]) {
        let mut cursor = 0;
        let network_id = read_i32(payload, &mut cursor);
        if !self.entities.contains_key(&network_id) {
            warn!("Unload for unknown entity {}", network_id);
            return;
        }
        self.remove_subtree(network_id);
        if self.player_id == Some(network_id) {
            warn!("Player entity {} was unloaded", network_id);
            self.player_id = None;
            self.status = ConnectionStatus::Connecting;
        }
    }

    fn handle_variable_update(&mut self, payload: &[u8]) {
        let update = VariableUpdatePayload::decode(payload);
        if update.field_index < 0 {
            panic!(
                "protocol violation: negative field index {}",
                update.field_index
            );
        }
        match self.entities.get_mut(&update.network_id) {
            Some(entity) => {
                entity
                    .fields
                    .by_index_mut(update.field_index as usize)
                    .deserialize(&update.bytes);
            }
            None => warn!("Variable update for unknown entity {}", update.network_id),
        }
    }

    fn claim_player(&mut self, network_id: i32) {
        self.player_id = Some(network_id);
        self.status = ConnectionStatus::Connected;
        info!("Player avatar assigned: network id {}", network_id);
        self.run_entity_hook(network_id, 0.0, |behavior, ctx| {
            behavior.on_gain_authority(ctx)
        });
    }

    /// Instantiates a locally-owned entity and stages its creation message.
    fn create_local_entity(&mut self, params: CreateParams, supplied_id: Option<i32>) -> i32 {
        let network_id = match supplied_id {
            Some(id) => id,
            None => {
                let id = self.next_provisional_id;
                self.next_provisional_id -= 1;
                id
            }
        };
        if self.entities.contains_key(&network_id) {
            panic!(
                "protocol violation: duplicate registration of network id {}",
                network_id
            );
        }

        let local_prefab = params.local_prefab;
        let remote_prefab = params
            .remote_prefab
            .unwrap_or_else(|| local_prefab.clone());
        let behavior = match self.prefabs.instantiate(&local_prefab) {
            Some(behavior) => behavior,
            None => panic!("unknown prefab '{}'", local_prefab),
        };

        let mut entity = Entity::new(
            network_id,
            true,
            local_prefab,
            remote_prefab,
            params.parent,
            behavior,
            self.tick_count,
        );
        entity.transform.position = params.position;
        entity.transform.rotation = params.rotation;
        entity.fields.set_position(params.position);
        entity.fields.seed_smoothing();

        self.entities.insert(network_id, entity);
        if let Some(parent_id) = params.parent {
            match self.entities.get_mut(&parent_id) {
                Some(parent) => parent.children.push(network_id),
                None => warn!(
                    "New entity {} references missing parent {}",
                    network_id, parent_id
                ),
            }
        }
        self.pending_creates.push_back(network_id);

        self.run_entity_hook(network_id, 0.0, |behavior, ctx| {
            behavior.on_first_create(ctx);
            behavior.on_create(ctx);
        });
        if let Some(parent_id) = params.parent {
            self.run_entity_hook(parent_id, 0.0, move |behavior, ctx| {
                behavior.on_child_added(ctx, network_id)
            });
        }
        network_id
    }

    /// Runs one behavior hook, then performs any child spawns it requested.
    /// Spawned children recurse through [`Session::create_local_entity`], so
    /// a whole subtree built from creation hooks lands on the pending queue
    /// in parent-before-child order.
    fn run_entity_hook(
        &mut self,
        network_id: i32,
        dt: f32,
        hook: impl FnOnce(&mut dyn EntityBehavior, &mut EntityCtx),
    ) {
        let mut spawns = Vec::new();
        if let Some(entity) = self.entities.get_mut(&network_id) {
            entity.with_behavior(dt, &mut spawns, hook);
        }
        for params in spawns {
            self.create_local_entity(params, None);
        }
    }

    /// Sends creation messages for entities that are at least one tick old,
    /// oldest first. The snapshot captures every field's current value, so
    /// anything set during the birth tick rides along instead of trailing
    /// as diffs.
    fn flush_pending_creates(&mut self) {
        while let Some(&network_id) = self.pending_creates.front() {
            let ready = match self.entities.get(&network_id) {
                Some(entity) => entity.birth_tick < self.tick_count,
                None => true,
            };
            if !ready {
                break;
            }
            self.pending_creates.pop_front();

            let entity = match self.entities.get_mut(&network_id) {
                Some(entity) => entity,
                // Deleted before its creation ever went out.
                None => continue,
            };
            let payload = CreatePayload {
                local_id: entity.network_id,
                parent_id: entity.parent.unwrap_or(NO_PARENT),
                local_prefab: entity.local_prefab.clone(),
                remote_prefab: entity.remote_prefab.clone(),
                field_snapshot: entity.fields.snapshot(),
            }
            .encode();
            entity.fields.mark_all_sent();
            entity.creation_sent = true;
            self.send.push(ClientMessage::Create.as_byte(), &payload);
        }
    }

    /// Per-entity tick: lerp remote positions, run the tick hook, write a
    /// local entity's transform back into its position fields, then drain
    /// queued diffs. Diffs are held while the entity's creation message is
    /// unsent or its id is still provisional.
    fn network_update_all(&mut self, dt: f32) {
        let ids = self.entity_ids();
        for network_id in ids {
            match self.entities.get_mut(&network_id) {
                Some(entity) => {
                    if !entity.local {
                        entity.fields.advance_smoothing(dt);
                        entity.transform.position = entity.fields.lerped_position();
                    }
                }
                None => continue,
            }

            self.run_entity_hook(network_id, dt, |behavior, ctx| {
                behavior.on_network_tick(ctx)
            });

            if let Some(entity) = self.entities.get_mut(&network_id) {
                if entity.local {
                    let position = entity.transform.position;
                    entity.fields.set_position(position);
                }
                if entity.creation_sent && entity.network_id > 0 {
                    for (index, bytes) in entity.fields.drain_queued() {
                        let update = VariableUpdatePayload {
                            network_id: entity.network_id,
                            field_index: index as i32,
                            bytes,
                        };
                        self.send
                            .push(ClientMessage::VariableUpdate.as_byte(), &update.encode());
                    }
                }
            }
        }
    }

    /// Depth-first removal of an entity and all descendants, detaching the
    /// root from its parent's child list.
    fn remove_subtree(&mut self, network_id: i32) {
        let mut stack = vec![network_id];
        let mut doomed = Vec::new();
        while let Some(id) = stack.pop() {
            if let Some(entity) = self.entities.get(&id) {
                stack.extend(entity.children.iter().copied());
                doomed.push(id);
            }
        }

        if let Some(parent_id) = self.entities.get(&network_id).and_then(|e| e.parent) {
            if let Some(parent) = self.entities.get_mut(&parent_id) {
                parent.children.retain(|&child| child != network_id);
            }
        }
        for id in doomed {
            self.entities.remove(&id);
        }
    }

    fn drop_connection(&mut self, reason: &str) {
        if let Some(player_id) = self.player_id {
            self.run_entity_hook(player_id, 0.0, |behavior, ctx| {
                behavior.on_lose_authority(ctx)
            });
        }
        self.stream = None;
        self.recv = FrameBuffer::new();
        self.send.clear();
        self.entities.clear();
        self.pending_creates.clear();
        self.player_id = None;
        self.status = ConnectionStatus::Disconnected;
        info!("Session closed: {}", reason);
    }
}
