//! The server authority engine.
//!
//! Owns the listening socket, the [`World`], and every client connection,
//! and pumps them all from a single cooperative tick: accept, read and
//! dispatch, recompute proximity interest, flush, then sweep dead
//! connections. There is no other thread; per-tick work scales linearly
//! with the connection count.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;

use glam::Vec3;
use log::{debug, error, info, warn};
use thiserror::Error;

use shared::codec::{read_f32, read_i32, write_i32};
use shared::message::{
    ClientMessage, CreatePayload, CreationSuccessPayload, ForceCreatePayload, LoginPayload,
    ServerMessage, VariableUpdatePayload, NO_PARENT,
};

use crate::connection::ClientConnection;
use crate::persist::{self, PersistError};
use crate::representation::Representation;
use crate::world::World;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Static server configuration, filled from the command line in the binary
/// and handed to [`ServerEngine::new`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub world_name: String,
    pub data_dir: PathBuf,
    /// Where FORCE_CREATE spawns a fresh player avatar.
    pub spawn_position: Vec3,
    pub player_local_prefab: String,
    pub player_remote_prefab: String,
    /// Interest radius for connections that never sent RENDER_RANGE_UPDATE.
    pub default_render_range: f32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            world_name: "world".to_owned(),
            data_dir: PathBuf::from("./data"),
            spawn_position: Vec3::ZERO,
            player_local_prefab: "player".to_owned(),
            player_remote_prefab: "player".to_owned(),
            default_render_range: 50.0,
        }
    }
}

pub struct ServerEngine {
    listener: TcpListener,
    config: ServerConfig,
    world: World,
    connections: Vec<ClientConnection>,
    /// Password digests seen this run, keyed by username. The pinned
    /// persistence format carries no hash field, so the first login of a run
    /// sets the expectation and later logins must match it.
    passwords: std::collections::HashMap<String, [u8; 32]>,
}

impl ServerEngine {
    /// Binds the listener and loads the configured world if a save exists.
    pub fn new(addr: &str, config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let world = match persist::load_world(&config.data_dir, &config.world_name)? {
            Some(world) => world,
            None => {
                info!("No save found for world '{}', starting empty", config.world_name);
                World::new()
            }
        };

        info!(
            "Server listening on {} (world '{}', {} representations)",
            listener.local_addr()?,
            config.world_name,
            world.rep_count()
        );
        Ok(Self {
            listener,
            config,
            world,
            connections: Vec::new(),
            passwords: std::collections::HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Writes the whole world to disk.
    pub fn save(&self) -> Result<(), PersistError> {
        persist::save_world(&self.world, &self.config.data_dir, &self.config.world_name)
    }

    /// One cooperative tick. Never blocks.
    pub fn tick(&mut self) {
        self.accept_connections();

        for idx in 0..self.connections.len() {
            let (frames, closed) = {
                let conn = &mut self.connections[idx];
                if conn.dead {
                    continue;
                }
                match conn.read_available() {
                    Ok(open) => (conn.drain_frames(), !open),
                    Err(e) => {
                        error!("Read from '{}' failed: {}", conn.label(), e);
                        conn.dead = true;
                        continue;
                    }
                }
            };
            // Frames that rode in with a close are still dispatched before
            // the connection is marked dead.
            for (msg_type, payload) in frames {
                self.dispatch(idx, msg_type, &payload);
            }
            if closed && !self.connections[idx].dead {
                info!("'{}' closed the connection", self.connections[idx].label());
                self.connections[idx].dead = true;
            }
        }

        for idx in 0..self.connections.len() {
            self.update_loaded(idx);
        }

        for conn in &mut self.connections {
            if conn.dead {
                continue;
            }
            if let Err(e) = conn.flush() {
                error!("Write to '{}' failed: {}", conn.label(), e);
                conn.dead = true;
            }
        }

        self.sweep_dead();
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    match ClientConnection::new(stream, addr, self.config.default_render_range) {
                        Ok(conn) => {
                            info!("Connection from {}", addr);
                            self.connections.push(conn);
                        }
                        Err(e) => warn!("Failed to set up connection from {}: {}", addr, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, idx: usize, msg_type: u8, payload: &[u8]) {
        if self.connections[idx].dead {
            return;
        }
        let message = match ClientMessage::from_byte(msg_type) {
            Some(message) => message,
            None => panic!("protocol violation: unknown client message type {}", msg_type),
        };
        match message {
            ClientMessage::Login => self.handle_login(idx, payload),
            ClientMessage::Disconnect => self.handle_disconnect(idx),
            ClientMessage::Create => self.handle_create(idx, payload),
            ClientMessage::Delete => self.handle_delete(idx, payload),
            ClientMessage::RenderRangeUpdate => self.handle_render_range(idx, payload),
            ClientMessage::VariableUpdate => self.handle_variable_update(idx, payload),
        }
    }

    fn handle_login(&mut self, idx: usize, payload: &[u8]) {
        let login = LoginPayload::decode(payload);
        if !valid_username(&login.username) {
            warn!("Rejecting invalid username {:?}", login.username);
            self.connections[idx].dead = true;
            return;
        }
        let taken = self.connections.iter().enumerate().any(|(i, conn)| {
            i != idx && !conn.dead && conn.username.as_deref() == Some(login.username.as_str())
        });
        if taken {
            warn!("'{}' is already connected, dropping the new connection", login.username);
            self.connections[idx].dead = true;
            return;
        }
        match self.passwords.get(&login.username) {
            Some(expected) if *expected != login.password_hash => {
                warn!("Password mismatch for '{}'", login.username);
                self.connections[idx].dead = true;
                return;
            }
            Some(_) => {}
            None => {
                self.passwords.insert(login.username.clone(), login.password_hash);
            }
        }

        self.connections[idx].username = Some(login.username.clone());
        match self.world.player_id(&login.username) {
            Some(player_id) => {
                self.world.activate(player_id);
                self.load_subtree(idx, player_id, true);
                info!("'{}' logged in, restored player {}", login.username, player_id);
            }
            None => {
                let reserved = self.world.allocate_id();
                self.connections[idx].reserved_id = Some(reserved);
                let force = ForceCreatePayload {
                    network_id: reserved,
                    parent_id: NO_PARENT,
                    position: self.config.spawn_position,
                    local_prefab: self.config.player_local_prefab.clone(),
                    remote_prefab: self.config.player_remote_prefab.clone(),
                };
                self.connections[idx]
                    .queue(ServerMessage::ForceCreate.as_byte(), &force.encode());
                info!("'{}' logged in, spawning fresh avatar as {}", login.username, reserved);
            }
        }
    }

    fn handle_disconnect(&mut self, idx: usize) {
        info!("'{}' logged out", self.connections[idx].label());
        self.connections[idx].dead = true;
    }

    fn handle_create(&mut self, idx: usize, payload: &[u8]) {
        let create = CreatePayload::decode(payload);

        // A parent id may still be provisional from the sender's point of
        // view, or may have been deleted by another client in the meantime.
        // An unresolvable parent demotes the entity to a root rather than
        // dropping it: the sender is still owed its CREATION_SUCCESS.
        let parent = match create.parent_id {
            NO_PARENT => None,
            id => match self.connections[idx].resolve_id(id) {
                Some(resolved) if self.world.contains(resolved) => Some(resolved),
                _ => {
                    warn!(
                        "CREATE from '{}' references unresolvable parent {}, creating as root",
                        self.connections[idx].label(),
                        id
                    );
                    None
                }
            },
        };

        let global_id = if create.local_id < 0 {
            let id = self.world.allocate_id();
            self.connections[idx].local_to_global.insert(create.local_id, id);
            id
        } else {
            // Positive ids only arrive as FORCE_CREATE confirmations.
            match self.connections[idx].reserved_id.take() {
                Some(reserved) if reserved == create.local_id => reserved,
                _ => panic!(
                    "protocol violation: CREATE with unreserved positive id {}",
                    create.local_id
                ),
            }
        };

        let rep = Representation::new(
            global_id,
            parent,
            create.local_prefab,
            create.remote_prefab,
            create.field_snapshot,
        );
        let snapshot_bytes = rep.snapshot().encode();
        self.world.insert(rep, true);

        if create.local_id > 0 {
            if let Some(username) = self.connections[idx].username.clone() {
                self.world.bind_player(&username, global_id);
                debug!("Player representation {} bound to '{}'", global_id, username);
            }
        }

        let confirm = CreationSuccessPayload {
            local_id: create.local_id,
            global_id,
        };
        let conn = &mut self.connections[idx];
        conn.loaded.insert(global_id);
        conn.queue(ServerMessage::CreationSuccess.as_byte(), &confirm.encode());
        debug!("Created representation {} (parent {:?})", global_id, parent);

        // Children of an already-visible parent propagate immediately; new
        // roots reach other clients through the next proximity pass.
        if let Some(parent_id) = parent {
            for (i, other) in self.connections.iter_mut().enumerate() {
                if i != idx && other.loaded.contains(&parent_id) && other.loaded.insert(global_id) {
                    other.queue(ServerMessage::CreateRemote.as_byte(), &snapshot_bytes);
                }
            }
        }
    }

    fn handle_delete(&mut self, idx: usize, payload: &[u8]) {
        let mut cursor = 0;
        let network_id = read_i32(payload, &mut cursor);
        if network_id <= 0 {
            panic!("protocol violation: DELETE with unregistered id {}", network_id);
        }
        if !self.world.contains(network_id) {
            warn!("DELETE for unknown representation {}", network_id);
            return;
        }

        let order = self.world.subtree_top_down(network_id);
        for (i, conn) in self.connections.iter_mut().enumerate() {
            for node in &order {
                // The deleting client already removed its copy; everyone
                // else gets one UNLOAD per node, parent first.
                if conn.loaded.remove(node) && i != idx {
                    let mut unload = Vec::new();
                    write_i32(&mut unload, *node);
                    conn.queue(ServerMessage::Unload.as_byte(), &unload);
                }
            }
        }
        let removed = self.world.remove_subtree(network_id);
        info!(
            "'{}' deleted representation {} ({} nodes)",
            self.connections[idx].label(),
            network_id,
            removed.len()
        );
    }

    fn handle_render_range(&mut self, idx: usize, payload: &[u8]) {
        let mut cursor = 0;
        let range = read_f32(payload, &mut cursor);
        let conn = &mut self.connections[idx];
        debug!("'{}' render range {} -> {}", conn.label(), conn.render_range, range);
        conn.render_range = range;
    }

    fn handle_variable_update(&mut self, idx: usize, payload: &[u8]) {
        let update = VariableUpdatePayload::decode(payload);
        if update.field_index < 0 {
            panic!("protocol violation: negative field index {}", update.field_index);
        }
        let network_id = match self.connections[idx].resolve_id(update.network_id) {
            Some(id) => id,
            None => {
                warn!(
                    "Variable update from '{}' for unresolvable id {}",
                    self.connections[idx].label(),
                    update.network_id
                );
                return;
            }
        };
        match self.world.get_mut(network_id) {
            Some(rep) => rep.set_field(update.field_index as usize, update.bytes.clone()),
            // Expected after a cross-client delete race.
            None => {
                warn!("Variable update for unknown representation {}", network_id);
                return;
            }
        }

        let out = VariableUpdatePayload {
            network_id,
            field_index: update.field_index,
            bytes: update.bytes,
        }
        .encode();
        for (i, other) in self.connections.iter_mut().enumerate() {
            if i != idx && other.loaded.contains(&network_id) {
                other.queue(ServerMessage::VariableUpdate.as_byte(), &out);
            }
        }
    }

    /// Proximity pass for one connection: every active root within
    /// `radius + render_range` of the player gets loaded (recursively,
    /// parent first), everything loaded beyond that gets unloaded the same
    /// way. Connections without a registered player are skipped.
    fn update_loaded(&mut self, idx: usize) {
        let (player_id, render_range) = {
            let conn = &self.connections[idx];
            if conn.dead {
                return;
            }
            match conn.username.as_ref().and_then(|u| self.world.player_id(u)) {
                Some(id) => (id, conn.render_range),
                None => return,
            }
        };
        let player_pos = match self.world.get(player_id) {
            Some(rep) => rep.position(),
            None => return,
        };

        for root in self.world.active_root_ids() {
            let Some(rep) = self.world.get(root) else { continue };
            let distance = player_pos.distance(rep.position());
            let threshold = rep.radius + render_range;
            let loaded = self.connections[idx].loaded.contains(&root);
            if distance < threshold && !loaded {
                self.load_subtree(idx, root, root == player_id);
            } else if distance >= threshold && loaded {
                self.unload_subtree(idx, root);
            }
        }
    }

    /// Sends the whole subtree to one connection, parent first, marking each
    /// node loaded. `local` follows the root down: a client's own player
    /// subtree is local, everything else is remote.
    fn load_subtree(&mut self, idx: usize, root: i32, local: bool) {
        let order = self.world.subtree_top_down(root);
        let msg_type = if local {
            ServerMessage::CreateLocal.as_byte()
        } else {
            ServerMessage::CreateRemote.as_byte()
        };
        let conn = &mut self.connections[idx];
        for id in order {
            if !conn.loaded.insert(id) {
                continue;
            }
            let Some(rep) = self.world.get(id) else { continue };
            conn.queue(msg_type, &rep.snapshot().encode());
        }
    }

    /// One UNLOAD per node, parent first; the client cascades locally and
    /// tolerates the redundant child unloads.
    fn unload_subtree(&mut self, idx: usize, root: i32) {
        let order = self.world.subtree_top_down(root);
        let conn = &mut self.connections[idx];
        for id in order {
            if conn.loaded.remove(&id) {
                let mut payload = Vec::new();
                write_i32(&mut payload, id);
                conn.queue(ServerMessage::Unload.as_byte(), &payload);
            }
        }
    }

    /// Removes dead connections, parking their players in the inactive set
    /// and unloading them from everyone else.
    fn sweep_dead(&mut self) {
        let mut idx = 0;
        while idx < self.connections.len() {
            if !self.connections[idx].dead {
                idx += 1;
                continue;
            }
            let conn = self.connections.remove(idx);
            let player_id = conn
                .username
                .as_ref()
                .and_then(|username| self.world.player_id(username));
            if let Some(player_id) = player_id {
                let order = self.world.subtree_top_down(player_id);
                for other in &mut self.connections {
                    for node in &order {
                        if other.loaded.remove(node) {
                            let mut payload = Vec::new();
                            write_i32(&mut payload, *node);
                            other.queue(ServerMessage::Unload.as_byte(), &payload);
                        }
                    }
                }
                self.world.deactivate(player_id);
                info!(
                    "Parked player {} of '{}' for the next login",
                    player_id,
                    conn.label()
                );
            }
        }
    }
}

/// Usernames become file names, so they are restricted to `[A-Za-z0-9_]`,
/// 1 to 32 characters.
fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 32
        && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
