//! Client-side networked entities.
//!
//! An [`Entity`] is the live, replicated object: a network id, a finalized
//! field set, a parent/child position in the entity tree, and a game-logic
//! [`EntityBehavior`] supplying the lifecycle hooks. Behaviors are built by
//! prefab name through a [`PrefabRegistry`], so the session engine can
//! instantiate whatever the server tells it to without knowing any game
//! types.

use std::collections::HashMap;

use glam::{Quat, Vec3};
use shared::schema::{EntityFields, FieldRegistry};

/// Visual placement of an entity, written by lerp for remote entities and
/// by game logic for local ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

/// Game-logic hooks invoked by the session engine. Every method has an
/// empty default so behaviors implement only what they care about.
pub trait EntityBehavior {
    /// Declares this entity type's replicated fields. Called exactly once,
    /// before any other hook. Position fields are pre-registered.
    fn register_fields(&mut self, _registry: &mut FieldRegistry) {}

    /// Runs only on the client that originated the entity, before
    /// [`EntityBehavior::on_create`]. Networked children belong here: a
    /// child spawned from this hook is guaranteed to reach the server after
    /// its parent.
    fn on_first_create(&mut self, _ctx: &mut EntityCtx) {}

    /// Runs on every instantiation, local or from the network.
    fn on_create(&mut self, _ctx: &mut EntityCtx) {}

    /// Runs once per session tick.
    fn on_network_tick(&mut self, _ctx: &mut EntityCtx) {}

    /// Runs on a parent when a networked child is attached to it.
    fn on_child_added(&mut self, _ctx: &mut EntityCtx, _child_id: i32) {}

    /// Runs when this entity becomes the connection's own player avatar.
    fn on_gain_authority(&mut self, _ctx: &mut EntityCtx) {}

    /// Runs on the player avatar when the session disconnects.
    fn on_lose_authority(&mut self, _ctx: &mut EntityCtx) {}
}

/// Everything a hook may touch on its entity, borrowed for the duration of
/// the call. Child spawns are recorded here and performed by the session
/// after the hook returns.
pub struct EntityCtx<'a> {
    pub network_id: i32,
    pub local: bool,
    pub dt: f32,
    pub fields: &'a mut EntityFields,
    pub transform: &'a mut Transform,
    pub children: &'a [i32],
    spawns: &'a mut Vec<CreateParams>,
}

impl EntityCtx<'_> {
    /// Requests a networked child of the current entity. The parent is
    /// forced to the entity this context belongs to.
    pub fn spawn_child(&mut self, mut params: CreateParams) {
        params.parent = Some(self.network_id);
        self.spawns.push(params);
    }
}

/// A request to create a networked entity.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub position: Vec3,
    pub rotation: Quat,
    pub local_prefab: String,
    /// Prefab instantiated on every other client. Defaults to the local one.
    pub remote_prefab: Option<String>,
    pub parent: Option<i32>,
}

impl CreateParams {
    pub fn new(local_prefab: &str, position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            local_prefab: local_prefab.to_owned(),
            remote_prefab: None,
            parent: None,
        }
    }
}

type BehaviorConstructor = Box<dyn Fn() -> Box<dyn EntityBehavior>>;

/// Maps prefab names to behavior constructors. The session engine consults
/// this for every creation, whether requested locally or by the server.
#[derive(Default)]
pub struct PrefabRegistry {
    constructors: HashMap<String, BehaviorConstructor>,
}

impl PrefabRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        prefab: &str,
        constructor: impl Fn() -> Box<dyn EntityBehavior> + 'static,
    ) {
        self.constructors
            .insert(prefab.to_owned(), Box::new(constructor));
    }

    pub fn contains(&self, prefab: &str) -> bool {
        self.constructors.contains_key(prefab)
    }

    pub fn instantiate(&self, prefab: &str) -> Option<Box<dyn EntityBehavior>> {
        self.constructors.get(prefab).map(|ctor| ctor())
    }
}

/// A live replicated object on this client.
pub struct Entity {
    pub network_id: i32,
    pub local: bool,
    pub local_prefab: String,
    pub remote_prefab: String,
    pub parent: Option<i32>,
    pub children: Vec<i32>,
    pub transform: Transform,
    pub fields: EntityFields,
    /// Session tick the entity was instantiated on. Creation messages flush
    /// only once the entity is at least one tick old.
    pub birth_tick: u64,
    /// Set once the creation message is on the wire (or was never needed,
    /// for entities instantiated from the network). Field diffs are held
    /// back until this is true so no update can precede its creation.
    pub creation_sent: bool,
    behavior: Option<Box<dyn EntityBehavior>>,
}

impl Entity {
    /// Builds the entity and runs the behavior's field registration.
    pub fn new(
        network_id: i32,
        local: bool,
        local_prefab: String,
        remote_prefab: String,
        parent: Option<i32>,
        mut behavior: Box<dyn EntityBehavior>,
        birth_tick: u64,
    ) -> Self {
        let mut registry = FieldRegistry::new();
        behavior.register_fields(&mut registry);
        Self {
            network_id,
            local,
            local_prefab,
            remote_prefab,
            parent,
            children: Vec::new(),
            transform: Transform::default(),
            fields: registry.finish(),
            birth_tick,
            creation_sent: false,
            behavior: Some(behavior),
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.network_id < 0
    }

    /// Runs a hook with the behavior temporarily taken out of the entity so
    /// the context can borrow the rest. Child spawn requests land in
    /// `spawns` for the caller to perform.
    pub fn with_behavior<R>(
        &mut self,
        dt: f32,
        spawns: &mut Vec<CreateParams>,
        f: impl FnOnce(&mut dyn EntityBehavior, &mut EntityCtx) -> R,
    ) -> Option<R> {
        let mut behavior = self.behavior.take()?;
        let result = {
            let mut ctx = EntityCtx {
                network_id: self.network_id,
                local: self.local,
                dt,
                fields: &mut self.fields,
                transform: &mut self.transform,
                children: &self.children,
                spawns,
            };
            f(behavior.as_mut(), &mut ctx)
        };
        self.behavior = Some(behavior);
        Some(result)
    }
}
