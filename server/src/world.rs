//! The authoritative entity registry.
//!
//! One [`World`] owns every representation, the monotonic global id counter,
//! and the partition of root representations into "active" (candidates for
//! proximity load/unload) and "inactive" (logged-out players, excluded from
//! scans). It is plain owned state constructed by the engine; nothing here
//! touches sockets or global statics.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use crate::representation::Representation;

#[derive(Default)]
pub struct World {
    representations: HashMap<i32, Representation>,
    active_roots: HashSet<i32>,
    inactive_roots: HashSet<i32>,
    players: HashMap<String, i32>,
    next_global_id: i32,
}

impl World {
    pub fn new() -> Self {
        Self {
            representations: HashMap::new(),
            active_roots: HashSet::new(),
            inactive_roots: HashSet::new(),
            players: HashMap::new(),
            next_global_id: 1,
        }
    }

    /// Hands out the next global id. Ids are strictly increasing and never
    /// reused for the lifetime of a world, including across save/load.
    pub fn allocate_id(&mut self) -> i32 {
        let id = self.next_global_id;
        self.next_global_id += 1;
        id
    }

    pub fn next_global_id(&self) -> i32 {
        self.next_global_id
    }

    /// Registers a representation. Non-root representations attach to their
    /// parent's child list; roots join the active or inactive set.
    ///
    /// The id counter is seeded past every inserted id, so ids loaded from a
    /// save can never collide with fresh allocations.
    ///
    /// # Panics
    /// Panics on a duplicate id or an unknown parent; both mean a peer (or a
    /// save file) violated the registration protocol.
    pub fn insert(&mut self, rep: Representation, active: bool) {
        let id = rep.network_id;
        if self.representations.contains_key(&id) {
            panic!("protocol violation: duplicate registration of network id {}", id);
        }
        match rep.parent {
            Some(parent_id) => match self.representations.get_mut(&parent_id) {
                Some(parent) => parent.children.push(id),
                None => panic!(
                    "protocol violation: entity {} references unknown parent {}",
                    id, parent_id
                ),
            },
            None => {
                if active {
                    self.active_roots.insert(id);
                } else {
                    self.inactive_roots.insert(id);
                }
            }
        }
        self.representations.insert(id, rep);
        if id >= self.next_global_id {
            self.next_global_id = id + 1;
        }
    }

    pub fn contains(&self, id: i32) -> bool {
        self.representations.contains_key(&id)
    }

    pub fn get(&self, id: i32) -> Option<&Representation> {
        self.representations.get(&id)
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut Representation> {
        self.representations.get_mut(&id)
    }

    pub fn rep_count(&self) -> usize {
        self.representations.len()
    }

    /// Parent-first traversal of a subtree. The root comes out first; every
    /// node precedes its own children.
    pub fn subtree_top_down(&self, root: i32) -> Vec<i32> {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if let Some(rep) = self.representations.get(&id) {
                order.push(id);
                queue.extend(rep.children.iter().copied());
            }
        }
        order
    }

    /// Drops a representation and all its descendants, detaching the root
    /// from its parent and clearing any username bindings that pointed into
    /// the subtree. Returns the removed ids parent-first.
    pub fn remove_subtree(&mut self, root: i32) -> Vec<i32> {
        let doomed = self.subtree_top_down(root);
        if let Some(parent_id) = self.representations.get(&root).and_then(|r| r.parent) {
            if let Some(parent) = self.representations.get_mut(&parent_id) {
                parent.children.retain(|&child| child != root);
            }
        }
        for id in &doomed {
            self.representations.remove(id);
            self.active_roots.remove(id);
            self.inactive_roots.remove(id);
        }
        self.players.retain(|username, id| {
            let keep = !doomed.contains(id);
            if !keep {
                debug!("Dropping player binding '{}' with its representation", username);
            }
            keep
        });
        doomed
    }

    /// Moves a root from the inactive set to the active set (login).
    pub fn activate(&mut self, id: i32) {
        if self.inactive_roots.remove(&id) {
            self.active_roots.insert(id);
        }
    }

    /// Moves a root from the active set to the inactive set (logout). The
    /// representation survives for the next login.
    pub fn deactivate(&mut self, id: i32) {
        if self.active_roots.remove(&id) {
            self.inactive_roots.insert(id);
        }
    }

    pub fn bind_player(&mut self, username: &str, id: i32) {
        self.players.insert(username.to_owned(), id);
    }

    pub fn player_id(&self, username: &str) -> Option<i32> {
        self.players.get(username).copied()
    }

    pub fn players(&self) -> &HashMap<String, i32> {
        &self.players
    }

    /// Active root ids in ascending order, for deterministic iteration.
    pub fn active_root_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.active_roots.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn inactive_root_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.inactive_roots.iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}
