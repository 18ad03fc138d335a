//! Field registration and wire-index assignment.
//!
//! Field indices are the only per-update identifier on the wire, so every
//! participant must assign them identically for a given prefab. The contract:
//! three engine-reserved position fields occupy indices 0-2, then all
//! registered fields follow sorted alphabetically by name. Registration
//! order never matters; handles returned at registration stay valid because
//! they resolve through a declaration-to-index table built when the registry
//! is finalized.

use glam::Vec3;

use crate::field::{ChangeCallback, DeltaField, FieldValue};

/// Names of the engine-reserved position fields, indices 0-2 by contract.
pub const RESERVED_FIELDS: [&str; 3] = ["pos_x", "pos_y", "pos_z"];

/// Stable handle to a registered field, independent of wire-index sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHandle(usize);

/// Handles to the engine-reserved position components.
pub const POS_X: FieldHandle = FieldHandle(0);
pub const POS_Y: FieldHandle = FieldHandle(1);
pub const POS_Z: FieldHandle = FieldHandle(2);

/// Collects field declarations during an entity's registration hook.
pub struct FieldRegistry {
    decls: Vec<DeltaField>,
}

impl FieldRegistry {
    /// Starts a registry with the three reserved position floats declared.
    pub fn new() -> Self {
        let mut decls = Vec::with_capacity(8);
        for name in RESERVED_FIELDS {
            decls.push(DeltaField::new(name, FieldValue::Float(0.0)));
        }
        Self { decls }
    }

    pub fn add_int(&mut self, name: &str, initial: i32) -> FieldHandle {
        self.add(name, FieldValue::Int(initial))
    }

    pub fn add_float(&mut self, name: &str, initial: f32) -> FieldHandle {
        self.add(name, FieldValue::Float(initial))
    }

    pub fn add_string(&mut self, name: &str, initial: &str) -> FieldHandle {
        self.add(name, FieldValue::Str(initial.to_owned()))
    }

    pub fn add_vec3(&mut self, name: &str, initial: Vec3) -> FieldHandle {
        self.add(name, FieldValue::Vec3(initial))
    }

    pub fn add_quat(&mut self, name: &str, initial: glam::Quat) -> FieldHandle {
        self.add(name, FieldValue::Quat(initial))
    }

    /// Quantization resolution for a float field (see
    /// [`DeltaField::set_resolution`]).
    pub fn set_resolution(&mut self, handle: FieldHandle, resolution: f32) {
        self.decls[handle.0].set_resolution(resolution);
    }

    pub fn set_lerp_rate(&mut self, handle: FieldHandle, rate: f32) {
        self.decls[handle.0].set_lerp_rate(rate);
    }

    pub fn on_change(&mut self, handle: FieldHandle, callback: impl FnMut(&FieldValue) + 'static) {
        self.decls[handle.0].set_callback(Box::new(callback) as ChangeCallback);
    }

    fn add(&mut self, name: &str, initial: FieldValue) -> FieldHandle {
        if self.decls.iter().any(|d| d.name() == name) {
            panic!("duplicate field registration: '{}'", name);
        }
        self.decls.push(DeltaField::new(name, initial));
        FieldHandle(self.decls.len() - 1)
    }

    /// Freezes the schema: sorts everything after the reserved prefix
    /// alphabetically and builds the handle resolution table.
    pub fn finish(self) -> EntityFields {
        let decl_count = self.decls.len();

        // Wire order: declaration slots 3.. sorted by field name.
        let mut order: Vec<usize> = (RESERVED_FIELDS.len()..decl_count).collect();
        order.sort_by(|&a, &b| self.decls[a].name().cmp(self.decls[b].name()));

        let mut decl_to_index = vec![usize::MAX; decl_count];
        for (reserved, slot) in decl_to_index.iter_mut().enumerate().take(RESERVED_FIELDS.len()) {
            *slot = reserved;
        }
        for (offset, &decl) in order.iter().enumerate() {
            decl_to_index[decl] = RESERVED_FIELDS.len() + offset;
        }

        let mut ordered: Vec<(usize, DeltaField)> = self
            .decls
            .into_iter()
            .enumerate()
            .map(|(decl, field)| (decl_to_index[decl], field))
            .collect();
        ordered.sort_by_key(|(wire, _)| *wire);
        let fields: Vec<DeltaField> = ordered.into_iter().map(|(_, field)| field).collect();

        for (index, name) in RESERVED_FIELDS.iter().enumerate() {
            assert_eq!(
                fields[index].name(),
                *name,
                "position fields must occupy indices 0-2"
            );
        }

        EntityFields { fields, decl_to_index }
    }
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The finalized, wire-ordered field set of one entity.
pub struct EntityFields {
    fields: Vec<DeltaField>,
    decl_to_index: Vec<usize>,
}

impl EntityFields {
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Wire index a handle resolved to after sorting.
    pub fn index_of(&self, handle: FieldHandle) -> usize {
        self.decl_to_index[handle.0]
    }

    pub fn field(&self, handle: FieldHandle) -> &DeltaField {
        &self.fields[self.index_of(handle)]
    }

    pub fn field_mut(&mut self, handle: FieldHandle) -> &mut DeltaField {
        let index = self.index_of(handle);
        &mut self.fields[index]
    }

    /// # Panics
    /// Panics when the index is outside the schema; a peer that skips or
    /// invents field indices is violating the protocol.
    pub fn by_index(&self, index: usize) -> &DeltaField {
        if index >= self.fields.len() {
            panic!(
                "protocol violation: field index {} out of range ({} fields)",
                index,
                self.fields.len()
            );
        }
        &self.fields[index]
    }

    /// Mutable variant of [`EntityFields::by_index`], same panic contract.
    pub fn by_index_mut(&mut self, index: usize) -> &mut DeltaField {
        if index >= self.fields.len() {
            panic!(
                "protocol violation: field index {} out of range ({} fields)",
                index,
                self.fields.len()
            );
        }
        &mut self.fields[index]
    }

    pub fn set(&mut self, handle: FieldHandle, value: impl Into<FieldValue>) {
        self.field_mut(handle).set(value.into());
    }

    /// Writes a position through the three reserved fields with normal
    /// change-detection semantics.
    pub fn set_position(&mut self, position: Vec3) {
        self.fields[0].set(FieldValue::Float(position.x));
        self.fields[1].set(FieldValue::Float(position.y));
        self.fields[2].set(FieldValue::Float(position.z));
    }

    /// Confirmed position from the reserved fields' current values.
    pub fn position(&self) -> Vec3 {
        Vec3::new(
            self.fields[0].as_float(),
            self.fields[1].as_float(),
            self.fields[2].as_float(),
        )
    }

    /// Smoothed position for visual interpolation.
    pub fn lerped_position(&self) -> Vec3 {
        Vec3::new(
            self.fields[0].lerped_value(),
            self.fields[1].lerped_value(),
            self.fields[2].lerped_value(),
        )
    }

    /// Full serialization of every field, in wire-index order.
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.fields.iter().map(|f| f.snapshot_bytes()).collect()
    }

    /// Applies a full snapshot in wire-index order.
    ///
    /// # Panics
    /// Panics when the block count differs from the schema; a mismatch means
    /// the peer built this prefab with different fields.
    pub fn apply_snapshot(&mut self, blocks: &[Vec<u8>]) {
        if blocks.len() != self.fields.len() {
            panic!(
                "protocol violation: snapshot carries {} fields, schema has {}",
                blocks.len(),
                self.fields.len()
            );
        }
        for (field, block) in self.fields.iter_mut().zip(blocks) {
            field.deserialize(block);
        }
    }

    /// Declares every field transmitted; used right after a creation
    /// snapshot so first-tick mutations are not re-sent as diffs.
    pub fn mark_all_sent(&mut self) {
        for field in &mut self.fields {
            field.mark_sent();
        }
    }

    /// Removes all pending diffs in ascending index order.
    pub fn drain_queued(&mut self) -> Vec<(usize, Vec<u8>)> {
        let mut drained = Vec::new();
        for (index, field) in self.fields.iter_mut().enumerate() {
            if let Some(bytes) = field.take_queued() {
                drained.push((index, bytes));
            }
        }
        drained
    }

    pub fn advance_smoothing(&mut self, dt: f32) {
        for field in &mut self.fields {
            field.advance_smoothing(dt);
        }
    }

    pub fn seed_smoothing(&mut self) {
        for field in &mut self.fields {
            field.seed_smoothing();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_reserved_fields_occupy_first_indices() {
        let fields = FieldRegistry::new().finish();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields.by_index(0).name(), "pos_x");
        assert_eq!(fields.by_index(1).name(), "pos_y");
        assert_eq!(fields.by_index(2).name(), "pos_z");
        assert_eq!(fields.index_of(POS_X), 0);
        assert_eq!(fields.index_of(POS_Y), 1);
        assert_eq!(fields.index_of(POS_Z), 2);
    }

    #[test]
    fn test_indices_are_alphabetical_after_reserved() {
        let mut registry = FieldRegistry::new();
        let zeta = registry.add_int("zeta", 1);
        let alpha = registry.add_string("alpha", "a");
        let mid = registry.add_float("mid", 0.5);
        let fields = registry.finish();

        assert_eq!(fields.index_of(alpha), 3);
        assert_eq!(fields.index_of(mid), 4);
        assert_eq!(fields.index_of(zeta), 5);
        assert_eq!(fields.by_index(3).name(), "alpha");
        assert_eq!(fields.by_index(5).name(), "zeta");
    }

    #[test]
    fn test_registration_order_never_changes_indices() {
        let mut forward = FieldRegistry::new();
        forward.add_int("ammo", 3);
        forward.add_int("coins", 9);
        let forward = forward.finish();

        let mut backward = FieldRegistry::new();
        backward.add_int("coins", 9);
        backward.add_int("ammo", 3);
        let backward = backward.finish();

        for index in 0..forward.len() {
            assert_eq!(forward.by_index(index).name(), backward.by_index(index).name());
        }
    }

    #[test]
    fn test_handles_survive_sorting() {
        let mut registry = FieldRegistry::new();
        let z = registry.add_int("z_last", 26);
        let a = registry.add_int("a_first", 1);
        let mut fields = registry.finish();

        assert_eq!(fields.field(z).as_int(), 26);
        assert_eq!(fields.field(a).as_int(), 1);

        fields.set(z, 100);
        assert_eq!(fields.field(z).as_int(), 100);
        assert_eq!(fields.by_index(fields.index_of(z)).as_int(), 100);
    }

    #[test]
    #[should_panic(expected = "duplicate field registration")]
    fn test_duplicate_name_panics() {
        let mut registry = FieldRegistry::new();
        registry.add_int("hp", 1);
        registry.add_float("hp", 1.0);
    }

    #[test]
    #[should_panic(expected = "duplicate field registration")]
    fn test_reserved_name_collision_panics() {
        let mut registry = FieldRegistry::new();
        registry.add_float("pos_x", 0.0);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut registry = FieldRegistry::new();
        let hp = registry.add_int("hp", 80);
        let label = registry.add_string("label", "old");
        let mut source = registry.finish();
        source.set_position(Vec3::new(4.0, 5.0, 6.0));
        source.set(hp, 42);
        source.set(label, "new");

        let mut registry = FieldRegistry::new();
        registry.add_int("hp", 0);
        registry.add_string("label", "");
        let mut target = registry.finish();
        target.apply_snapshot(&source.snapshot());

        assert_eq!(target.field(hp).as_int(), 42);
        assert_eq!(target.field(label).as_str(), "new");
        assert_approx_eq!(target.position().x, 4.0);
        assert_approx_eq!(target.position().z, 6.0);
    }

    #[test]
    #[should_panic(expected = "snapshot carries")]
    fn test_snapshot_field_count_mismatch_panics() {
        let mut registry = FieldRegistry::new();
        registry.add_int("hp", 0);
        let mut fields = registry.finish();

        let short = vec![vec![0u8; 4]; 2];
        fields.apply_snapshot(&short);
    }

    #[test]
    fn test_drain_is_ascending_by_index() {
        let mut registry = FieldRegistry::new();
        let z = registry.add_int("z", 0);
        let a = registry.add_int("a", 0);
        let mut fields = registry.finish();

        // Mutate in reverse wire order; the drain still comes out ascending.
        fields.set(z, 1);
        fields.set(a, 2);
        fields.set_position(Vec3::new(1.0, 0.0, 0.0));

        let drained = fields.drain_queued();
        let indices: Vec<usize> = drained.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, fields.index_of(a), fields.index_of(z)]);

        assert!(fields.drain_queued().is_empty());
    }

    #[test]
    fn test_mark_all_sent_clears_queues() {
        let mut registry = FieldRegistry::new();
        let hp = registry.add_int("hp", 0);
        let mut fields = registry.finish();

        fields.set(hp, 9);
        fields.set_position(Vec3::splat(3.0));
        fields.mark_all_sent();
        assert!(fields.drain_queued().is_empty());

        // New changes after the snapshot flow again.
        fields.set(hp, 10);
        assert_eq!(fields.drain_queued().len(), 1);
    }
}
