//! Delta fields: replicated values with change detection and quantized,
//! last-write-wins send queueing.
//!
//! A field only ever queues one pending diff. Local mutations queue it when
//! they move the value at least the configured resolution away from the last
//! value actually sent; incoming network values are applied directly and
//! never re-queued, which is what distinguishes confirmed state from locally
//! proposed state.

use std::fmt;

use glam::{Quat, Vec3};

/// Smoothing rate applied to float fields that never configure their own.
pub const DEFAULT_LERP_RATE: f32 = 10.0;

/// A single replicated value. The wire encoding carries no tag; both ends
/// know the kind from the entity schema.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i32),
    Float(f32),
    Str(String),
    Vec3(Vec3),
    Quat(Quat),
}

impl FieldValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            FieldValue::Int(v) => crate::codec::write_i32(&mut out, *v),
            FieldValue::Float(v) => crate::codec::write_f32(&mut out, *v),
            FieldValue::Str(v) => crate::codec::write_string(&mut out, v),
            FieldValue::Vec3(v) => crate::codec::write_vec3(&mut out, *v),
            FieldValue::Quat(v) => crate::codec::write_quat(&mut out, *v),
        }
        out
    }

    /// Decodes `bytes` as this value's own kind.
    ///
    /// # Panics
    /// Panics when the payload width does not match the kind exactly.
    pub fn decode_like(&self, bytes: &[u8]) -> FieldValue {
        let mut cursor = 0;
        let decoded = match self {
            FieldValue::Int(_) => FieldValue::Int(crate::codec::read_i32(bytes, &mut cursor)),
            FieldValue::Float(_) => FieldValue::Float(crate::codec::read_f32(bytes, &mut cursor)),
            FieldValue::Str(_) => FieldValue::Str(crate::codec::read_string(bytes, &mut cursor)),
            FieldValue::Vec3(_) => FieldValue::Vec3(crate::codec::read_vec3(bytes, &mut cursor)),
            FieldValue::Quat(_) => FieldValue::Quat(crate::codec::read_quat(bytes, &mut cursor)),
        };
        if cursor != bytes.len() {
            panic!(
                "protocol violation: {} trailing bytes in a {} field payload",
                bytes.len() - cursor,
                self.kind_name()
            );
        }
        decoded
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Str(_) => "string",
            FieldValue::Vec3(_) => "vec3",
            FieldValue::Quat(_) => "quat",
        }
    }

    fn same_kind(&self, other: &FieldValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<Vec3> for FieldValue {
    fn from(v: Vec3) -> Self {
        FieldValue::Vec3(v)
    }
}

impl From<Quat> for FieldValue {
    fn from(v: Quat) -> Self {
        FieldValue::Quat(v)
    }
}

pub type ChangeCallback = Box<dyn FnMut(&FieldValue)>;

/// One replicated field of an entity.
pub struct DeltaField {
    name: String,
    value: FieldValue,
    last_sent: FieldValue,
    queued: Option<Vec<u8>>,
    resolution: f32,
    lerp_rate: f32,
    smoothed: f32,
    callback: Option<ChangeCallback>,
}

impl DeltaField {
    pub fn new(name: impl Into<String>, initial: FieldValue) -> Self {
        let smoothed = match initial {
            FieldValue::Float(v) => v,
            _ => 0.0,
        };
        Self {
            name: name.into(),
            last_sent: initial.clone(),
            value: initial,
            queued: None,
            resolution: 0.0,
            lerp_rate: DEFAULT_LERP_RATE,
            smoothed,
            callback: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    pub fn resolution(&self) -> f32 {
        self.resolution
    }

    /// Minimum change versus the last sent value that still queues a diff.
    /// Meaningful for float fields; other kinds send on any difference.
    pub fn set_resolution(&mut self, resolution: f32) {
        self.resolution = resolution;
    }

    pub fn set_lerp_rate(&mut self, rate: f32) {
        self.lerp_rate = rate;
    }

    pub fn set_callback(&mut self, callback: ChangeCallback) {
        self.callback = Some(callback);
    }

    /// Mutates the field locally.
    ///
    /// No-op when `value` equals the current value. Otherwise the change
    /// callback fires, and the diff queue is recomputed against the last sent
    /// value: at least the resolution away queues the new value (overwriting
    /// any unsent diff), closer than that clears the queue (the receiver's
    /// copy is already close enough).
    ///
    /// # Panics
    /// Panics when `value` is a different kind than the field.
    pub fn set(&mut self, value: FieldValue) {
        if !value.same_kind(&self.value) {
            panic!(
                "field '{}' is {}, got a {} value",
                self.name,
                self.value.kind_name(),
                value.kind_name()
            );
        }
        if value == self.value {
            return;
        }
        self.value = value;
        if let Some(callback) = &mut self.callback {
            callback(&self.value);
        }
        if self.exceeds_resolution() {
            self.queued = Some(self.value.encode());
        } else {
            self.queued = None;
        }
    }

    /// Applies a confirmed network value: no re-queueing, the callback still
    /// fires, and the last-sent marker converges on the incoming value.
    pub fn deserialize(&mut self, bytes: &[u8]) {
        let incoming = self.value.decode_like(bytes);
        self.value = incoming.clone();
        self.last_sent = incoming;
        if let Some(callback) = &mut self.callback {
            callback(&self.value);
        }
    }

    /// Full serialization of the current value, for creation snapshots and
    /// persistence. Does not touch the diff queue.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.value.encode()
    }

    /// Declares the current value as transmitted without draining: clears any
    /// queued diff. Used after a creation snapshot captured every field.
    pub fn mark_sent(&mut self) {
        self.last_sent = self.value.clone();
        self.queued = None;
    }

    pub fn has_queued(&self) -> bool {
        self.queued.is_some()
    }

    /// Removes the pending diff, if any, and marks its value as sent.
    pub fn take_queued(&mut self) -> Option<Vec<u8>> {
        let bytes = self.queued.take()?;
        self.last_sent = self.value.clone();
        Some(bytes)
    }

    /// Advances the hidden smoothing value toward the current value with an
    /// exponential approach. No-op for non-float fields.
    pub fn advance_smoothing(&mut self, dt: f32) {
        if let FieldValue::Float(target) = self.value {
            let blend = 1.0 - (-self.lerp_rate * dt).exp();
            self.smoothed += (target - self.smoothed) * blend;
        }
    }

    /// Re-seeds smoothing to the current value so a freshly created entity
    /// does not visibly snap from zero.
    pub fn seed_smoothing(&mut self) {
        if let FieldValue::Float(v) = self.value {
            self.smoothed = v;
        }
    }

    /// Smoothed reading for visual interpolation, never for logic.
    ///
    /// # Panics
    /// Panics on non-float fields.
    pub fn lerped_value(&self) -> f32 {
        match self.value {
            FieldValue::Float(_) => self.smoothed,
            _ => panic!("field '{}' is {}, not float", self.name, self.value.kind_name()),
        }
    }

    /// # Panics
    /// Panics if the field is not an int.
    pub fn as_int(&self) -> i32 {
        match self.value {
            FieldValue::Int(v) => v,
            _ => panic!("field '{}' is {}, not int", self.name, self.value.kind_name()),
        }
    }

    /// # Panics
    /// Panics if the field is not a float.
    pub fn as_float(&self) -> f32 {
        match self.value {
            FieldValue::Float(v) => v,
            _ => panic!("field '{}' is {}, not float", self.name, self.value.kind_name()),
        }
    }

    /// # Panics
    /// Panics if the field is not a string.
    pub fn as_str(&self) -> &str {
        match &self.value {
            FieldValue::Str(v) => v,
            _ => panic!("field '{}' is {}, not string", self.name, self.value.kind_name()),
        }
    }

    /// # Panics
    /// Panics if the field is not a vec3.
    pub fn as_vec3(&self) -> Vec3 {
        match self.value {
            FieldValue::Vec3(v) => v,
            _ => panic!("field '{}' is {}, not vec3", self.name, self.value.kind_name()),
        }
    }

    /// # Panics
    /// Panics if the field is not a quaternion.
    pub fn as_quat(&self) -> Quat {
        match self.value {
            FieldValue::Quat(v) => v,
            _ => panic!("field '{}' is {}, not quat", self.name, self.value.kind_name()),
        }
    }

    fn exceeds_resolution(&self) -> bool {
        match (&self.value, &self.last_sent) {
            (FieldValue::Float(v), FieldValue::Float(sent)) => {
                let delta = (v - sent).abs();
                // A move of exactly the resolution counts as a change; a
                // resolution of zero sends on any difference.
                if self.resolution > 0.0 {
                    delta >= self.resolution
                } else {
                    delta > 0.0
                }
            }
            _ => self.value != self.last_sent,
        }
    }
}

impl fmt::Debug for DeltaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaField")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("queued", &self.queued.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_roundtrip_every_kind() {
        let values = [
            FieldValue::Int(-7),
            FieldValue::Int(i32::MAX),
            FieldValue::Float(0.0),
            FieldValue::Float(-3.0e8),
            FieldValue::Str("x".repeat(255)),
            FieldValue::Vec3(Vec3::new(1.0, 2.0, 3.0)),
            FieldValue::Quat(Quat::from_xyzw(0.0, 0.7, 0.0, 0.7)),
        ];
        for value in values {
            let mut field = DeltaField::new("f", value.clone());
            let bytes = field.snapshot_bytes();

            let mut other = DeltaField::new("f", blank_like(&value));
            other.deserialize(&bytes);
            assert_eq!(*other.value(), value);

            // deserialize never queues
            assert!(!other.has_queued());
            // and the source field never queued either
            assert!(!field.has_queued());
            field.mark_sent();
        }
    }

    #[test]
    fn test_set_same_value_is_noop() {
        let calls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&calls);

        let mut field = DeltaField::new("score", FieldValue::Int(10));
        field.set_callback(Box::new(move |_| *counter.borrow_mut() += 1));

        field.set(FieldValue::Int(10));
        assert_eq!(*calls.borrow(), 0);
        assert!(!field.has_queued());

        field.set(FieldValue::Int(11));
        assert_eq!(*calls.borrow(), 1);
        assert!(field.has_queued());
    }

    #[test]
    fn test_default_resolution_sends_any_change() {
        let mut field = DeltaField::new("hp", FieldValue::Int(0));
        field.set(FieldValue::Int(1));
        assert_eq!(field.take_queued().unwrap(), FieldValue::Int(1).encode());
        assert!(field.take_queued().is_none());
    }

    #[test]
    fn test_resolution_suppresses_small_changes() {
        let mut field = DeltaField::new("heading", FieldValue::Float(0.0));
        field.set_resolution(0.5);

        // Repeated sub-resolution moves relative to the last sent value
        // never queue anything.
        field.set(FieldValue::Float(0.2));
        field.set(FieldValue::Float(0.4));
        field.set(FieldValue::Float(0.45));
        assert!(!field.has_queued());

        // One move past the resolution queues exactly one diff.
        field.set(FieldValue::Float(0.8));
        assert!(field.has_queued());
        let bytes = field.take_queued().unwrap();
        assert_eq!(bytes, FieldValue::Float(0.8).encode());

        // Sub-resolution drift around the newly sent value stays quiet.
        field.set(FieldValue::Float(1.1));
        assert!(!field.has_queued());
    }

    #[test]
    fn test_change_of_exactly_the_resolution_queues() {
        let mut field = DeltaField::new("heading", FieldValue::Float(0.0));
        field.set_resolution(0.5);

        field.set(FieldValue::Float(0.49));
        assert!(!field.has_queued());

        // Landing exactly on the resolution is a change, not drift.
        field.set(FieldValue::Float(0.5));
        assert!(field.has_queued());
        assert_eq!(field.take_queued().unwrap(), FieldValue::Float(0.5).encode());
        assert!(field.take_queued().is_none());
    }

    #[test]
    fn test_last_write_wins_coalescing() {
        let mut field = DeltaField::new("hp", FieldValue::Int(0));
        field.set(FieldValue::Int(5));
        field.set(FieldValue::Int(9));
        field.set(FieldValue::Int(2));

        let bytes = field.take_queued().unwrap();
        assert_eq!(bytes, FieldValue::Int(2).encode());
        assert!(field.take_queued().is_none());
    }

    #[test]
    fn test_revert_to_last_sent_clears_queue() {
        let mut field = DeltaField::new("hp", FieldValue::Int(3));
        field.set(FieldValue::Int(8));
        assert!(field.has_queued());

        field.set(FieldValue::Int(3));
        assert!(!field.has_queued(), "a stale diff must not resurrect an abandoned change");
    }

    #[test]
    fn test_deserialize_fires_callback_without_queueing() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);

        let mut field = DeltaField::new("label", FieldValue::Str(String::new()));
        field.set_callback(Box::new(move |v| sink.borrow_mut().push(v.clone())));

        field.deserialize(&FieldValue::Str("ruby".into()).encode());
        assert_eq!(field.as_str(), "ruby");
        assert!(!field.has_queued());
        assert_eq!(seen.borrow().len(), 1);

        // Converged: setting the same value back queues nothing.
        field.set(FieldValue::Str("ruby".into()));
        assert!(!field.has_queued());
    }

    #[test]
    fn test_smoothing_approaches_target_without_snap() {
        let mut field = DeltaField::new("pos_x", FieldValue::Float(100.0));
        field.seed_smoothing();
        assert_approx_eq!(field.lerped_value(), 100.0);

        field.deserialize(&FieldValue::Float(110.0).encode());
        assert_approx_eq!(field.lerped_value(), 100.0);

        let mut last = 100.0;
        for _ in 0..20 {
            field.advance_smoothing(0.05);
            let now = field.lerped_value();
            assert!(now > last && now <= 110.0);
            last = now;
        }
        for _ in 0..200 {
            field.advance_smoothing(0.05);
        }
        assert_approx_eq!(field.lerped_value(), 110.0, 0.01);
    }

    #[test]
    #[should_panic(expected = "is int, got a float value")]
    fn test_kind_mismatch_panics() {
        let mut field = DeltaField::new("hp", FieldValue::Int(0));
        field.set(FieldValue::Float(1.0));
    }

    #[test]
    #[should_panic(expected = "trailing bytes")]
    fn test_wrong_width_payload_panics() {
        let mut field = DeltaField::new("hp", FieldValue::Int(0));
        field.deserialize(&[0, 0, 0, 0, 0]);
    }

    // HELPER FUNCTIONS

    fn blank_like(value: &FieldValue) -> FieldValue {
        match value {
            FieldValue::Int(_) => FieldValue::Int(0),
            FieldValue::Float(_) => FieldValue::Float(0.0),
            FieldValue::Str(_) => FieldValue::Str(String::new()),
            FieldValue::Vec3(_) => FieldValue::Vec3(Vec3::ZERO),
            FieldValue::Quat(_) => FieldValue::Quat(Quat::IDENTITY),
        }
    }
}
