//! Typed per-device state cache.
//!
//! The normalization layer writes the latest reported value for each
//! `(device_uid, key)` pair; automation conditions read it. Values keep
//! their reported type and are coerced at evaluation time.

use parking_lot::RwLock;
use std::collections::HashMap;

/// A typed state value as reported by a device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StateValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    F32(f32),
}

impl StateValue {
    /// Numeric form: booleans map to 1.0/0.0, everything else widens.
    pub fn as_f64(self) -> f64 {
        match self {
            StateValue::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            StateValue::U32(v) => f64::from(v),
            StateValue::U64(v) => v as f64,
            StateValue::F32(v) => f64::from(v),
        }
    }

    /// Boolean form: floats are "true" outside a small dead zone,
    /// integers when non-zero.
    pub fn as_bool(self) -> bool {
        match self {
            StateValue::Bool(b) => b,
            StateValue::U32(v) => v != 0,
            StateValue::U64(v) => v != 0,
            StateValue::F32(v) => f64::from(v).abs() > 1e-6,
        }
    }
}

/// A cached value plus the timestamp of the report that produced it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateItem {
    pub value: StateValue,
    pub ts_ms: u64,
}

/// `(device_uid, key) -> StateItem` map shared between the normalization
/// layer (writer) and the rules engine (reader).
#[derive(Default)]
pub struct StateCache {
    items: RwLock<HashMap<(String, String), StateItem>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest value for `(uid, key)`.
    pub fn set(&self, uid: &str, key: &str, value: StateValue, ts_ms: u64) {
        self.items
            .write()
            .insert((uid.to_owned(), key.to_owned()), StateItem { value, ts_ms });
    }

    /// Latest value for `(uid, key)`, if any device ever reported one.
    pub fn get(&self, uid: &str, key: &str) -> Option<StateItem> {
        self.items
            .read()
            .get(&(uid.to_owned(), key.to_owned()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}
