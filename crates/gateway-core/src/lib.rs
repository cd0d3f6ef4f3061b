//! Gateway Core Library
//!
//! This crate provides the shared building blocks of the Zigbee gateway:
//! the normalized event model, the process-wide event bus, and the
//! per-device state cache consulted by automation conditions.
//!
//! # Modules
//!
//! - [`types`]: Normalized event and device-identifier types
//! - [`bus`]: Synchronous broadcast bus with a bounded ring log
//! - [`state`]: Typed `(device, key)` state cache

pub mod bus;
pub mod state;
pub mod types;

pub use bus::{EventBus, ListenerId, RING_CAP};
pub use state::{StateCache, StateItem, StateValue};
pub use types::{DeviceUid, Event};
