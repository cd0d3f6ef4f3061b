//! Normalized event and device-identifier types.
//!
//! Every field on [`Event`] has a fixed byte bound so that events stay
//! cheap to copy across the engine queue and stable to render over the
//! UI event stream. Strings are truncated to their bound at publish time.

use serde::Serialize;
use std::fmt;

/// Event schema version stamped into every published event.
pub const EVENT_SCHEMA_VERSION: u8 = 1;

/// Maximum byte length of `Event::kind`.
pub const EVENT_TYPE_MAX: usize = 32;
/// Maximum byte length of `Event::source`.
pub const EVENT_SOURCE_MAX: usize = 16;
/// Maximum byte length of `Event::msg`.
pub const EVENT_MSG_MAX: usize = 128;
/// Maximum byte length of `Event::payload_json`.
pub const EVENT_PAYLOAD_MAX: usize = 192;
/// Maximum byte length of a device identifier ("0x" + 16 hex digits).
pub const UID_MAX: usize = 18;

/// Truncate `s` to at most `max` bytes without splitting a UTF-8 sequence.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Stable device identifier (EUI-64).
///
/// Canonical form is `0x` followed by 16 lowercase hex digits, but rule
/// documents may carry abbreviated identifiers; whatever string arrives is
/// kept verbatim up to [`UID_MAX`] bytes. Comparison is byte-wise.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceUid(String);

impl DeviceUid {
    /// Wrap an identifier string, truncating to [`UID_MAX`] bytes.
    pub fn new(s: &str) -> Self {
        Self(truncate_utf8(s, UID_MAX).to_owned())
    }

    /// Render a raw IEEE address in the canonical `0x` form.
    pub fn from_eui64(ieee: u64) -> Self {
        Self(format!("0x{}", hex::encode(ieee.to_be_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceUid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A normalized gateway event.
///
/// Ids are assigned by the bus at publish, strictly increasing and never
/// reused; `id == 0` is reserved for "none". `payload_json` carries an
/// optional JSON object as a string so that the event itself stays flat.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Event {
    /// Event schema version (for stream clients).
    pub v: u8,
    pub id: u32,
    pub ts_ms: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub device_uid: String,
    pub short_addr: u16,
    pub msg: String,
    pub payload_json: String,
}
