//! Durable bounded store of compiled automations.
//!
//! Holds at most [`STORE_CAP`] compiled rules in memory and mirrors every
//! mutation into a single fixed-size blob file before the call returns.
//! The blob is written to a temporary sibling and renamed into place, so
//! a crash mid-write leaves either the old image or the new one. A blob
//! that fails any structural check on load yields an empty store rather
//! than a partially trusted one.
//!
//! `put` is the only path that accepts an uncompiled rule document: it
//! compiles, enforces the static per-entry limits, and only then touches
//! the in-memory array and the file.

use bytes::{Buf, BufMut, BytesMut};
use gateway_core::types::truncate_utf8;
use gateway_rules::binfmt::{
    self, ACTION_SIZE, AUTOMATION_SIZE, CONDITION_SIZE, HEADER_SIZE, TRIGGER_SIZE,
};
use gateway_rules::{compile, CompileError, CompiledRule};
use parking_lot::Mutex;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Maximum number of stored automations.
pub const STORE_CAP: usize = 32;
/// Static per-entry record limits.
pub const MAX_TRIGGERS: usize = 8;
pub const MAX_CONDITIONS: usize = 8;
pub const MAX_ACTIONS: usize = 8;
/// Static per-entry string-table limit in bytes.
pub const MAX_STRTAB: usize = 768;

/// Fixed metadata field widths inside an entry slot.
const ID_BYTES: usize = 32;
const NAME_BYTES: usize = 48;

/// Largest compiled image the limits above allow.
const ENTRY_BLOB_MAX: usize = HEADER_SIZE
    + AUTOMATION_SIZE
    + MAX_TRIGGERS * TRIGGER_SIZE
    + MAX_CONDITIONS * CONDITION_SIZE
    + MAX_ACTIONS * ACTION_SIZE
    + MAX_STRTAB;

/// id + name + enabled + reserved + image length prefix.
const ENTRY_META: usize = ID_BYTES + NAME_BYTES + 1 + 3 + 4;
const ENTRY_SLOT: usize = ENTRY_META + ENTRY_BLOB_MAX;

/// `'AUTO'` little-endian.
const STORE_MAGIC: u32 = 0x4155_544f;
const STORE_VERSION: u16 = 1;
const BLOB_HEADER: usize = 8;
const BLOB_SIZE: usize = BLOB_HEADER + STORE_CAP * ENTRY_SLOT;

const STORE_FILE: &str = "automations.bin";

/// Store operation failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("automation not found")]
    NotFound,
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),
    #[error("compile failed: {0}")]
    Compile(#[from] CompileError),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// One stored automation.
#[derive(Clone, Debug)]
pub struct StoreEntry {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub compiled: CompiledRule,
}

/// Listing row without the compiled body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleMeta {
    pub id: String,
    pub name: String,
    pub enabled: bool,
}

/// Bounded, durable automation store.
pub struct RuleStore {
    path: PathBuf,
    entries: Mutex<Vec<StoreEntry>>,
}

impl RuleStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE);
        let entries = load(&path);
        info!("rule store opened: {} automations", entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Metadata of every stored automation.
    pub fn list(&self) -> Vec<RuleMeta> {
        self.entries
            .lock()
            .iter()
            .map(|e| RuleMeta {
                id: e.id.clone(),
                name: e.name.clone(),
                enabled: e.enabled,
            })
            .collect()
    }

    /// Full entry by id.
    pub fn get(&self, id: &str) -> Result<StoreEntry, StoreError> {
        if id.is_empty() {
            return Err(StoreError::InvalidArgument("empty id"));
        }
        self.entries
            .lock()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Compile and store a rule document, replacing any entry with the
    /// same id. Fails without side effects on any validation miss.
    pub fn put(&self, doc: &Value) -> Result<(), StoreError> {
        let compiled = compile(doc)?;
        let id = compiled.id().to_owned();
        if id.len() > ID_BYTES {
            return Err(StoreError::InvalidArgument("id too long"));
        }
        check_limits(&compiled)?;

        let entry = StoreEntry {
            id: id.clone(),
            name: truncate_utf8(compiled.name(), NAME_BYTES).to_owned(),
            enabled: compiled.automation.enabled,
            compiled,
        };

        let mut entries = self.entries.lock();
        let mut staged = entries.clone();
        match staged.iter_mut().find(|e| e.id == id) {
            Some(slot) => *slot = entry,
            None => {
                if staged.len() >= STORE_CAP {
                    return Err(StoreError::CapacityExceeded("store full"));
                }
                staged.push(entry);
            }
        }
        self.persist(&staged)?;
        *entries = staged;
        Ok(())
    }

    /// Remove an automation by id.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::InvalidArgument("empty id"));
        }
        let mut entries = self.entries.lock();
        if !entries.iter().any(|e| e.id == id) {
            return Err(StoreError::NotFound);
        }
        let staged: Vec<StoreEntry> = entries.iter().filter(|e| e.id != id).cloned().collect();
        self.persist(&staged)?;
        *entries = staged;
        Ok(())
    }

    /// Flip the enabled flag of a stored automation.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::InvalidArgument("empty id"));
        }
        let mut entries = self.entries.lock();
        let mut staged = entries.clone();
        let entry = staged
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound)?;
        entry.enabled = enabled;
        entry.compiled.automation.enabled = enabled;
        self.persist(&staged)?;
        *entries = staged;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Write the staged image to a temporary sibling, then rename it over
    /// the live file. Called with the entry lock held so mutations stay
    /// serialized against each other.
    fn persist(&self, entries: &[StoreEntry]) -> Result<(), StoreError> {
        let blob = encode(entries);
        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&blob)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn check_limits(compiled: &CompiledRule) -> Result<(), StoreError> {
    if compiled.triggers.len() > MAX_TRIGGERS {
        return Err(StoreError::CapacityExceeded("too many triggers"));
    }
    if compiled.conditions.len() > MAX_CONDITIONS {
        return Err(StoreError::CapacityExceeded("too many conditions"));
    }
    if compiled.actions.len() > MAX_ACTIONS {
        return Err(StoreError::CapacityExceeded("too many actions"));
    }
    if compiled.strings.size() > MAX_STRTAB {
        return Err(StoreError::CapacityExceeded("string table too large"));
    }
    Ok(())
}

fn encode(entries: &[StoreEntry]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(BLOB_SIZE);
    buf.put_u32_le(STORE_MAGIC);
    buf.put_u16_le(STORE_VERSION);
    buf.put_u16_le(entries.len() as u16);
    for entry in entries {
        put_fixed(&mut buf, entry.id.as_bytes(), ID_BYTES);
        put_fixed(&mut buf, entry.name.as_bytes(), NAME_BYTES);
        buf.put_u8(u8::from(entry.enabled));
        buf.put_bytes(0, 3);
        let image = binfmt::serialize(&entry.compiled);
        debug_assert!(image.len() <= ENTRY_BLOB_MAX);
        buf.put_u32_le(image.len() as u32);
        buf.put_slice(&image);
        buf.put_bytes(0, ENTRY_BLOB_MAX - image.len());
    }
    buf.put_bytes(0, (STORE_CAP - entries.len()) * ENTRY_SLOT);
    debug_assert_eq!(buf.len(), BLOB_SIZE);
    buf.to_vec()
}

/// Load the durable image, degrading to an empty store on any problem.
fn load(path: &Path) -> Vec<StoreEntry> {
    let blob = match fs::read(path) {
        Ok(blob) => blob,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("rule store unreadable, starting empty: {e}");
            return Vec::new();
        }
    };
    match decode(&blob) {
        Ok(entries) => entries,
        Err(reason) => {
            warn!("rule store image rejected ({reason}), starting empty");
            Vec::new()
        }
    }
}

fn decode(blob: &[u8]) -> Result<Vec<StoreEntry>, &'static str> {
    if blob.len() != BLOB_SIZE {
        return Err("bad size");
    }
    let mut rd = blob;
    if rd.get_u32_le() != STORE_MAGIC {
        return Err("bad magic");
    }
    if rd.get_u16_le() != STORE_VERSION {
        return Err("bad version");
    }
    let count = rd.get_u16_le() as usize;
    if count > STORE_CAP {
        return Err("bad count");
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let id = get_fixed(&mut rd, ID_BYTES).ok_or("bad id")?;
        if id.is_empty() {
            return Err("bad id");
        }
        let name = get_fixed(&mut rd, NAME_BYTES).ok_or("bad name")?;
        let enabled = rd.get_u8() != 0;
        rd.advance(3);
        let image_len = rd.get_u32_le() as usize;
        if image_len > ENTRY_BLOB_MAX {
            return Err("bad image length");
        }
        let compiled = binfmt::deserialize(&rd[..image_len]).map_err(|_| "bad image")?;
        rd.advance(ENTRY_BLOB_MAX);
        entries.push(StoreEntry { id, name, enabled, compiled });
    }
    Ok(entries)
}

fn put_fixed(buf: &mut BytesMut, bytes: &[u8], width: usize) {
    let n = bytes.len().min(width);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, width - n);
}

/// Read a NUL-padded fixed-width string field.
fn get_fixed(rd: &mut &[u8], width: usize) -> Option<String> {
    let raw = &rd[..width];
    let n = raw.iter().position(|&b| b == 0).unwrap_or(width);
    let s = std::str::from_utf8(&raw[..n]).ok()?.to_owned();
    rd.advance(width);
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn rule_doc(id: &str) -> Value {
        json!({
            "id": id,
            "name": format!("rule {id}"),
            "enabled": true,
            "triggers": [{
                "type": "event", "event_type": "zigbee.command",
                "match": {"device_uid": "0x000A", "payload.cmd": "toggle"}
            }],
            "actions": [{
                "type": "zigbee", "cmd": "onoff.toggle",
                "device_uid": "0x000B", "endpoint": 1
            }]
        })
    }

    #[test]
    fn put_get_list_remove() {
        let dir = tempdir().unwrap();
        let store = RuleStore::open(dir.path()).unwrap();
        assert!(store.is_empty());

        store.put(&rule_doc("r1")).unwrap();
        store.put(&rule_doc("r2")).unwrap();
        assert_eq!(store.len(), 2);

        let entry = store.get("r1").unwrap();
        assert_eq!(entry.name, "rule r1");
        assert!(entry.enabled);
        assert_eq!(entry.compiled.id(), "r1");

        store.remove("r1").unwrap();
        assert!(matches!(store.get("r1"), Err(StoreError::NotFound)));
        assert_eq!(store.list(), vec![RuleMeta {
            id: "r2".into(),
            name: "rule r2".into(),
            enabled: true
        }]);
    }

    #[test]
    fn put_replaces_same_id() {
        let dir = tempdir().unwrap();
        let store = RuleStore::open(dir.path()).unwrap();
        store.put(&rule_doc("r1")).unwrap();

        let mut doc = rule_doc("r1");
        doc["name"] = json!("renamed");
        store.put(&doc).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("r1").unwrap().name, "renamed");
    }

    #[test]
    fn survives_reopen_byte_identical() {
        let dir = tempdir().unwrap();
        let image_before;
        {
            let store = RuleStore::open(dir.path()).unwrap();
            store.put(&rule_doc("r1")).unwrap();
            image_before = binfmt::serialize(&store.get("r1").unwrap().compiled);
        }
        let store = RuleStore::open(dir.path()).unwrap();
        let entry = store.get("r1").unwrap();
        assert!(entry.enabled);
        assert_eq!(binfmt::serialize(&entry.compiled), image_before);
    }

    #[test]
    fn set_enabled_persists() {
        let dir = tempdir().unwrap();
        {
            let store = RuleStore::open(dir.path()).unwrap();
            store.put(&rule_doc("r1")).unwrap();
            store.set_enabled("r1", false).unwrap();
            assert!(matches!(
                store.set_enabled("ghost", true),
                Err(StoreError::NotFound)
            ));
        }
        let store = RuleStore::open(dir.path()).unwrap();
        let entry = store.get("r1").unwrap();
        assert!(!entry.enabled);
        assert!(!entry.compiled.automation.enabled);
    }

    #[test]
    fn capacity_is_enforced_without_side_effects() {
        let dir = tempdir().unwrap();
        let store = RuleStore::open(dir.path()).unwrap();
        for i in 0..STORE_CAP {
            store.put(&rule_doc(&format!("r{i}"))).unwrap();
        }
        let before = store.list();
        let err = store.put(&rule_doc("overflow")).unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded(_)));
        assert_eq!(store.list(), before);

        // The durable image is untouched too.
        let reopened = RuleStore::open(dir.path()).unwrap();
        assert_eq!(reopened.list(), before);
    }

    #[test]
    fn per_entry_limits_are_enforced() {
        let dir = tempdir().unwrap();
        let store = RuleStore::open(dir.path()).unwrap();

        let trigger = json!({"type": "event", "event_type": "device.join"});
        let doc = json!({
            "id": "big", "name": "too many triggers",
            "triggers": vec![trigger; MAX_TRIGGERS + 1],
            "actions": [{"type": "zigbee", "cmd": "onoff.on",
                         "device_uid": "0x000B", "endpoint": 1}]
        });
        assert!(matches!(
            store.put(&doc),
            Err(StoreError::CapacityExceeded("too many triggers"))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn corrupt_blob_loads_empty_then_recovers() {
        let dir = tempdir().unwrap();
        {
            let store = RuleStore::open(dir.path()).unwrap();
            store.put(&rule_doc("r1")).unwrap();
        }

        // Truncate the blob.
        let path = dir.path().join(STORE_FILE);
        let blob = fs::read(&path).unwrap();
        fs::write(&path, &blob[..blob.len() / 2]).unwrap();
        let store = RuleStore::open(dir.path()).unwrap();
        assert!(store.is_empty());

        // Flip a byte inside the first entry's image.
        store.put(&rule_doc("r1")).unwrap();
        drop(store);
        let mut blob = fs::read(&path).unwrap();
        blob[BLOB_HEADER + ENTRY_META] ^= 0xFF;
        fs::write(&path, &blob).unwrap();
        let store = RuleStore::open(dir.path()).unwrap();
        assert!(store.is_empty());

        // A fresh put persists and reloads.
        store.put(&rule_doc("r2")).unwrap();
        drop(store);
        let store = RuleStore::open(dir.path()).unwrap();
        assert_eq!(store.get("r2").unwrap().id, "r2");
    }

    #[test]
    fn compile_failures_leave_store_unchanged() {
        let dir = tempdir().unwrap();
        let store = RuleStore::open(dir.path()).unwrap();
        store.put(&rule_doc("r1")).unwrap();

        let err = store.put(&json!({"name": "no id"})).unwrap_err();
        assert!(matches!(err, StoreError::Compile(_)));
        assert_eq!(store.len(), 1);

        assert!(matches!(
            store.get(""),
            Err(StoreError::InvalidArgument("empty id"))
        ));
    }

    #[test]
    fn blob_size_is_constant() {
        let dir = tempdir().unwrap();
        let store = RuleStore::open(dir.path()).unwrap();
        store.put(&rule_doc("r1")).unwrap();
        let path = dir.path().join(STORE_FILE);
        assert_eq!(fs::read(&path).unwrap().len(), BLOB_SIZE);
        store.put(&rule_doc("r2")).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), BLOB_SIZE);
    }
}
