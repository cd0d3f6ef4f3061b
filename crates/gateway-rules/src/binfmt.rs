//! Versioned binary serialization of compiled rules.
//!
//! Wire layout (all integers little-endian, offsets absolute):
//!
//! ```text
//! header | automation[] | triggers[] | conditions[] | actions[] | strings
//! ```
//!
//! The serializer computes the absolute section offsets and patches them
//! into the header before writing. Records are written and read
//! field-by-field rather than memcpy'd, which keeps the codec portable
//! across alignment and endianness rules. The deserializer verifies every
//! declared window against the buffer length before touching it.

use crate::records::{
    ActionKind, ActionRecord, AutomationRecord, BadDiscriminant, CompiledRule, CondOp, CondRecord,
    CondValue, EventKind, TriggerRecord, ValueTag,
};
use crate::strtab::StringTable;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// `'GWAR'` little-endian.
pub const MAGIC: u32 = 0x5241_5747;
pub const VERSION: u16 = 2;

pub const HEADER_SIZE: usize = 48;
pub const AUTOMATION_SIZE: usize = 36;
pub const TRIGGER_SIZE: usize = 16;
pub const CONDITION_SIZE: usize = 20;
pub const ACTION_SIZE: usize = 32;

/// Rejection reasons for a compiled-rule image.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("truncated buffer")]
    Truncated,
    #[error("bad magic or version")]
    BadMagic,
    #[error("section out of bounds: {0}")]
    OutOfBounds(&'static str),
    #[error("bad automation count")]
    BadAutomationCount,
    #[error("record window out of range: {0}")]
    BadWindow(&'static str),
    #[error("bad string reference: {0}")]
    BadStringRef(&'static str),
    #[error(transparent)]
    Discriminant(#[from] BadDiscriminant),
}

struct Header {
    automation_count: u32,
    trigger_count: u32,
    condition_count: u32,
    action_count: u32,
    automations_off: u32,
    triggers_off: u32,
    conditions_off: u32,
    actions_off: u32,
    strings_off: u32,
    strings_size: u32,
}

/// Serialize a compiled rule into a contiguous image.
pub fn serialize(rule: &CompiledRule) -> Vec<u8> {
    let automations_off = HEADER_SIZE;
    let triggers_off = automations_off + AUTOMATION_SIZE;
    let conditions_off = triggers_off + rule.triggers.len() * TRIGGER_SIZE;
    let actions_off = conditions_off + rule.conditions.len() * CONDITION_SIZE;
    let strings_off = actions_off + rule.actions.len() * ACTION_SIZE;
    let total = strings_off + rule.strings.size();

    let mut buf = BytesMut::with_capacity(total);

    // Header.
    buf.put_u32_le(MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_u16_le(0); // reserved
    buf.put_u32_le(1); // automation_count: single-rule bundle
    buf.put_u32_le(rule.triggers.len() as u32);
    buf.put_u32_le(rule.conditions.len() as u32);
    buf.put_u32_le(rule.actions.len() as u32);
    buf.put_u32_le(automations_off as u32);
    buf.put_u32_le(triggers_off as u32);
    buf.put_u32_le(conditions_off as u32);
    buf.put_u32_le(actions_off as u32);
    buf.put_u32_le(strings_off as u32);
    buf.put_u32_le(rule.strings.size() as u32);

    // Automation record.
    let a = &rule.automation;
    buf.put_u32_le(a.id_off);
    buf.put_u32_le(a.name_off);
    buf.put_u8(u8::from(a.enabled));
    buf.put_u8(a.mode);
    buf.put_u16_le(0); // reserved
    buf.put_u32_le(a.triggers_index);
    buf.put_u32_le(a.triggers_count);
    buf.put_u32_le(a.conditions_index);
    buf.put_u32_le(a.conditions_count);
    buf.put_u32_le(a.actions_index);
    buf.put_u32_le(a.actions_count);

    for t in &rule.triggers {
        buf.put_u8(t.event_kind as u8);
        buf.put_u8(t.endpoint);
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(t.device_uid_off);
        buf.put_u32_le(t.cmd_off);
        buf.put_u16_le(t.cluster_id);
        buf.put_u16_le(t.attr_id);
    }

    for c in &rule.conditions {
        buf.put_u8(c.op as u8);
        buf.put_u8(c.value.tag() as u8);
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(c.device_uid_off);
        buf.put_u32_le(c.key_off);
        match c.value {
            CondValue::F64(v) => buf.put_f64_le(v),
            CondValue::Bool(b) => {
                buf.put_u8(u8::from(b));
                buf.put_bytes(0, 7);
            }
        }
    }

    for act in &rule.actions {
        buf.put_u8(act.kind as u8);
        buf.put_u8(act.endpoint);
        buf.put_u8(act.aux_ep);
        buf.put_u8(act.flags);
        buf.put_u16_le(act.u16_0);
        buf.put_u16_le(act.u16_1);
        buf.put_u32_le(act.cmd_off);
        buf.put_u32_le(act.uid_off);
        buf.put_u32_le(act.uid2_off);
        buf.put_u32_le(act.arg0);
        buf.put_u32_le(act.arg1);
        buf.put_u32_le(act.arg2);
    }

    buf.put_slice(rule.strings.as_bytes());

    debug_assert_eq!(buf.len(), total);
    buf.to_vec()
}

/// Deserialize a compiled-rule image into owned records.
pub fn deserialize(buf: &[u8]) -> Result<CompiledRule, FormatError> {
    let hdr = read_header(buf)?;

    let automations = section(buf, hdr.automations_off, hdr.automation_count, AUTOMATION_SIZE, "automations")?;
    let triggers_raw = section(buf, hdr.triggers_off, hdr.trigger_count, TRIGGER_SIZE, "triggers")?;
    let conditions_raw = section(buf, hdr.conditions_off, hdr.condition_count, CONDITION_SIZE, "conditions")?;
    let actions_raw = section(buf, hdr.actions_off, hdr.action_count, ACTION_SIZE, "actions")?;
    let strings_raw = section(buf, hdr.strings_off, hdr.strings_size, 1, "strings")?;

    let strings = StringTable::from_bytes(strings_raw.to_vec());

    let automation = read_automation(automations)?;
    check_window(automation.triggers_index, automation.triggers_count, hdr.trigger_count, "triggers")?;
    check_window(automation.conditions_index, automation.conditions_count, hdr.condition_count, "conditions")?;
    check_window(automation.actions_index, automation.actions_count, hdr.action_count, "actions")?;
    check_str(&strings, automation.id_off, "automation.id")?;
    check_str(&strings, automation.name_off, "automation.name")?;

    let mut triggers = Vec::with_capacity(hdr.trigger_count as usize);
    let mut rd = triggers_raw;
    for _ in 0..hdr.trigger_count {
        let t = read_trigger(&mut rd)?;
        check_str(&strings, t.device_uid_off, "trigger.device_uid")?;
        check_str(&strings, t.cmd_off, "trigger.cmd")?;
        triggers.push(t);
    }

    let mut conditions = Vec::with_capacity(hdr.condition_count as usize);
    let mut rd = conditions_raw;
    for _ in 0..hdr.condition_count {
        let c = read_condition(&mut rd)?;
        check_str(&strings, c.device_uid_off, "condition.device_uid")?;
        check_str(&strings, c.key_off, "condition.key")?;
        conditions.push(c);
    }

    let mut actions = Vec::with_capacity(hdr.action_count as usize);
    let mut rd = actions_raw;
    for _ in 0..hdr.action_count {
        let a = read_action(&mut rd)?;
        check_str(&strings, a.cmd_off, "action.cmd")?;
        check_str(&strings, a.uid_off, "action.uid")?;
        check_str(&strings, a.uid2_off, "action.uid2")?;
        actions.push(a);
    }

    Ok(CompiledRule {
        automation,
        triggers,
        conditions,
        actions,
        strings,
    })
}

fn read_header(buf: &[u8]) -> Result<Header, FormatError> {
    if buf.len() < HEADER_SIZE {
        return Err(FormatError::Truncated);
    }
    let mut rd = buf;
    let magic = rd.get_u32_le();
    let version = rd.get_u16_le();
    let _reserved = rd.get_u16_le();
    if magic != MAGIC || version != VERSION {
        return Err(FormatError::BadMagic);
    }
    let hdr = Header {
        automation_count: rd.get_u32_le(),
        trigger_count: rd.get_u32_le(),
        condition_count: rd.get_u32_le(),
        action_count: rd.get_u32_le(),
        automations_off: rd.get_u32_le(),
        triggers_off: rd.get_u32_le(),
        conditions_off: rd.get_u32_le(),
        actions_off: rd.get_u32_le(),
        strings_off: rd.get_u32_le(),
        strings_size: rd.get_u32_le(),
    };
    // The store keeps single-rule bundles; anything else is not ours.
    if hdr.automation_count != 1 {
        return Err(FormatError::BadAutomationCount);
    }
    Ok(hdr)
}

/// Bounds-check a declared `offset + count * size` window and return it.
fn section<'a>(
    buf: &'a [u8],
    off: u32,
    count: u32,
    item_size: usize,
    what: &'static str,
) -> Result<&'a [u8], FormatError> {
    let start = off as u64;
    let len = u64::from(count) * item_size as u64;
    let end = start.checked_add(len).ok_or(FormatError::OutOfBounds(what))?;
    if end > buf.len() as u64 {
        return Err(FormatError::OutOfBounds(what));
    }
    Ok(&buf[start as usize..end as usize])
}

fn check_window(index: u32, count: u32, total: u32, what: &'static str) -> Result<(), FormatError> {
    let end = u64::from(index) + u64::from(count);
    if end > u64::from(total) {
        return Err(FormatError::BadWindow(what));
    }
    Ok(())
}

/// Non-zero string offsets must resolve to a terminated UTF-8 entry.
fn check_str(strings: &StringTable, off: u32, what: &'static str) -> Result<(), FormatError> {
    if off != 0 && strings.get(off).is_none() {
        return Err(FormatError::BadStringRef(what));
    }
    Ok(())
}

fn read_automation(mut rd: &[u8]) -> Result<AutomationRecord, FormatError> {
    let id_off = rd.get_u32_le();
    let name_off = rd.get_u32_le();
    let enabled = rd.get_u8() != 0;
    let mode = rd.get_u8();
    let _reserved = rd.get_u16_le();
    Ok(AutomationRecord {
        id_off,
        name_off,
        enabled,
        mode,
        triggers_index: rd.get_u32_le(),
        triggers_count: rd.get_u32_le(),
        conditions_index: rd.get_u32_le(),
        conditions_count: rd.get_u32_le(),
        actions_index: rd.get_u32_le(),
        actions_count: rd.get_u32_le(),
    })
}

fn read_trigger(rd: &mut &[u8]) -> Result<TriggerRecord, FormatError> {
    let event_kind = EventKind::try_from(rd.get_u8())?;
    let endpoint = rd.get_u8();
    let _reserved = rd.get_u16_le();
    Ok(TriggerRecord {
        event_kind,
        endpoint,
        device_uid_off: rd.get_u32_le(),
        cmd_off: rd.get_u32_le(),
        cluster_id: rd.get_u16_le(),
        attr_id: rd.get_u16_le(),
    })
}

fn read_condition(rd: &mut &[u8]) -> Result<CondRecord, FormatError> {
    let op = CondOp::try_from(rd.get_u8())?;
    let tag = ValueTag::try_from(rd.get_u8())?;
    let _reserved = rd.get_u16_le();
    let device_uid_off = rd.get_u32_le();
    let key_off = rd.get_u32_le();
    let value = match tag {
        ValueTag::F64 => CondValue::F64(rd.get_f64_le()),
        ValueTag::Bool => {
            let b = rd.get_u8() != 0;
            rd.advance(7);
            CondValue::Bool(b)
        }
    };
    Ok(CondRecord {
        op,
        value,
        device_uid_off,
        key_off,
    })
}

fn read_action(rd: &mut &[u8]) -> Result<ActionRecord, FormatError> {
    Ok(ActionRecord {
        kind: ActionKind::try_from(rd.get_u8())?,
        endpoint: rd.get_u8(),
        aux_ep: rd.get_u8(),
        flags: rd.get_u8(),
        u16_0: rd.get_u16_le(),
        u16_1: rd.get_u16_le(),
        cmd_off: rd.get_u32_le(),
        uid_off: rd.get_u32_le(),
        uid2_off: rd.get_u32_le(),
        arg0: rd.get_u32_le(),
        arg1: rd.get_u32_le(),
        arg2: rd.get_u32_le(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_str;

    fn sample_rule() -> CompiledRule {
        compile_str(
            r#"{
                "id": "r1",
                "name": "button toggles bulb",
                "enabled": true,
                "triggers": [
                    {"type": "event", "event_type": "zigbee.command",
                     "match": {"device_uid": "0x000A", "payload.cmd": "toggle"}}
                ],
                "conditions": [
                    {"type": "state", "op": ">",
                     "ref": {"device_uid": "0x000C", "key": "lux"}, "value": 500}
                ],
                "actions": [
                    {"type": "zigbee", "cmd": "onoff.toggle",
                     "device_uid": "0x000B", "endpoint": 1},
                    {"type": "zigbee", "cmd": "level.move_to_level",
                     "device_uid": "0x000B", "endpoint": 1,
                     "level": 128, "transition_ms": 400}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn round_trip_preserves_structure() {
        let rule = sample_rule();
        let image = serialize(&rule);
        let back = deserialize(&image).unwrap();
        assert_eq!(back, rule);
        // Re-serializing yields identical bytes.
        assert_eq!(serialize(&back), image);
    }

    #[test]
    fn header_offsets_are_sequential() {
        let rule = sample_rule();
        let image = serialize(&rule);
        let mut rd = &image[24..];
        let automations_off = rd.get_u32_le() as usize;
        let triggers_off = rd.get_u32_le() as usize;
        let conditions_off = rd.get_u32_le() as usize;
        let actions_off = rd.get_u32_le() as usize;
        let strings_off = rd.get_u32_le() as usize;
        let strings_size = rd.get_u32_le() as usize;

        assert_eq!(automations_off, HEADER_SIZE);
        assert_eq!(triggers_off, automations_off + AUTOMATION_SIZE);
        assert_eq!(conditions_off, triggers_off + TRIGGER_SIZE);
        assert_eq!(actions_off, conditions_off + CONDITION_SIZE);
        assert_eq!(strings_off, actions_off + 2 * ACTION_SIZE);
        assert_eq!(strings_off + strings_size, image.len());
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let rule = sample_rule();
        let mut image = serialize(&rule);
        image[0] ^= 0xFF;
        assert!(matches!(deserialize(&image), Err(FormatError::BadMagic)));

        let mut image = serialize(&rule);
        image[4] = 9;
        assert!(matches!(deserialize(&image), Err(FormatError::BadMagic)));
    }

    #[test]
    fn rejects_truncation_at_every_length() {
        let image = serialize(&sample_rule());
        for len in 0..image.len() {
            assert!(
                deserialize(&image[..len]).is_err(),
                "truncated image of {len} bytes must not parse"
            );
        }
    }

    #[test]
    fn rejects_out_of_bounds_sections() {
        let rule = sample_rule();
        let mut image = serialize(&rule);
        // Push triggers_off past the end of the buffer.
        let image_len = image.len() as u32;
        image[28..32].copy_from_slice(&image_len.to_le_bytes());
        assert!(matches!(deserialize(&image), Err(FormatError::OutOfBounds("triggers"))));
    }

    #[test]
    fn rejects_window_overflow() {
        let rule = sample_rule();
        let mut image = serialize(&rule);
        // automation.triggers_count lives at automations_off + 16.
        let off = HEADER_SIZE + 16;
        image[off..off + 4].copy_from_slice(&100u32.to_le_bytes());
        assert!(matches!(deserialize(&image), Err(FormatError::BadWindow("triggers"))));
    }

    #[test]
    fn single_byte_corruption_never_panics() {
        let image = serialize(&sample_rule());
        for pos in 0..image.len() {
            let mut mutated = image.clone();
            mutated[pos] ^= 0xFF;
            // Every mutation must either fail cleanly or still decode to
            // in-bounds structures; none may panic or read out of bounds.
            if let Ok(rule) = deserialize(&mutated) {
                let _ = rule.rule_triggers();
                let _ = rule.rule_conditions();
                let _ = rule.rule_actions();
                let _ = rule.id();
                let _ = rule.name();
            }
        }
    }

    #[test]
    fn bool_condition_value_round_trips() {
        let rule = compile_str(
            r#"{
                "id": "r2", "name": "gate",
                "triggers": [{"type": "event", "event_type": "device.join"}],
                "conditions": [
                    {"type": "state", "op": "==",
                     "ref": {"device_uid": "0x000C", "key": "occupied"}, "value": true}
                ],
                "actions": [{"type": "zigbee", "cmd": "onoff.on",
                             "device_uid": "0x000B", "endpoint": 1}]
            }"#,
        )
        .unwrap();
        let back = deserialize(&serialize(&rule)).unwrap();
        assert_eq!(back.conditions[0].value, CondValue::Bool(true));
    }
}
