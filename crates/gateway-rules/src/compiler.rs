//! Rule document compiler.
//!
//! Translates a user-authored rule document (JSON) into a [`CompiledRule`]:
//! validates the trigger/condition/action tree, interns every string, and
//! fills the fixed-size records. Validation failures carry a stable short
//! reason string and leave nothing behind. Unknown fields are ignored so
//! newer documents keep compiling on older firmware.
//!
//! The ingress is deliberately duck-typed: numeric fields accept JSON
//! numbers or strings (decimal or `0x`-prefixed hex), condition values
//! accept booleans, numbers, or numeric strings.

use crate::records::{
    ActionKind, ActionRecord, AutomationRecord, CompiledRule, CondOp, CondRecord, CondValue,
    EventKind, TriggerRecord, ACTION_FLAG_UNBIND,
};
use crate::strtab::StringTable;
use serde_json::Value;
use thiserror::Error;

/// Why a rule document was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("bad json")]
    BadJson,
    #[error("{0}")]
    Invalid(&'static str),
}

fn invalid<T>(reason: &'static str) -> Result<T, CompileError> {
    Err(CompileError::Invalid(reason))
}

/// Compile a rule document from its JSON text.
pub fn compile_str(json: &str) -> Result<CompiledRule, CompileError> {
    let doc: Value = serde_json::from_str(json).map_err(|_| CompileError::BadJson)?;
    compile(&doc)
}

/// Compile a parsed rule document.
pub fn compile(doc: &Value) -> Result<CompiledRule, CompileError> {
    let obj = match doc.as_object() {
        Some(obj) => obj,
        None => return Err(CompileError::BadJson),
    };

    let id = match obj.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id,
        _ => return invalid("missing id"),
    };
    let name = match obj.get("name").and_then(Value::as_str) {
        Some(name) => name,
        None => return invalid("missing name"),
    };
    let enabled = obj.get("enabled").and_then(Value::as_bool).unwrap_or(true);
    let triggers_doc = match obj.get("triggers").and_then(Value::as_array) {
        Some(arr) => arr,
        None => return invalid("missing triggers"),
    };
    let conditions_doc = obj
        .get("conditions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let actions_doc = match obj.get("actions").and_then(Value::as_array) {
        Some(arr) => arr,
        None => return invalid("missing actions"),
    };

    let mut strings = StringTable::new();
    let mut triggers = Vec::with_capacity(triggers_doc.len());
    let mut conditions = Vec::with_capacity(conditions_doc.len());
    let mut actions = Vec::with_capacity(actions_doc.len());

    for t in triggers_doc {
        triggers.push(compile_trigger(t, &mut strings)?);
    }
    for c in conditions_doc {
        conditions.push(compile_condition(c, &mut strings)?);
    }
    for a in actions_doc {
        actions.push(compile_action(a, &mut strings)?);
    }

    let automation = AutomationRecord {
        id_off: strings.add(id),
        name_off: strings.add(name),
        enabled,
        // Reserved; kept at 1 for forward compatibility regardless of input.
        mode: 1,
        triggers_index: 0,
        triggers_count: triggers.len() as u32,
        conditions_index: 0,
        conditions_count: conditions.len() as u32,
        actions_index: 0,
        actions_count: actions.len() as u32,
    };

    Ok(CompiledRule {
        automation,
        triggers,
        conditions,
        actions,
        strings,
    })
}

fn compile_trigger(doc: &Value, strings: &mut StringTable) -> Result<TriggerRecord, CompileError> {
    let obj = match doc.as_object() {
        Some(obj) => obj,
        None => return invalid("trigger must be object"),
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("event") => {}
        _ => return invalid("unsupported trigger.type"),
    }
    let event_type = match obj.get("event_type").and_then(Value::as_str) {
        Some(s) => s,
        None => return invalid("missing trigger.event_type"),
    };
    let event_kind = match EventKind::from_name(event_type) {
        Some(kind) => kind,
        None => return invalid("unsupported event_type"),
    };

    let mut trigger = TriggerRecord {
        event_kind,
        endpoint: 0,
        device_uid_off: 0,
        cmd_off: 0,
        cluster_id: 0,
        attr_id: 0,
    };

    if let Some(m) = obj.get("match").and_then(Value::as_object) {
        if let Some(uid) = m.get("device_uid").and_then(Value::as_str) {
            if !uid.is_empty() {
                trigger.device_uid_off = strings.add(uid);
            }
        }
        // Match keys are flat and may contain a dot ("payload.endpoint").
        if let Some(ep) = m.get("payload.endpoint").and_then(u16_any) {
            if ep <= 255 {
                trigger.endpoint = ep as u8;
            }
        }
        match event_kind {
            EventKind::ZigbeeCommand => {
                if let Some(cmd) = m.get("payload.cmd").and_then(Value::as_str) {
                    if !cmd.is_empty() {
                        trigger.cmd_off = strings.add(cmd);
                    }
                }
                if let Some(cluster) = m.get("payload.cluster").and_then(u16_any) {
                    trigger.cluster_id = cluster;
                }
            }
            EventKind::ZigbeeAttrReport => {
                if let Some(cluster) = m.get("payload.cluster").and_then(u16_any) {
                    trigger.cluster_id = cluster;
                }
                if let Some(attr) = m.get("payload.attr").and_then(u16_any) {
                    trigger.attr_id = attr;
                }
            }
            // Join/leave only filter on device_uid/endpoint.
            EventKind::DeviceJoin | EventKind::DeviceLeave => {}
        }
    }

    Ok(trigger)
}

fn compile_condition(doc: &Value, strings: &mut StringTable) -> Result<CondRecord, CompileError> {
    let obj = match doc.as_object() {
        Some(obj) => obj,
        None => return invalid("condition must be object"),
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("state") => {}
        _ => return invalid("unsupported condition.type"),
    }
    let op_sym = match obj.get("op").and_then(Value::as_str) {
        Some(s) => s,
        None => return invalid("missing condition.op"),
    };
    let op = match CondOp::from_symbol(op_sym) {
        Some(op) => op,
        None => return invalid("bad condition.op"),
    };
    let ref_obj = match obj.get("ref").and_then(Value::as_object) {
        Some(r) => r,
        None => return invalid("missing condition.ref"),
    };
    let uid = match ref_obj.get("device_uid").and_then(Value::as_str) {
        Some(uid) if !uid.is_empty() => uid,
        _ => return invalid("missing condition.ref.device_uid"),
    };
    let key = match ref_obj.get("key").and_then(Value::as_str) {
        Some(key) if !key.is_empty() => key,
        _ => return invalid("missing condition.ref.key"),
    };

    let value = match obj.get("value") {
        Some(Value::Bool(b)) => CondValue::Bool(*b),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) => CondValue::F64(v),
            None => return invalid("bad condition.value"),
        },
        Some(Value::String(s)) if !s.is_empty() => match s.parse::<f64>() {
            Ok(v) => CondValue::F64(v),
            Err(_) => return invalid("bad condition.value"),
        },
        _ => return invalid("bad condition.value"),
    };

    Ok(CondRecord {
        op,
        value,
        device_uid_off: strings.add(uid),
        key_off: strings.add(key),
    })
}

fn compile_action(doc: &Value, strings: &mut StringTable) -> Result<ActionRecord, CompileError> {
    let obj = match doc.as_object() {
        Some(obj) => obj,
        None => return invalid("action must be object"),
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("zigbee") => {}
        _ => return invalid("unsupported action.type"),
    }
    let cmd = match obj.get("cmd").and_then(Value::as_str) {
        Some(cmd) if !cmd.is_empty() => cmd,
        _ => return invalid("missing action.cmd"),
    };

    let mut action = ActionRecord {
        cmd_off: strings.add(cmd),
        ..ActionRecord::default()
    };

    // 1) Binding / unbinding (ZDO).
    if matches!(cmd, "bind" | "unbind" | "bindings.bind" | "bindings.unbind") {
        let src_uid = match obj.get("src_device_uid").and_then(Value::as_str) {
            Some(uid) if !uid.is_empty() => uid,
            _ => return invalid("missing action.src_device_uid"),
        };
        let dst_uid = match obj.get("dst_device_uid").and_then(Value::as_str) {
            Some(uid) if !uid.is_empty() => uid,
            _ => return invalid("missing action.dst_device_uid"),
        };
        let src_ep = match obj.get("src_endpoint").and_then(u16_any) {
            Some(ep) if (1..=240).contains(&ep) => ep as u8,
            _ => return invalid("bad action.src_endpoint"),
        };
        let dst_ep = match obj.get("dst_endpoint").and_then(u16_any) {
            Some(ep) if (1..=240).contains(&ep) => ep as u8,
            _ => return invalid("bad action.dst_endpoint"),
        };
        let cluster_id = match obj.get("cluster_id").and_then(u16_any) {
            Some(c) if c != 0 => c,
            _ => return invalid("bad action.cluster_id"),
        };

        action.kind = ActionKind::Bind;
        action.uid_off = strings.add(src_uid);
        action.uid2_off = strings.add(dst_uid);
        action.endpoint = src_ep;
        action.aux_ep = dst_ep;
        action.u16_0 = cluster_id;
        if cmd.contains("unbind") {
            action.flags |= ACTION_FLAG_UNBIND;
        }
        return Ok(action);
    }

    // 2) Scenes (group-based).
    if matches!(cmd, "scene.store" | "scene.recall") {
        let group_id = match obj.get("group_id").and_then(u16_any) {
            Some(g) if g != 0 && g != 0xFFFF => g,
            _ => return invalid("bad action.group_id"),
        };
        let scene_id = match obj.get("scene_id").and_then(u32_any) {
            Some(s) if (1..=255).contains(&s) => s as u16,
            _ => return invalid("bad action.scene_id"),
        };
        action.kind = ActionKind::Scene;
        action.u16_0 = group_id;
        action.u16_1 = scene_id;
        return Ok(action);
    }

    // 3) Group actions, detected by the presence of a valid group_id.
    if let Some(group_id) = obj.get("group_id").and_then(u16_any) {
        if group_id != 0 && group_id != 0xFFFF {
            action.kind = ActionKind::Group;
            action.u16_0 = group_id;
            fill_command_args(cmd, obj, &mut action)?;
            return Ok(action);
        }
    }

    // 4) Device actions (unicast).
    let uid = match obj.get("device_uid").and_then(Value::as_str) {
        Some(uid) if !uid.is_empty() => uid,
        _ => return invalid("missing action.device_uid"),
    };
    let endpoint = match obj.get("endpoint").and_then(u16_any) {
        Some(ep) if (1..=240).contains(&ep) => ep as u8,
        _ => return invalid("bad action.endpoint"),
    };
    action.kind = ActionKind::Device;
    action.uid_off = strings.add(uid);
    action.endpoint = endpoint;
    fill_command_args(cmd, obj, &mut action)?;
    Ok(action)
}

/// Fill the generic numeric slots for the commands that carry parameters.
/// Device and group actions share the same slot scheme.
fn fill_command_args(
    cmd: &str,
    obj: &serde_json::Map<String, Value>,
    action: &mut ActionRecord,
) -> Result<(), CompileError> {
    match cmd {
        "level.move_to_level" => {
            let level = match obj.get("level").and_then(u32_any) {
                Some(l) if l <= 254 => l,
                _ => return invalid("bad action.level"),
            };
            action.arg0 = level;
            action.arg1 = transition_ms(obj)?;
        }
        "color.move_to_color_xy" => {
            let x = match obj.get("x").and_then(u32_any) {
                Some(x) if x <= 65535 => x,
                _ => return invalid("bad action.x"),
            };
            let y = match obj.get("y").and_then(u32_any) {
                Some(y) if y <= 65535 => y,
                _ => return invalid("bad action.y"),
            };
            action.arg0 = x;
            action.arg1 = y;
            action.arg2 = transition_ms(obj)?;
        }
        "color.move_to_color_temperature" => {
            let mireds = match obj.get("mireds").and_then(u32_any) {
                Some(m) if (1..=1000).contains(&m) => m,
                _ => return invalid("bad action.mireds"),
            };
            action.arg0 = mireds;
            action.arg1 = transition_ms(obj)?;
        }
        // onoff.* and forward-compatible commands carry no numeric args;
        // the executor decides whether it can issue them.
        _ => {}
    }
    Ok(())
}

fn transition_ms(obj: &serde_json::Map<String, Value>) -> Result<u32, CompileError> {
    match obj.get("transition_ms") {
        None | Some(Value::Null) => Ok(0),
        Some(v) => match u32_any(v) {
            Some(ms) if ms <= 60_000 => Ok(ms),
            _ => invalid("bad action.transition_ms"),
        },
    }
}

/// Accept a JSON number in `0..=65535` or a decimal/`0x` string.
///
/// Shared with the engine's payload matching so that documents and
/// events tolerate the same numeric spellings.
pub fn u16_any(v: &Value) -> Option<u16> {
    u32_any(v).and_then(|n| u16::try_from(n).ok())
}

/// Accept a JSON number in u32 range or a decimal/`0x` string.
pub fn u32_any(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => {
            let f = n.as_f64()?;
            if (0.0..=u32::MAX as f64).contains(&f) {
                Some(f as u32)
            } else {
                None
            }
        }
        Value::String(s) if !s.is_empty() => parse_uint(s).and_then(|n| u32::try_from(n).ok()),
        _ => None,
    }
}

fn parse_uint(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u64>().ok()
    }
}
