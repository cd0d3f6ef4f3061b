//! Fixed-size compiled-rule records.
//!
//! A compiled rule is one automation record plus typed sub-arrays of
//! trigger, condition and action records, all referencing a shared string
//! table by u32 offset. Zero offsets and zero numeric filters mean
//! "wildcard"/"unused" throughout.

use crate::strtab::StringTable;
use thiserror::Error;

/// Raised when a stored discriminant byte maps to no known variant.
#[derive(Debug, Error)]
#[error("unknown {what} discriminant: {value}")]
pub struct BadDiscriminant {
    pub what: &'static str,
    pub value: u8,
}

/// Trigger discriminator: which normalized event family a trigger matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    ZigbeeCommand = 1,
    ZigbeeAttrReport = 2,
    DeviceJoin = 3,
    DeviceLeave = 4,
}

impl EventKind {
    /// Map an event `type` string to its discriminator.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "zigbee.command" => Some(Self::ZigbeeCommand),
            "zigbee.attr_report" => Some(Self::ZigbeeAttrReport),
            "device.join" => Some(Self::DeviceJoin),
            "device.leave" => Some(Self::DeviceLeave),
            _ => None,
        }
    }
}

impl TryFrom<u8> for EventKind {
    type Error = BadDiscriminant;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ZigbeeCommand),
            2 => Ok(Self::ZigbeeAttrReport),
            3 => Ok(Self::DeviceJoin),
            4 => Ok(Self::DeviceLeave),
            _ => Err(BadDiscriminant { what: "event kind", value }),
        }
    }
}

/// Condition comparison operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CondOp {
    Eq = 1,
    Ne = 2,
    Gt = 3,
    Lt = 4,
    Ge = 5,
    Le = 6,
}

impl CondOp {
    /// Map an operator symbol (`"=="`, `">="`, ...) to its variant.
    pub fn from_symbol(sym: &str) -> Option<Self> {
        match sym {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }

    /// Numeric comparison with a tolerance applied to (in)equality.
    pub fn eval_f64(self, actual: f64, expected: f64, epsilon: f64) -> bool {
        match self {
            CondOp::Eq => (actual - expected).abs() <= epsilon,
            CondOp::Ne => (actual - expected).abs() > epsilon,
            CondOp::Gt => actual > expected,
            CondOp::Lt => actual < expected,
            CondOp::Ge => actual >= expected,
            CondOp::Le => actual <= expected,
        }
    }

    /// Boolean comparison; `true` orders above `false`.
    pub fn eval_bool(self, actual: bool, expected: bool) -> bool {
        match self {
            CondOp::Eq => actual == expected,
            CondOp::Ne => actual != expected,
            CondOp::Gt => actual & !expected,
            CondOp::Lt => !actual & expected,
            CondOp::Ge => actual >= expected,
            CondOp::Le => actual <= expected,
        }
    }
}

impl TryFrom<u8> for CondOp {
    type Error = BadDiscriminant;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Eq),
            2 => Ok(Self::Ne),
            3 => Ok(Self::Gt),
            4 => Ok(Self::Lt),
            5 => Ok(Self::Ge),
            6 => Ok(Self::Le),
            _ => Err(BadDiscriminant { what: "condition op", value }),
        }
    }
}

/// Tag byte for the condition value slot on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueTag {
    F64 = 1,
    Bool = 2,
}

impl TryFrom<u8> for ValueTag {
    type Error = BadDiscriminant;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::F64),
            2 => Ok(Self::Bool),
            _ => Err(BadDiscriminant { what: "value tag", value }),
        }
    }
}

/// Expected value of a condition, typed at compile time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CondValue {
    F64(f64),
    Bool(bool),
}

impl CondValue {
    pub fn tag(self) -> ValueTag {
        match self {
            CondValue::F64(_) => ValueTag::F64,
            CondValue::Bool(_) => ValueTag::Bool,
        }
    }
}

/// What an action targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionKind {
    /// Unicast to a device endpoint.
    Device = 1,
    /// Groupcast to a group id.
    Group = 2,
    /// Group-based scene store/recall.
    Scene = 3,
    /// ZDO bind/unbind.
    Bind = 4,
}

impl TryFrom<u8> for ActionKind {
    type Error = BadDiscriminant;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Device),
            2 => Ok(Self::Group),
            3 => Ok(Self::Scene),
            4 => Ok(Self::Bind),
            _ => Err(BadDiscriminant { what: "action kind", value }),
        }
    }
}

/// `ActionRecord::flags` bit: perform unbind instead of bind.
pub const ACTION_FLAG_UNBIND: u8 = 1 << 0;

/// Rule metadata plus `(base index, count)` windows over the record arrays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AutomationRecord {
    pub id_off: u32,
    pub name_off: u32,
    pub enabled: bool,
    /// Reserved execution-mode field; the compiler always writes 1.
    pub mode: u8,
    pub triggers_index: u32,
    pub triggers_count: u32,
    pub conditions_index: u32,
    pub conditions_count: u32,
    pub actions_index: u32,
    pub actions_count: u32,
}

/// One trigger predicate. Zero fields are wildcards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerRecord {
    pub event_kind: EventKind,
    /// 0 = any endpoint.
    pub endpoint: u8,
    /// String offset, 0 = any device.
    pub device_uid_off: u32,
    /// String offset, 0 = any command (zigbee.command only).
    pub cmd_off: u32,
    /// 0 = any cluster.
    pub cluster_id: u16,
    /// 0 = any attribute (zigbee.attr_report only).
    pub attr_id: u16,
}

/// One state condition: `state[(device_uid, key)] <op> value`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CondRecord {
    pub op: CondOp,
    pub value: CondValue,
    pub device_uid_off: u32,
    pub key_off: u32,
}

/// One compiled action.
///
/// The numeric slots are kind- and command-specific; the layout stays flat
/// for format stability:
/// - GROUP/SCENE: `u16_0` = group_id; SCENE: `u16_1` = scene_id
/// - BIND: `endpoint`/`aux_ep` = src/dst endpoint, `u16_0` = cluster_id
/// - `level.move_to_level`: arg0 = level, arg1 = transition_ms
/// - `color.move_to_color_xy`: arg0 = x, arg1 = y, arg2 = transition_ms
/// - `color.move_to_color_temperature`: arg0 = mireds, arg1 = transition_ms
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub endpoint: u8,
    pub aux_ep: u8,
    pub flags: u8,
    pub u16_0: u16,
    pub u16_1: u16,
    pub cmd_off: u32,
    pub uid_off: u32,
    pub uid2_off: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub arg2: u32,
}

impl Default for ActionRecord {
    fn default() -> Self {
        Self {
            kind: ActionKind::Device,
            endpoint: 0,
            aux_ep: 0,
            flags: 0,
            u16_0: 0,
            u16_1: 0,
            cmd_off: 0,
            uid_off: 0,
            uid2_off: 0,
            arg0: 0,
            arg1: 0,
            arg2: 0,
        }
    }
}

/// A fully compiled rule: one automation record, its record arrays, and
/// the string table they reference.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledRule {
    pub automation: AutomationRecord,
    pub triggers: Vec<TriggerRecord>,
    pub conditions: Vec<CondRecord>,
    pub actions: Vec<ActionRecord>,
    pub strings: StringTable,
}

impl CompiledRule {
    pub fn id(&self) -> &str {
        self.strings.lookup(self.automation.id_off)
    }

    pub fn name(&self) -> &str {
        self.strings.lookup(self.automation.name_off)
    }

    /// This rule's window over the trigger array, clamped to bounds.
    pub fn rule_triggers(&self) -> &[TriggerRecord] {
        window(
            &self.triggers,
            self.automation.triggers_index,
            self.automation.triggers_count,
        )
    }

    pub fn rule_conditions(&self) -> &[CondRecord] {
        window(
            &self.conditions,
            self.automation.conditions_index,
            self.automation.conditions_count,
        )
    }

    pub fn rule_actions(&self) -> &[ActionRecord] {
        window(
            &self.actions,
            self.automation.actions_index,
            self.automation.actions_count,
        )
    }
}

fn window<T>(items: &[T], index: u32, count: u32) -> &[T] {
    let start = (index as usize).min(items.len());
    let end = start.saturating_add(count as usize).min(items.len());
    &items[start..end]
}
