//! Compiled-action executor.
//!
//! Maps one [`ActionRecord`] to a call on the Zigbee command boundary.
//! Every numeric range is re-checked here even though the compiler
//! enforced it: the store image may come off flash, and a tampered or
//! bit-rotted record must fail as `InvalidArgument` rather than reach
//! the radio.

use crate::zigbee::{ColorTemp, ColorXy, LevelMove, OnOff, ZigbeeCommands, ZigbeeError};
use gateway_core::DeviceUid;
use gateway_rules::{ActionKind, ActionRecord, CompiledRule, ACTION_FLAG_UNBIND};
use std::sync::Arc;
use thiserror::Error;

/// Why an action was not issued.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{0}")]
    InvalidArgument(&'static str),
    #[error("unsupported command: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Backend(#[from] ZigbeeError),
}

/// Executes compiled actions against a [`ZigbeeCommands`] backend.
pub struct ActionExecutor {
    zigbee: Arc<dyn ZigbeeCommands>,
}

impl ActionExecutor {
    pub fn new(zigbee: Arc<dyn ZigbeeCommands>) -> Self {
        Self { zigbee }
    }

    /// Issue one action. The rule provides the string table the record
    /// points into.
    pub fn execute(&self, rule: &CompiledRule, action: &ActionRecord) -> Result<(), ExecError> {
        let cmd = rule.strings.lookup(action.cmd_off);
        if cmd.is_empty() {
            return Err(ExecError::InvalidArgument("missing cmd"));
        }
        match action.kind {
            ActionKind::Device => self.exec_device(rule, action, cmd),
            ActionKind::Group => self.exec_group(action, cmd),
            ActionKind::Scene => self.exec_scene(action, cmd),
            ActionKind::Bind => self.exec_bind(rule, action),
        }
    }

    fn exec_device(
        &self,
        rule: &CompiledRule,
        action: &ActionRecord,
        cmd: &str,
    ) -> Result<(), ExecError> {
        let uid_s = rule.strings.lookup(action.uid_off);
        if uid_s.is_empty() {
            return Err(ExecError::InvalidArgument("missing device_uid"));
        }
        let uid = DeviceUid::new(uid_s);
        let endpoint = check_endpoint(action.endpoint)?;

        if let Some(suffix) = cmd.strip_prefix("onoff.") {
            let onoff = OnOff::from_suffix(suffix)
                .ok_or_else(|| ExecError::Unsupported(cmd.to_owned()))?;
            return Ok(self.zigbee.onoff(&uid, endpoint, onoff)?);
        }
        match cmd {
            "level.move_to_level" => {
                let params = LevelMove {
                    level: check_level(action.arg0)?,
                    transition_ms: check_transition(action.arg1)?,
                };
                Ok(self.zigbee.level_move_to_level(&uid, endpoint, params)?)
            }
            "color.move_to_color_xy" => {
                let params = ColorXy {
                    x: check_xy(action.arg0)?,
                    y: check_xy(action.arg1)?,
                    transition_ms: check_transition(action.arg2)?,
                };
                Ok(self.zigbee.color_move_to_xy(&uid, endpoint, params)?)
            }
            "color.move_to_color_temperature" => {
                let params = ColorTemp {
                    mireds: check_mireds(action.arg0)?,
                    transition_ms: check_transition(action.arg1)?,
                };
                Ok(self.zigbee.color_move_to_temperature(&uid, endpoint, params)?)
            }
            _ => Err(ExecError::Unsupported(cmd.to_owned())),
        }
    }

    fn exec_group(&self, action: &ActionRecord, cmd: &str) -> Result<(), ExecError> {
        let group_id = check_group(action.u16_0)?;

        if let Some(suffix) = cmd.strip_prefix("onoff.") {
            let onoff = OnOff::from_suffix(suffix)
                .ok_or_else(|| ExecError::Unsupported(cmd.to_owned()))?;
            return Ok(self.zigbee.group_onoff(group_id, onoff)?);
        }
        match cmd {
            "level.move_to_level" => {
                let params = LevelMove {
                    level: check_level(action.arg0)?,
                    transition_ms: check_transition(action.arg1)?,
                };
                Ok(self.zigbee.group_level_move_to_level(group_id, params)?)
            }
            "color.move_to_color_xy" => {
                let params = ColorXy {
                    x: check_xy(action.arg0)?,
                    y: check_xy(action.arg1)?,
                    transition_ms: check_transition(action.arg2)?,
                };
                Ok(self.zigbee.group_color_move_to_xy(group_id, params)?)
            }
            "color.move_to_color_temperature" => {
                let params = ColorTemp {
                    mireds: check_mireds(action.arg0)?,
                    transition_ms: check_transition(action.arg1)?,
                };
                Ok(self.zigbee.group_color_move_to_temperature(group_id, params)?)
            }
            _ => Err(ExecError::Unsupported(cmd.to_owned())),
        }
    }

    fn exec_scene(&self, action: &ActionRecord, cmd: &str) -> Result<(), ExecError> {
        let group_id = check_group(action.u16_0)?;
        let scene_id = match action.u16_1 {
            1..=255 => action.u16_1 as u8,
            _ => return Err(ExecError::InvalidArgument("bad scene_id")),
        };
        match cmd {
            "scene.store" => Ok(self.zigbee.scene_store(group_id, scene_id)?),
            "scene.recall" => Ok(self.zigbee.scene_recall(group_id, scene_id)?),
            _ => Err(ExecError::Unsupported(cmd.to_owned())),
        }
    }

    fn exec_bind(&self, rule: &CompiledRule, action: &ActionRecord) -> Result<(), ExecError> {
        let src_s = rule.strings.lookup(action.uid_off);
        let dst_s = rule.strings.lookup(action.uid2_off);
        if src_s.is_empty() || dst_s.is_empty() {
            return Err(ExecError::InvalidArgument("missing device uid"));
        }
        let src = DeviceUid::new(src_s);
        let dst = DeviceUid::new(dst_s);
        let src_ep = check_endpoint(action.endpoint)?;
        let dst_ep = check_endpoint(action.aux_ep)?;
        if action.u16_0 == 0 {
            return Err(ExecError::InvalidArgument("bad cluster_id"));
        }

        if action.flags & ACTION_FLAG_UNBIND != 0 {
            Ok(self.zigbee.unbind(&src, src_ep, action.u16_0, &dst, dst_ep)?)
        } else {
            Ok(self.zigbee.bind(&src, src_ep, action.u16_0, &dst, dst_ep)?)
        }
    }
}

fn check_endpoint(ep: u8) -> Result<u8, ExecError> {
    match ep {
        1..=240 => Ok(ep),
        _ => Err(ExecError::InvalidArgument("bad endpoint")),
    }
}

fn check_level(arg: u32) -> Result<u8, ExecError> {
    match arg {
        0..=254 => Ok(arg as u8),
        _ => Err(ExecError::InvalidArgument("bad level")),
    }
}

fn check_transition(arg: u32) -> Result<u16, ExecError> {
    match arg {
        0..=60_000 => Ok(arg as u16),
        _ => Err(ExecError::InvalidArgument("bad transition_ms")),
    }
}

fn check_xy(arg: u32) -> Result<u16, ExecError> {
    u16::try_from(arg).map_err(|_| ExecError::InvalidArgument("bad x/y"))
}

fn check_mireds(arg: u32) -> Result<u16, ExecError> {
    match arg {
        1..=1000 => Ok(arg as u16),
        _ => Err(ExecError::InvalidArgument("bad mireds")),
    }
}

fn check_group(group_id: u16) -> Result<u16, ExecError> {
    if group_id == 0 || group_id == 0xFFFF {
        return Err(ExecError::InvalidArgument("bad group_id"));
    }
    Ok(group_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Call, RecordingDriver};
    use gateway_rules::compile_str;

    fn executor() -> (ActionExecutor, Arc<RecordingDriver>) {
        let driver = Arc::new(RecordingDriver::default());
        (ActionExecutor::new(driver.clone()), driver)
    }

    fn single_action_rule(action_json: &str) -> CompiledRule {
        compile_str(&format!(
            r#"{{
                "id": "r", "name": "n",
                "triggers": [{{"type": "event", "event_type": "zigbee.command"}}],
                "actions": [{action_json}]
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn device_onoff_resolves_suffix() {
        let (exec, driver) = executor();
        let rule = single_action_rule(
            r#"{"type": "zigbee", "cmd": "onoff.toggle", "device_uid": "0x000B", "endpoint": 1}"#,
        );
        exec.execute(&rule, &rule.actions[0]).unwrap();
        assert_eq!(
            driver.calls(),
            vec![Call::OnOff {
                uid: "0x000B".into(),
                endpoint: 1,
                cmd: OnOff::Toggle
            }]
        );
    }

    #[test]
    fn device_level_passes_args() {
        let (exec, driver) = executor();
        let rule = single_action_rule(
            r#"{"type": "zigbee", "cmd": "level.move_to_level",
                "device_uid": "0x000B", "endpoint": 3, "level": 128, "transition_ms": 400}"#,
        );
        exec.execute(&rule, &rule.actions[0]).unwrap();
        assert_eq!(
            driver.calls(),
            vec![Call::Level {
                uid: "0x000B".into(),
                endpoint: 3,
                level: 128,
                transition_ms: 400
            }]
        );
    }

    #[test]
    fn group_color_temperature() {
        let (exec, driver) = executor();
        let rule = single_action_rule(
            r#"{"type": "zigbee", "cmd": "color.move_to_color_temperature",
                "group_id": 7, "mireds": 350, "transition_ms": 2000}"#,
        );
        exec.execute(&rule, &rule.actions[0]).unwrap();
        assert_eq!(
            driver.calls(),
            vec![Call::GroupColorTemp {
                group_id: 7,
                mireds: 350,
                transition_ms: 2000
            }]
        );
    }

    #[test]
    fn scene_recall() {
        let (exec, driver) = executor();
        let rule = single_action_rule(
            r#"{"type": "zigbee", "cmd": "scene.recall", "group_id": 5, "scene_id": 2}"#,
        );
        exec.execute(&rule, &rule.actions[0]).unwrap();
        assert_eq!(driver.calls(), vec![Call::SceneRecall { group_id: 5, scene_id: 2 }]);
    }

    #[test]
    fn bind_and_unbind_follow_flag() {
        let (exec, driver) = executor();
        let rule = single_action_rule(
            r#"{"type": "zigbee", "cmd": "bind",
                "src_device_uid": "0x000A", "src_endpoint": 1, "cluster_id": 6,
                "dst_device_uid": "0x000B", "dst_endpoint": 1}"#,
        );
        exec.execute(&rule, &rule.actions[0]).unwrap();

        let mut unbind = rule.actions[0];
        unbind.flags |= ACTION_FLAG_UNBIND;
        exec.execute(&rule, &unbind).unwrap();

        assert_eq!(
            driver.calls(),
            vec![
                Call::Bind {
                    src: "0x000A".into(),
                    src_endpoint: 1,
                    cluster_id: 6,
                    dst: "0x000B".into(),
                    dst_endpoint: 1,
                    unbind: false
                },
                Call::Bind {
                    src: "0x000A".into(),
                    src_endpoint: 1,
                    cluster_id: 6,
                    dst: "0x000B".into(),
                    dst_endpoint: 1,
                    unbind: true
                },
            ]
        );
    }

    #[test]
    fn tampered_records_are_rejected() {
        let (exec, driver) = executor();
        let rule = single_action_rule(
            r#"{"type": "zigbee", "cmd": "color.move_to_color_temperature",
                "device_uid": "0x000B", "endpoint": 1, "mireds": 300}"#,
        );

        // Mireds pushed out of range after compilation.
        let mut bad = rule.actions[0];
        bad.arg0 = 1500;
        assert!(matches!(
            exec.execute(&rule, &bad),
            Err(ExecError::InvalidArgument("bad mireds"))
        ));

        // Endpoint zeroed.
        let mut bad = rule.actions[0];
        bad.endpoint = 0;
        assert!(matches!(
            exec.execute(&rule, &bad),
            Err(ExecError::InvalidArgument("bad endpoint"))
        ));

        // Transition pushed past the cap.
        let mut bad = rule.actions[0];
        bad.arg1 = 90_000;
        assert!(matches!(
            exec.execute(&rule, &bad),
            Err(ExecError::InvalidArgument("bad transition_ms"))
        ));

        assert!(driver.calls().is_empty());
    }

    #[test]
    fn unknown_command_is_unsupported() {
        let (exec, driver) = executor();
        let rule = single_action_rule(
            r#"{"type": "zigbee", "cmd": "lock.engage", "device_uid": "0x000B", "endpoint": 1}"#,
        );
        assert!(matches!(
            exec.execute(&rule, &rule.actions[0]),
            Err(ExecError::Unsupported(_))
        ));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn backend_failures_surface() {
        let (exec, driver) = executor();
        driver.fail_with("radio offline");
        let rule = single_action_rule(
            r#"{"type": "zigbee", "cmd": "onoff.on", "device_uid": "0x000B", "endpoint": 1}"#,
        );
        let err = exec.execute(&rule, &rule.actions[0]).unwrap_err();
        assert!(matches!(err, ExecError::Backend(_)));
        assert!(err.to_string().contains("radio offline"));
    }
}
