//! Test doubles shared by the executor and engine tests.

use crate::zigbee::{ColorTemp, ColorXy, LevelMove, OnOff, ZigbeeCommands, ZigbeeError};
use gateway_core::DeviceUid;
use parking_lot::Mutex;

/// One observed command call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    OnOff { uid: String, endpoint: u8, cmd: OnOff },
    Level { uid: String, endpoint: u8, level: u8, transition_ms: u16 },
    ColorXy { uid: String, endpoint: u8, x: u16, y: u16, transition_ms: u16 },
    ColorTemp { uid: String, endpoint: u8, mireds: u16, transition_ms: u16 },
    GroupOnOff { group_id: u16, cmd: OnOff },
    GroupLevel { group_id: u16, level: u8, transition_ms: u16 },
    GroupColorXy { group_id: u16, x: u16, y: u16 },
    GroupColorTemp { group_id: u16, mireds: u16, transition_ms: u16 },
    SceneStore { group_id: u16, scene_id: u8 },
    SceneRecall { group_id: u16, scene_id: u8 },
    Bind {
        src: String,
        src_endpoint: u8,
        cluster_id: u16,
        dst: String,
        dst_endpoint: u8,
        unbind: bool,
    },
}

/// Records every command; optionally fails all of them.
#[derive(Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<Call>>,
    fail: Mutex<Option<String>>,
}

impl RecordingDriver {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Make every subsequent command fail with `reason`.
    pub fn fail_with(&self, reason: &str) {
        *self.fail.lock() = Some(reason.to_owned());
    }

    fn record(&self, call: Call) -> Result<(), ZigbeeError> {
        if let Some(reason) = self.fail.lock().clone() {
            return Err(ZigbeeError(reason));
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

impl ZigbeeCommands for RecordingDriver {
    fn onoff(&self, uid: &DeviceUid, endpoint: u8, cmd: OnOff) -> Result<(), ZigbeeError> {
        self.record(Call::OnOff { uid: uid.as_str().to_owned(), endpoint, cmd })
    }

    fn level_move_to_level(
        &self,
        uid: &DeviceUid,
        endpoint: u8,
        params: LevelMove,
    ) -> Result<(), ZigbeeError> {
        self.record(Call::Level {
            uid: uid.as_str().to_owned(),
            endpoint,
            level: params.level,
            transition_ms: params.transition_ms,
        })
    }

    fn color_move_to_xy(
        &self,
        uid: &DeviceUid,
        endpoint: u8,
        params: ColorXy,
    ) -> Result<(), ZigbeeError> {
        self.record(Call::ColorXy {
            uid: uid.as_str().to_owned(),
            endpoint,
            x: params.x,
            y: params.y,
            transition_ms: params.transition_ms,
        })
    }

    fn color_move_to_temperature(
        &self,
        uid: &DeviceUid,
        endpoint: u8,
        params: ColorTemp,
    ) -> Result<(), ZigbeeError> {
        self.record(Call::ColorTemp {
            uid: uid.as_str().to_owned(),
            endpoint,
            mireds: params.mireds,
            transition_ms: params.transition_ms,
        })
    }

    fn group_onoff(&self, group_id: u16, cmd: OnOff) -> Result<(), ZigbeeError> {
        self.record(Call::GroupOnOff { group_id, cmd })
    }

    fn group_level_move_to_level(
        &self,
        group_id: u16,
        params: LevelMove,
    ) -> Result<(), ZigbeeError> {
        self.record(Call::GroupLevel {
            group_id,
            level: params.level,
            transition_ms: params.transition_ms,
        })
    }

    fn group_color_move_to_xy(&self, group_id: u16, params: ColorXy) -> Result<(), ZigbeeError> {
        self.record(Call::GroupColorXy { group_id, x: params.x, y: params.y })
    }

    fn group_color_move_to_temperature(
        &self,
        group_id: u16,
        params: ColorTemp,
    ) -> Result<(), ZigbeeError> {
        self.record(Call::GroupColorTemp {
            group_id,
            mireds: params.mireds,
            transition_ms: params.transition_ms,
        })
    }

    fn scene_store(&self, group_id: u16, scene_id: u8) -> Result<(), ZigbeeError> {
        self.record(Call::SceneStore { group_id, scene_id })
    }

    fn scene_recall(&self, group_id: u16, scene_id: u8) -> Result<(), ZigbeeError> {
        self.record(Call::SceneRecall { group_id, scene_id })
    }

    fn bind(
        &self,
        src: &DeviceUid,
        src_endpoint: u8,
        cluster_id: u16,
        dst: &DeviceUid,
        dst_endpoint: u8,
    ) -> Result<(), ZigbeeError> {
        self.record(Call::Bind {
            src: src.as_str().to_owned(),
            src_endpoint,
            cluster_id,
            dst: dst.as_str().to_owned(),
            dst_endpoint,
            unbind: false,
        })
    }

    fn unbind(
        &self,
        src: &DeviceUid,
        src_endpoint: u8,
        cluster_id: u16,
        dst: &DeviceUid,
        dst_endpoint: u8,
    ) -> Result<(), ZigbeeError> {
        self.record(Call::Bind {
            src: src.as_str().to_owned(),
            src_endpoint,
            cluster_id,
            dst: dst.as_str().to_owned(),
            dst_endpoint,
            unbind: true,
        })
    }
}
