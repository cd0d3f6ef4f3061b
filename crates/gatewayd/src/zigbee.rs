//! Command-issuance boundary toward the Zigbee radio stack.
//!
//! The automation core never talks ZCL/ZDO directly; it issues typed
//! commands through [`ZigbeeCommands`] and treats completion as
//! fire-and-forget (results come back later as normalized events).

use gateway_core::DeviceUid;
use thiserror::Error;
use tracing::info;

/// Radio-side command failure, opaque to the automation core.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ZigbeeError(pub String);

/// On/Off cluster sub-command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnOff {
    On,
    Off,
    Toggle,
}

impl OnOff {
    /// Resolve the `onoff.<suffix>` command family.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "toggle" => Some(Self::Toggle),
            _ => None,
        }
    }
}

/// Level cluster move-to-level parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelMove {
    pub level: u8,
    pub transition_ms: u16,
}

/// Color cluster move-to-xy parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorXy {
    pub x: u16,
    pub y: u16,
    pub transition_ms: u16,
}

/// Color cluster move-to-color-temperature parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorTemp {
    pub mireds: u16,
    pub transition_ms: u16,
}

/// The command surface the executor drives.
///
/// Unicast calls address a device endpoint; group calls address a group
/// id; bind/unbind are ZDO requests against the source device.
pub trait ZigbeeCommands: Send + Sync {
    fn onoff(&self, uid: &DeviceUid, endpoint: u8, cmd: OnOff) -> Result<(), ZigbeeError>;
    fn level_move_to_level(
        &self,
        uid: &DeviceUid,
        endpoint: u8,
        params: LevelMove,
    ) -> Result<(), ZigbeeError>;
    fn color_move_to_xy(
        &self,
        uid: &DeviceUid,
        endpoint: u8,
        params: ColorXy,
    ) -> Result<(), ZigbeeError>;
    fn color_move_to_temperature(
        &self,
        uid: &DeviceUid,
        endpoint: u8,
        params: ColorTemp,
    ) -> Result<(), ZigbeeError>;

    fn group_onoff(&self, group_id: u16, cmd: OnOff) -> Result<(), ZigbeeError>;
    fn group_level_move_to_level(&self, group_id: u16, params: LevelMove)
        -> Result<(), ZigbeeError>;
    fn group_color_move_to_xy(&self, group_id: u16, params: ColorXy) -> Result<(), ZigbeeError>;
    fn group_color_move_to_temperature(
        &self,
        group_id: u16,
        params: ColorTemp,
    ) -> Result<(), ZigbeeError>;

    fn scene_store(&self, group_id: u16, scene_id: u8) -> Result<(), ZigbeeError>;
    fn scene_recall(&self, group_id: u16, scene_id: u8) -> Result<(), ZigbeeError>;

    fn bind(
        &self,
        src: &DeviceUid,
        src_endpoint: u8,
        cluster_id: u16,
        dst: &DeviceUid,
        dst_endpoint: u8,
    ) -> Result<(), ZigbeeError>;
    fn unbind(
        &self,
        src: &DeviceUid,
        src_endpoint: u8,
        cluster_id: u16,
        dst: &DeviceUid,
        dst_endpoint: u8,
    ) -> Result<(), ZigbeeError>;
}

/// Driver that traces every command and reports success.
///
/// Stands in for the radio stack when the daemon runs without one
/// attached (development hosts, integration rigs).
#[derive(Default)]
pub struct LogDriver;

impl ZigbeeCommands for LogDriver {
    fn onoff(&self, uid: &DeviceUid, endpoint: u8, cmd: OnOff) -> Result<(), ZigbeeError> {
        info!("zigbee onoff {cmd:?} uid={uid} ep={endpoint}");
        Ok(())
    }

    fn level_move_to_level(
        &self,
        uid: &DeviceUid,
        endpoint: u8,
        params: LevelMove,
    ) -> Result<(), ZigbeeError> {
        info!(
            "zigbee level uid={uid} ep={endpoint} level={} t={}ms",
            params.level, params.transition_ms
        );
        Ok(())
    }

    fn color_move_to_xy(
        &self,
        uid: &DeviceUid,
        endpoint: u8,
        params: ColorXy,
    ) -> Result<(), ZigbeeError> {
        info!(
            "zigbee color_xy uid={uid} ep={endpoint} x={} y={} t={}ms",
            params.x, params.y, params.transition_ms
        );
        Ok(())
    }

    fn color_move_to_temperature(
        &self,
        uid: &DeviceUid,
        endpoint: u8,
        params: ColorTemp,
    ) -> Result<(), ZigbeeError> {
        info!(
            "zigbee color_temp uid={uid} ep={endpoint} mireds={} t={}ms",
            params.mireds, params.transition_ms
        );
        Ok(())
    }

    fn group_onoff(&self, group_id: u16, cmd: OnOff) -> Result<(), ZigbeeError> {
        info!("zigbee group_onoff {cmd:?} group=0x{group_id:04x}");
        Ok(())
    }

    fn group_level_move_to_level(
        &self,
        group_id: u16,
        params: LevelMove,
    ) -> Result<(), ZigbeeError> {
        info!(
            "zigbee group_level group=0x{group_id:04x} level={} t={}ms",
            params.level, params.transition_ms
        );
        Ok(())
    }

    fn group_color_move_to_xy(&self, group_id: u16, params: ColorXy) -> Result<(), ZigbeeError> {
        info!(
            "zigbee group_color_xy group=0x{group_id:04x} x={} y={}",
            params.x, params.y
        );
        Ok(())
    }

    fn group_color_move_to_temperature(
        &self,
        group_id: u16,
        params: ColorTemp,
    ) -> Result<(), ZigbeeError> {
        info!(
            "zigbee group_color_temp group=0x{group_id:04x} mireds={}",
            params.mireds
        );
        Ok(())
    }

    fn scene_store(&self, group_id: u16, scene_id: u8) -> Result<(), ZigbeeError> {
        info!("zigbee scene_store group=0x{group_id:04x} scene={scene_id}");
        Ok(())
    }

    fn scene_recall(&self, group_id: u16, scene_id: u8) -> Result<(), ZigbeeError> {
        info!("zigbee scene_recall group=0x{group_id:04x} scene={scene_id}");
        Ok(())
    }

    fn bind(
        &self,
        src: &DeviceUid,
        src_endpoint: u8,
        cluster_id: u16,
        dst: &DeviceUid,
        dst_endpoint: u8,
    ) -> Result<(), ZigbeeError> {
        info!("zigbee bind {src}:{src_endpoint} cluster=0x{cluster_id:04x} -> {dst}:{dst_endpoint}");
        Ok(())
    }

    fn unbind(
        &self,
        src: &DeviceUid,
        src_endpoint: u8,
        cluster_id: u16,
        dst: &DeviceUid,
        dst_endpoint: u8,
    ) -> Result<(), ZigbeeError> {
        info!("zigbee unbind {src}:{src_endpoint} cluster=0x{cluster_id:04x} -> {dst}:{dst_endpoint}");
        Ok(())
    }
}
