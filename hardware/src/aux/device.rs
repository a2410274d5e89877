//! Bus device identifiers and per-device opcode tables
//!
//! Every peripheral on the AUX bus has a fixed one-byte address. The opcode
//! space is per device class: `0x01` means "get position" to a motor
//! controller and "get latitude" to the GPS receiver.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};

/// Logical peripheral on the AUX bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
pub enum Device {
    /// Broadcast / unspecified
    Any,
    /// Main board
    MainBoard,
    /// NexStar hand controller
    HandController,
    /// NexStar+ hand controller
    HandControllerPlus,
    /// Azimuth motor controller
    Azimuth,
    /// Altitude motor controller
    Altitude,
    /// Focuser motor controller
    Focuser,
    /// Host application (this program)
    App,
    /// GPS receiver
    Gps,
    /// WiFi bridge
    WiFi,
    /// Battery monitor
    Battery,
    /// Charge controller
    Charger,
    /// Accessory light
    Light,
}

impl Device {
    /// Bus address of this device.
    pub fn id(self) -> u8 {
        match self {
            Device::Any => 0x00,
            Device::MainBoard => 0x01,
            Device::HandController => 0x04,
            Device::HandControllerPlus => 0x0D,
            Device::Azimuth => 0x10,
            Device::Altitude => 0x11,
            Device::Focuser => 0x12,
            Device::App => 0x20,
            Device::Gps => 0xB0,
            Device::WiFi => 0xB5,
            Device::Battery => 0xB6,
            Device::Charger => 0xB7,
            Device::Light => 0xBF,
        }
    }

    /// Look up a device by bus address.
    pub fn from_id(id: u8) -> Option<Device> {
        Device::iter().find(|d| d.id() == id)
    }

    /// Opcode family understood by this device.
    pub fn class(self) -> DeviceClass {
        match self {
            Device::Azimuth | Device::Altitude => DeviceClass::MotorController,
            Device::Focuser => DeviceClass::Focuser,
            Device::Gps => DeviceClass::Gps,
            Device::Battery | Device::Charger => DeviceClass::Power,
            _ => DeviceClass::Control,
        }
    }
}

/// Opcode family of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeviceClass {
    /// Altitude and azimuth axis controllers
    MotorController,
    /// Focuser (a motor controller plus hard-stop query)
    Focuser,
    /// GPS receiver
    Gps,
    /// Battery and charger monitors
    Power,
    /// Hand controllers, main board, bridges and the host itself
    Control,
}

impl DeviceClass {
    /// Whether `opcode` is part of this family's command set.
    ///
    /// Control-class devices forward arbitrary traffic, so every opcode is
    /// accepted for them.
    pub fn accepts(self, opcode: u8) -> bool {
        match self {
            DeviceClass::MotorController => mc::ALL.contains(&opcode),
            DeviceClass::Focuser => {
                mc::ALL.contains(&opcode) || opcode == focuser::GET_HS_POSITIONS
            }
            DeviceClass::Gps => gps::ALL.contains(&opcode) || opcode == mc::GET_VER,
            DeviceClass::Power => power::ALL.contains(&opcode) || opcode == mc::GET_VER,
            DeviceClass::Control => true,
        }
    }

    /// Symbolic opcode name for logs.
    pub fn opcode_name(self, opcode: u8) -> &'static str {
        let table: &[(u8, &'static str)] = match self {
            DeviceClass::MotorController | DeviceClass::Focuser => mc::NAMES,
            DeviceClass::Gps => gps::NAMES,
            DeviceClass::Power => power::NAMES,
            DeviceClass::Control => &[],
        };
        table
            .iter()
            .find(|(op, _)| *op == opcode)
            .map(|(_, name)| *name)
            .unwrap_or("UNKNOWN")
    }
}

/// Motor controller opcodes
pub mod mc {
    pub const GET_POSITION: u8 = 0x01;
    pub const GOTO_FAST: u8 = 0x02;
    pub const SET_POSITION: u8 = 0x04;
    pub const GET_MODEL: u8 = 0x05;
    pub const SET_POS_GUIDERATE: u8 = 0x06;
    pub const SET_NEG_GUIDERATE: u8 = 0x07;
    pub const LEVEL_START: u8 = 0x0B;
    pub const SET_POS_BACKLASH: u8 = 0x10;
    pub const SET_NEG_BACKLASH: u8 = 0x11;
    pub const LEVEL_DONE: u8 = 0x12;
    pub const SLEW_DONE: u8 = 0x13;
    pub const GOTO_SLOW: u8 = 0x17;
    pub const SEEK_DONE: u8 = 0x18;
    pub const SEEK_INDEX: u8 = 0x19;
    pub const SET_MAXRATE: u8 = 0x20;
    pub const GET_MAXRATE: u8 = 0x21;
    pub const ENABLE_MAXRATE: u8 = 0x22;
    pub const MAXRATE_ENABLED: u8 = 0x23;
    pub const MOVE_POS: u8 = 0x24;
    pub const MOVE_NEG: u8 = 0x25;
    pub const AUX_GUIDE: u8 = 0x26;
    pub const AUX_GUIDE_ACTIVE: u8 = 0x27;
    pub const ENABLE_CORDWRAP: u8 = 0x38;
    pub const DISABLE_CORDWRAP: u8 = 0x39;
    pub const SET_CORDWRAP_POS: u8 = 0x3A;
    pub const POLL_CORDWRAP: u8 = 0x3B;
    pub const GET_CORDWRAP_POS: u8 = 0x3C;
    pub const GET_POS_BACKLASH: u8 = 0x40;
    pub const GET_NEG_BACKLASH: u8 = 0x41;
    pub const SET_AUTOGUIDE_RATE: u8 = 0x46;
    pub const GET_AUTOGUIDE_RATE: u8 = 0x47;
    pub const GET_APPROACH: u8 = 0xFC;
    pub const SET_APPROACH: u8 = 0xFD;
    pub const GET_VER: u8 = 0xFE;

    /// `SLEW_DONE` reply byte when the axis has reached its target.
    pub const SLEW_COMPLETE: u8 = 0xFF;

    /// Highest manual rate step accepted by `MOVE_POS` / `MOVE_NEG`.
    pub const MAX_MOVE_RATE: u8 = 9;

    pub const NAMES: &[(u8, &str)] = &[
        (GET_POSITION, "MC_GET_POSITION"),
        (GOTO_FAST, "MC_GOTO_FAST"),
        (SET_POSITION, "MC_SET_POSITION"),
        (GET_MODEL, "MC_GET_MODEL"),
        (SET_POS_GUIDERATE, "MC_SET_POS_GUIDERATE"),
        (SET_NEG_GUIDERATE, "MC_SET_NEG_GUIDERATE"),
        (LEVEL_START, "MC_LEVEL_START"),
        (SET_POS_BACKLASH, "MC_SET_POS_BACKLASH"),
        (SET_NEG_BACKLASH, "MC_SET_NEG_BACKLASH"),
        (LEVEL_DONE, "MC_LEVEL_DONE"),
        (SLEW_DONE, "MC_SLEW_DONE"),
        (GOTO_SLOW, "MC_GOTO_SLOW"),
        (SEEK_DONE, "MC_SEEK_DONE"),
        (SEEK_INDEX, "MC_SEEK_INDEX"),
        (SET_MAXRATE, "MC_SET_MAXRATE"),
        (GET_MAXRATE, "MC_GET_MAXRATE"),
        (ENABLE_MAXRATE, "MC_ENABLE_MAXRATE"),
        (MAXRATE_ENABLED, "MC_MAXRATE_ENABLED"),
        (MOVE_POS, "MC_MOVE_POS"),
        (MOVE_NEG, "MC_MOVE_NEG"),
        (AUX_GUIDE, "MC_AUX_GUIDE"),
        (AUX_GUIDE_ACTIVE, "MC_AUX_GUIDE_ACTIVE"),
        (ENABLE_CORDWRAP, "MC_ENABLE_CORDWRAP"),
        (DISABLE_CORDWRAP, "MC_DISABLE_CORDWRAP"),
        (SET_CORDWRAP_POS, "MC_SET_CORDWRAP_POS"),
        (POLL_CORDWRAP, "MC_POLL_CORDWRAP"),
        (GET_CORDWRAP_POS, "MC_GET_CORDWRAP_POS"),
        (GET_POS_BACKLASH, "MC_GET_POS_BACKLASH"),
        (GET_NEG_BACKLASH, "MC_GET_NEG_BACKLASH"),
        (SET_AUTOGUIDE_RATE, "MC_SET_AUTOGUIDE_RATE"),
        (GET_AUTOGUIDE_RATE, "MC_GET_AUTOGUIDE_RATE"),
        (GET_APPROACH, "MC_GET_APPROACH"),
        (SET_APPROACH, "MC_SET_APPROACH"),
        (GET_VER, "GET_VER"),
    ];

    pub const ALL: &[u8] = &[
        GET_POSITION,
        GOTO_FAST,
        SET_POSITION,
        GET_MODEL,
        SET_POS_GUIDERATE,
        SET_NEG_GUIDERATE,
        LEVEL_START,
        SET_POS_BACKLASH,
        SET_NEG_BACKLASH,
        LEVEL_DONE,
        SLEW_DONE,
        GOTO_SLOW,
        SEEK_DONE,
        SEEK_INDEX,
        SET_MAXRATE,
        GET_MAXRATE,
        ENABLE_MAXRATE,
        MAXRATE_ENABLED,
        MOVE_POS,
        MOVE_NEG,
        AUX_GUIDE,
        AUX_GUIDE_ACTIVE,
        ENABLE_CORDWRAP,
        DISABLE_CORDWRAP,
        SET_CORDWRAP_POS,
        POLL_CORDWRAP,
        GET_CORDWRAP_POS,
        GET_POS_BACKLASH,
        GET_NEG_BACKLASH,
        SET_AUTOGUIDE_RATE,
        GET_AUTOGUIDE_RATE,
        GET_APPROACH,
        SET_APPROACH,
        GET_VER,
    ];
}

/// GPS receiver opcodes
pub mod gps {
    pub const GET_LAT: u8 = 0x01;
    pub const GET_LONG: u8 = 0x02;
    pub const SET_LAT: u8 = 0x31;
    pub const SET_LONG: u8 = 0x32;
    pub const GET_TIME: u8 = 0x33;
    pub const SET_TIME: u8 = 0x34;
    pub const TIME_VALID: u8 = 0x36;
    pub const LINKED: u8 = 0x37;
    pub const GET_SATS: u8 = 0x38;
    pub const GET_DATE: u8 = 0x3B;
    pub const SET_DATE: u8 = 0x3C;

    pub const NAMES: &[(u8, &str)] = &[
        (GET_LAT, "GPS_GET_LAT"),
        (GET_LONG, "GPS_GET_LONG"),
        (SET_LAT, "GPS_SET_LAT"),
        (SET_LONG, "GPS_SET_LONG"),
        (GET_TIME, "GPS_GET_TIME"),
        (SET_TIME, "GPS_SET_TIME"),
        (TIME_VALID, "GPS_TIME_VALID"),
        (LINKED, "GPS_LINKED"),
        (GET_SATS, "GPS_GET_SATS"),
        (GET_DATE, "GPS_GET_DATE"),
        (SET_DATE, "GPS_SET_DATE"),
    ];

    pub const ALL: &[u8] = &[
        GET_LAT, GET_LONG, SET_LAT, SET_LONG, GET_TIME, SET_TIME, TIME_VALID, LINKED, GET_SATS,
        GET_DATE, SET_DATE,
    ];
}

/// Focuser-only opcodes (it otherwise speaks the motor controller set)
pub mod focuser {
    pub const GET_HS_POSITIONS: u8 = 0x2C;
}

/// Battery / charger opcodes
pub mod power {
    pub const GET_VOLTAGE: u8 = 0x01;
    pub const GET_CURRENT: u8 = 0x02;
    pub const GET_STATUS: u8 = 0x03;

    pub const NAMES: &[(u8, &str)] = &[
        (GET_VOLTAGE, "BAT_GET_VOLTAGE"),
        (GET_CURRENT, "BAT_GET_CURRENT"),
        (GET_STATUS, "BAT_GET_STATUS"),
    ];

    pub const ALL: &[u8] = &[GET_VOLTAGE, GET_CURRENT, GET_STATUS];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        for device in Device::iter() {
            assert_eq!(Device::from_id(device.id()), Some(device));
        }
    }

    #[test]
    fn test_unknown_id() {
        assert_eq!(Device::from_id(0x55), None);
    }

    #[test]
    fn test_opcode_tables_are_per_class() {
        let mc = Device::Azimuth.class();
        assert!(mc.accepts(mc::GOTO_FAST));
        assert!(!mc.accepts(gps::LINKED));
        assert_eq!(mc.opcode_name(0x01), "MC_GET_POSITION");

        let gps_class = Device::Gps.class();
        assert!(gps_class.accepts(gps::LINKED));
        assert!(!gps_class.accepts(mc::GOTO_SLOW));
        assert_eq!(gps_class.opcode_name(0x01), "GPS_GET_LAT");
    }

    #[test]
    fn test_focuser_extends_motor_set() {
        let class = Device::Focuser.class();
        assert!(class.accepts(mc::GET_POSITION));
        assert!(class.accepts(focuser::GET_HS_POSITIONS));
    }

    #[test]
    fn test_control_devices_accept_anything() {
        assert!(Device::App.class().accepts(0x99));
    }
}
