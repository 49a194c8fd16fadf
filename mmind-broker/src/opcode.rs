use std::fmt;
use thiserror::Error;

use crate::CompanyId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OpcodeError {
    #[error("Invalid opcode 0x{0:06x}")]
    Invalid(u32),
}

/// Access layer opcode. SIG opcodes are one or two octets, vendor opcodes
/// are three octets: `0b11xxxxxx` followed by the company id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    Sig1(u8),
    Sig2(u16),
    Vendor { op: u8, company: CompanyId },
}

impl Opcode {
    pub const fn vendor(op: u8, company: CompanyId) -> Self {
        Opcode::Vendor {
            op: op & 0x3F,
            company,
        }
    }

    /// Packed form as used by the mesh stack when reporting opcodes
    pub fn to_u32(self) -> u32 {
        match self {
            Opcode::Sig1(o) => o as u32,
            Opcode::Sig2(o) => o as u32,
            Opcode::Vendor { op, company } => ((0xC0 | op as u32) << 16) | company as u32,
        }
    }

    pub fn from_u32(raw: u32) -> Result<Self, OpcodeError> {
        match raw {
            0..=0x7E => Ok(Opcode::Sig1(raw as u8)),
            0x8000..=0xBFFF => Ok(Opcode::Sig2(raw as u16)),
            0xC0_0000..=0xFF_FFFF => Ok(Opcode::Vendor {
                op: ((raw >> 16) & 0x3F) as u8,
                company: (raw & 0xFFFF) as u16,
            }),
            _ => Err(OpcodeError::Invalid(raw)),
        }
    }

    pub fn company(self) -> Option<CompanyId> {
        match self {
            Opcode::Vendor { company, .. } => Some(company),
            _ => None,
        }
    }

    /// Opcode of the message that acknowledges this one, if it is an
    /// acknowledged request. The acknowledging opcode doubles as the
    /// family key for pending transactions.
    pub fn response(self) -> Option<Opcode> {
        use sig::*;
        let resp = match self {
            COMPOSITION_DATA_GET => COMPOSITION_DATA_STATUS,
            APP_KEY_ADD => APP_KEY_STATUS,
            MODEL_APP_BIND => MODEL_APP_STATUS,
            NODE_RESET => NODE_RESET_STATUS,
            SENSOR_DESCRIPTOR_GET => SENSOR_DESCRIPTOR_STATUS,
            SENSOR_GET => SENSOR_STATUS,
            SENSOR_COLUMN_GET => SENSOR_COLUMN_STATUS,
            SENSOR_SERIES_GET => SENSOR_SERIES_STATUS,
            SENSOR_CADENCE_GET => SENSOR_CADENCE_STATUS,
            SENSOR_SETTINGS_GET => SENSOR_SETTINGS_STATUS,
            SENSOR_SETTING_GET => SENSOR_SETTING_STATUS,
            Opcode::Vendor { op, company } if op == VendorOp::Send as u8 => {
                VendorOp::Status.opcode(company)
            }
            _ => return None,
        };
        Some(resp)
    }

    /// Configuration messages are secured with the device key rather
    /// than an application key
    pub fn uses_device_key(self) -> bool {
        use sig::*;
        matches!(
            self,
            COMPOSITION_DATA_GET
                | COMPOSITION_DATA_STATUS
                | APP_KEY_ADD
                | APP_KEY_STATUS
                | MODEL_APP_BIND
                | MODEL_APP_STATUS
                | NODE_RESET
                | NODE_RESET_STATUS
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Sig1(o) => write!(f, "0x{o:02x}"),
            Opcode::Sig2(o) => write!(f, "0x{o:04x}"),
            Opcode::Vendor { .. } => write!(f, "0x{:06x}", self.to_u32()),
        }
    }
}

/// SIG defined opcodes used by the configuration and sensor models
pub mod sig {
    use super::Opcode;

    pub const APP_KEY_ADD: Opcode = Opcode::Sig1(0x00);
    pub const COMPOSITION_DATA_STATUS: Opcode = Opcode::Sig1(0x02);
    pub const APP_KEY_STATUS: Opcode = Opcode::Sig2(0x8003);
    pub const COMPOSITION_DATA_GET: Opcode = Opcode::Sig2(0x8008);
    pub const MODEL_APP_BIND: Opcode = Opcode::Sig2(0x803D);
    pub const MODEL_APP_STATUS: Opcode = Opcode::Sig2(0x803E);
    pub const NODE_RESET: Opcode = Opcode::Sig2(0x8049);
    pub const NODE_RESET_STATUS: Opcode = Opcode::Sig2(0x804A);

    pub const SENSOR_DESCRIPTOR_GET: Opcode = Opcode::Sig2(0x8230);
    pub const SENSOR_DESCRIPTOR_STATUS: Opcode = Opcode::Sig1(0x51);
    pub const SENSOR_GET: Opcode = Opcode::Sig2(0x8231);
    pub const SENSOR_STATUS: Opcode = Opcode::Sig1(0x52);
    pub const SENSOR_COLUMN_GET: Opcode = Opcode::Sig2(0x8232);
    pub const SENSOR_COLUMN_STATUS: Opcode = Opcode::Sig1(0x53);
    pub const SENSOR_SERIES_GET: Opcode = Opcode::Sig2(0x8233);
    pub const SENSOR_SERIES_STATUS: Opcode = Opcode::Sig1(0x54);
    pub const SENSOR_CADENCE_GET: Opcode = Opcode::Sig2(0x8234);
    pub const SENSOR_CADENCE_STATUS: Opcode = Opcode::Sig1(0x57);
    pub const SENSOR_SETTINGS_GET: Opcode = Opcode::Sig2(0x8235);
    pub const SENSOR_SETTINGS_STATUS: Opcode = Opcode::Sig1(0x58);
    pub const SENSOR_SETTING_GET: Opcode = Opcode::Sig2(0x8236);
    pub const SENSOR_SETTING_STATUS: Opcode = Opcode::Sig1(0x5B);

    pub const SENSOR_SERVER_REQUESTS: [Opcode; 7] = [
        SENSOR_DESCRIPTOR_GET,
        SENSOR_GET,
        SENSOR_COLUMN_GET,
        SENSOR_SERIES_GET,
        SENSOR_CADENCE_GET,
        SENSOR_SETTINGS_GET,
        SENSOR_SETTING_GET,
    ];

    pub const SENSOR_CLIENT_RESPONSES: [Opcode; 7] = [
        SENSOR_DESCRIPTOR_STATUS,
        SENSOR_STATUS,
        SENSOR_COLUMN_STATUS,
        SENSOR_SERIES_STATUS,
        SENSOR_CADENCE_STATUS,
        SENSOR_SETTINGS_STATUS,
        SENSOR_SETTING_STATUS,
    ];

    pub const CONFIG_CLIENT_RESPONSES: [Opcode; 4] = [
        COMPOSITION_DATA_STATUS,
        APP_KEY_STATUS,
        MODEL_APP_STATUS,
        NODE_RESET_STATUS,
    ];
}

/// Vendor model operations, combined with a company id to form an [`Opcode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VendorOp {
    /// Liveness probe carrying a transaction id
    Send = 0x00,
    /// Echo of a [`VendorOp::Send`]
    Status = 0x01,
    DhtData = 0x02,
    LdrData = 0x03,
    LedCtrl = 0x04,
}

impl VendorOp {
    pub const fn opcode(self, company: CompanyId) -> Opcode {
        Opcode::vendor(self as u8, company)
    }

    /// Matches only opcodes carrying the given company id
    pub fn from_opcode(opcode: Opcode, company: CompanyId) -> Option<Self> {
        match opcode {
            Opcode::Vendor { op, company: c } if c == company => match op {
                0x00 => Some(VendorOp::Send),
                0x01 => Some(VendorOp::Status),
                0x02 => Some(VendorOp::DhtData),
                0x03 => Some(VendorOp::LdrData),
                0x04 => Some(VendorOp::LedCtrl),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CID_ESP;

    #[test]
    fn vendor_opcode_packing() {
        assert_eq!(VendorOp::Send.opcode(CID_ESP).to_u32(), 0xC002E5);
        assert_eq!(VendorOp::LedCtrl.opcode(CID_ESP).to_u32(), 0xC402E5);
        assert_eq!(
            Opcode::from_u32(0xC302E5),
            Ok(VendorOp::LdrData.opcode(CID_ESP))
        );
    }

    #[test]
    fn sig_opcode_classes() {
        assert_eq!(Opcode::from_u32(0x8231), Ok(sig::SENSOR_GET));
        assert_eq!(Opcode::from_u32(0x52), Ok(sig::SENSOR_STATUS));
        assert!(Opcode::from_u32(0x7F).is_err());
        assert!(Opcode::from_u32(0x1_0000).is_err());
    }

    #[test]
    fn response_families() {
        assert_eq!(
            VendorOp::Send.opcode(CID_ESP).response(),
            Some(VendorOp::Status.opcode(CID_ESP))
        );
        assert_eq!(VendorOp::LedCtrl.opcode(CID_ESP).response(), None);
        assert_eq!(
            sig::COMPOSITION_DATA_GET.response(),
            Some(sig::COMPOSITION_DATA_STATUS)
        );
        assert_eq!(sig::SENSOR_STATUS.response(), None);
    }

    #[test]
    fn vendor_op_requires_matching_company() {
        let foreign = VendorOp::DhtData.opcode(0x02E6);
        assert_eq!(VendorOp::from_opcode(foreign, CID_ESP), None);
        assert_eq!(
            VendorOp::from_opcode(foreign, 0x02E6),
            Some(VendorOp::DhtData)
        );
    }
}
