//! Bodies of the configuration messages sent during peer setup
use crate::{
    payload::{PayloadError, Reader},
    AppKey, KeyIndex, ModelBinding, ModelKey,
};

pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_INVALID_ADDRESS: u8 = 0x01;
pub const STATUS_INVALID_MODEL: u8 = 0x02;
pub const STATUS_INVALID_APPKEY_INDEX: u8 = 0x03;
pub const STATUS_INVALID_NETKEY_INDEX: u8 = 0x04;

/// Two 12 bit key indexes packed into three octets
fn pack_indexes(net_idx: KeyIndex, app_idx: KeyIndex) -> [u8; 3] {
    let packed = (net_idx as u32 & 0x0FFF) | ((app_idx as u32 & 0x0FFF) << 12);
    let b = packed.to_le_bytes();
    [b[0], b[1], b[2]]
}

fn unpack_indexes(b: &[u8]) -> (KeyIndex, KeyIndex) {
    let packed = u32::from_le_bytes([b[0], b[1], b[2], 0]);
    ((packed & 0x0FFF) as u16, ((packed >> 12) & 0x0FFF) as u16)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppKeyAdd {
    pub net_idx: KeyIndex,
    pub app_idx: KeyIndex,
    pub key: AppKey,
}

impl AppKeyAdd {
    pub const WIRE_LEN: usize = 19;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = pack_indexes(self.net_idx, self.app_idx).to_vec();
        buf.extend_from_slice(&self.key);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        if buf.len() != Self::WIRE_LEN {
            return Err(PayloadError::Length {
                expected: Self::WIRE_LEN,
                got: buf.len(),
            });
        }
        let mut r = Reader::new(buf);
        let (net_idx, app_idx) = unpack_indexes(r.take(3)?);
        let mut key = [0u8; 16];
        key.copy_from_slice(r.take(16)?);
        Ok(Self {
            net_idx,
            app_idx,
            key,
        })
    }

    pub fn status(&self, status: u8) -> Vec<u8> {
        let mut buf = vec![status];
        buf.extend_from_slice(&pack_indexes(self.net_idx, self.app_idx));
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelAppBind {
    pub binding: ModelBinding,
    pub app_idx: KeyIndex,
}

impl ModelAppBind {
    fn write_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.binding.element.to_le_bytes());
        buf.extend_from_slice(&self.app_idx.to_le_bytes());
        if let Some(company) = self.binding.model.company {
            buf.extend_from_slice(&company.to_le_bytes());
        }
        buf.extend_from_slice(&self.binding.model.id.to_le_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        self.write_body(&mut buf);
        buf
    }

    /// SIG model ids are two octets, vendor model ids four
    pub fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        let mut r = Reader::new(buf);
        let element = r.u16()?;
        let app_idx = r.u16()?;
        let model = match buf.len() {
            6 => ModelKey::sig(r.u16()?),
            8 => {
                let company = r.u16()?;
                ModelKey::vendor(company, r.u16()?)
            }
            got => return Err(PayloadError::Length { expected: 8, got }),
        };
        Ok(Self {
            binding: ModelBinding { model, element },
            app_idx,
        })
    }

    pub fn status(&self, status: u8) -> Vec<u8> {
        let mut buf = vec![status];
        self.write_body(&mut buf);
        buf
    }
}

/// Status octet leading every configuration status message
pub fn status_code(payload: &[u8]) -> Result<u8, PayloadError> {
    payload.first().copied().ok_or(PayloadError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CID_ESP;

    #[test]
    fn app_key_add_packs_indexes() {
        let add = AppKeyAdd {
            net_idx: 0x0ABC,
            app_idx: 0x0123,
            key: [0x12; 16],
        };
        let buf = add.encode();
        assert_eq!(&buf[..3], &[0xBC, 0x3A, 0x12]);
        assert_eq!(AppKeyAdd::decode(&buf), Ok(add.clone()));
        assert_eq!(add.status(STATUS_SUCCESS), vec![0x00, 0xBC, 0x3A, 0x12]);
        assert!(AppKeyAdd::decode(&buf[..18]).is_err());
    }

    #[test]
    fn model_bind_sig_and_vendor() {
        let vendor = ModelAppBind {
            binding: ModelBinding {
                model: ModelKey::vendor(CID_ESP, ModelKey::VND_SERVER_ID),
                element: 0x0005,
            },
            app_idx: 0,
        };
        let buf = vendor.encode();
        assert_eq!(buf, vec![0x05, 0x00, 0x00, 0x00, 0xE5, 0x02, 0x01, 0x00]);
        assert_eq!(ModelAppBind::decode(&buf), Ok(vendor));

        let sig = ModelAppBind {
            binding: ModelBinding {
                model: ModelKey::SENSOR_SERVER,
                element: 0x0006,
            },
            app_idx: 0,
        };
        assert_eq!(ModelAppBind::decode(&sig.encode()), Ok(sig));
        assert!(ModelAppBind::decode(&[0x05, 0x00, 0x00]).is_err());
    }

    #[test]
    fn status_code_of_empty_body() {
        assert_eq!(status_code(&[]), Err(PayloadError::Truncated));
        assert_eq!(status_code(&[STATUS_INVALID_MODEL, 1]), Ok(STATUS_INVALID_MODEL));
    }
}
