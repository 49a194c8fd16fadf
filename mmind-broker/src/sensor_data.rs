//! Marshalled Sensor Data and Sensor Descriptor encodings of the SIG
//! sensor models.
//!
//! A Sensor Status body is a sequence of `(MPID, raw value)` pairs. The
//! MPID names the property and the value length, so values are decoded by
//! property id and checked against the characteristic's own length.
//! Nothing here assumes a fixed positional layout.
use thiserror::Error;

use crate::payload::{PayloadError, Reader};

pub type PropertyId = u16;

pub const PRESENT_AMBIENT_LIGHT_LEVEL: PropertyId = 0x004D;
pub const PRESENT_AMBIENT_TEMPERATURE: PropertyId = 0x004F;
pub const PRESENT_INDOOR_AMBIENT_TEMPERATURE: PropertyId = 0x0056;
pub const PRESENT_OUTDOOR_AMBIENT_TEMPERATURE: PropertyId = 0x005B;
pub const PRESENT_AMBIENT_RELATIVE_HUMIDITY: PropertyId = 0x0076;

/// Property id 0 is prohibited
pub const PROPERTY_PROHIBITED: PropertyId = 0x0000;

const FORMAT_A_MAX_LEN: usize = 16;
const FORMAT_A_MAX_PROPERTY: PropertyId = 0x07FF;
const FORMAT_B_MAX_LEN: usize = 127;
const FORMAT_B_ZERO_LEN: u8 = 0x7F;

const TEMPERATURE_8_UNKNOWN: u8 = 0x7F;
const HUMIDITY_UNKNOWN: u16 = 0xFFFF;
const ILLUMINANCE_UNKNOWN: u32 = 0x00FF_FFFF;

#[derive(Error, Debug, PartialEq)]
pub enum SensorDataError {
    #[error("Truncated MPID at offset {0}")]
    TruncatedMpid(usize),
    #[error("Property 0x{property:04x} value truncated: need {need} have {have}")]
    TruncatedValue {
        property: PropertyId,
        need: usize,
        have: usize,
    },
    #[error("Property 0x{property:04x} expects {expected} octets, got {got}")]
    Length {
        property: PropertyId,
        expected: usize,
        got: usize,
    },
    #[error("Prohibited property id")]
    Prohibited,
    #[error("Value too long for any MPID format: {0}")]
    TooLong(usize),
    #[error("Payload Error")]
    Payload(#[from] PayloadError),
}

/// Characteristic width of the known properties
pub fn characteristic_len(property: PropertyId) -> Option<usize> {
    match property {
        PRESENT_AMBIENT_TEMPERATURE
        | PRESENT_INDOOR_AMBIENT_TEMPERATURE
        | PRESENT_OUTDOOR_AMBIENT_TEMPERATURE => Some(1),
        PRESENT_AMBIENT_RELATIVE_HUMIDITY => Some(2),
        PRESENT_AMBIENT_LIGHT_LEVEL => Some(3),
        _ => None,
    }
}

/// One decoded sensor property
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorValue {
    /// Degrees Celsius, 0.5 degree resolution
    Temperature(f32),
    /// Percent relative humidity, 0.01 resolution
    Humidity(f32),
    /// Lux, 0.01 resolution
    Illuminance(f32),
}

/// Raw entry of a marshalled Sensor Data list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorEntry {
    pub property: PropertyId,
    pub raw: Vec<u8>,
}

/// Split a Sensor Status body into entries
pub fn parse(data: &[u8]) -> Result<Vec<SensorEntry>, SensorDataError> {
    let mut entries = vec![];
    let mut offset = 0;

    while offset < data.len() {
        let d0 = data[offset];
        let (len, property, mpid_len) = if d0 & 0x01 == 0 {
            let d1 = *data
                .get(offset + 1)
                .ok_or(SensorDataError::TruncatedMpid(offset))?;
            let len = ((d0 >> 1) & 0x0F) as usize + 1;
            let property = ((d1 as u16) << 3) | (d0 >> 5) as u16;
            (len, property, 2)
        } else {
            let pid = data
                .get(offset + 1..offset + 3)
                .ok_or(SensorDataError::TruncatedMpid(offset))?;
            let raw_len = d0 >> 1;
            let len = if raw_len == FORMAT_B_ZERO_LEN {
                0
            } else {
                raw_len as usize + 1
            };
            (len, u16::from_le_bytes([pid[0], pid[1]]), 3)
        };

        if property == PROPERTY_PROHIBITED {
            return Err(SensorDataError::Prohibited);
        }

        let start = offset + mpid_len;
        let raw = data
            .get(start..start + len)
            .ok_or(SensorDataError::TruncatedValue {
                property,
                need: len,
                have: data.len().saturating_sub(start),
            })?;
        entries.push(SensorEntry {
            property,
            raw: raw.to_vec(),
        });
        offset = start + len;
    }

    Ok(entries)
}

/// Append one entry, choosing Format A when it fits
pub fn encode_entry(buf: &mut Vec<u8>, entry: &SensorEntry) -> Result<(), SensorDataError> {
    let len = entry.raw.len();
    if entry.property == PROPERTY_PROHIBITED {
        return Err(SensorDataError::Prohibited);
    }
    if len > FORMAT_B_MAX_LEN {
        return Err(SensorDataError::TooLong(len));
    }

    if (1..=FORMAT_A_MAX_LEN).contains(&len) && entry.property <= FORMAT_A_MAX_PROPERTY {
        buf.push((((len - 1) as u8) << 1) | (((entry.property & 0x07) as u8) << 5));
        buf.push((entry.property >> 3) as u8);
    } else {
        let l = if len == 0 {
            FORMAT_B_ZERO_LEN
        } else {
            (len - 1) as u8
        };
        buf.push((l << 1) | 0x01);
        buf.extend_from_slice(&entry.property.to_le_bytes());
    }
    buf.extend_from_slice(&entry.raw);
    Ok(())
}

pub fn encode(entries: &[SensorEntry]) -> Result<Vec<u8>, SensorDataError> {
    let mut buf = vec![];
    for e in entries {
        encode_entry(&mut buf, e)?;
    }
    Ok(buf)
}

/// Decode an entry by its property id. `Ok(None)` covers properties this
/// node does not know as well as the characteristic's "value unknown"
/// sentinel; a length that disagrees with the characteristic is an error.
pub fn decode_value(entry: &SensorEntry) -> Result<Option<SensorValue>, SensorDataError> {
    let Some(expected) = characteristic_len(entry.property) else {
        return Ok(None);
    };
    if entry.raw.is_empty() {
        return Ok(None);
    }
    if entry.raw.len() != expected {
        return Err(SensorDataError::Length {
            property: entry.property,
            expected,
            got: entry.raw.len(),
        });
    }

    let mut r = Reader::new(&entry.raw);
    let value = match entry.property {
        PRESENT_AMBIENT_RELATIVE_HUMIDITY => {
            let v = r.u16()?;
            if v == HUMIDITY_UNKNOWN {
                return Ok(None);
            }
            SensorValue::Humidity(v as f32 / 100.0)
        }
        PRESENT_AMBIENT_LIGHT_LEVEL => {
            let b = r.take(3)?;
            let v = u32::from_le_bytes([b[0], b[1], b[2], 0]);
            if v == ILLUMINANCE_UNKNOWN {
                return Ok(None);
            }
            SensorValue::Illuminance(v as f32 / 100.0)
        }
        _ => {
            let v = r.u8()?;
            if v == TEMPERATURE_8_UNKNOWN {
                return Ok(None);
            }
            SensorValue::Temperature(v as i8 as f32 / 2.0)
        }
    };
    Ok(Some(value))
}

/// Decode a whole Sensor Status body. Any malformed entry rejects the
/// message as a whole.
pub fn decode_status(data: &[u8]) -> Result<Vec<(PropertyId, SensorValue)>, SensorDataError> {
    let mut out = vec![];
    for entry in parse(data)? {
        if let Some(v) = decode_value(&entry)? {
            out.push((entry.property, v));
        } else {
            log::debug!("No value for property 0x{:04x}", entry.property);
        }
    }
    Ok(out)
}

/// Raw characteristic octets for a value under the given property
pub fn encode_value(property: PropertyId, value: Option<SensorValue>) -> SensorEntry {
    let raw = match (characteristic_len(property), value) {
        (Some(2), Some(SensorValue::Humidity(h))) => {
            ((h.clamp(0.0, 100.0) * 100.0).round() as u16)
                .to_le_bytes()
                .to_vec()
        }
        (Some(2), _) => HUMIDITY_UNKNOWN.to_le_bytes().to_vec(),
        (Some(3), Some(SensorValue::Illuminance(lux))) => {
            let v = ((lux.max(0.0) * 100.0).round() as u32).min(ILLUMINANCE_UNKNOWN - 1);
            v.to_le_bytes()[..3].to_vec()
        }
        (Some(3), _) => ILLUMINANCE_UNKNOWN.to_le_bytes()[..3].to_vec(),
        (Some(1), Some(SensorValue::Temperature(t))) => {
            vec![(t * 2.0).round().clamp(-128.0, 126.0) as i8 as u8]
        }
        (Some(1), _) => vec![TEMPERATURE_8_UNKNOWN],
        _ => vec![],
    };
    SensorEntry { property, raw }
}

pub const DESCRIPTOR_LEN: usize = 8;
pub const UNSPECIFIED_TOLERANCE: u16 = 0;
pub const SAMPLE_FUNCTION_UNSPECIFIED: u8 = 0x00;
pub const MEASURE_PERIOD_NOT_APPLICABLE: u8 = 0x00;
pub const UPDATE_INTERVAL_NOT_APPLICABLE: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDescriptor {
    pub property: PropertyId,
    /// 12 bit
    pub positive_tolerance: u16,
    /// 12 bit
    pub negative_tolerance: u16,
    pub sampling_function: u8,
    pub measure_period: u8,
    pub update_interval: u8,
}

impl SensorDescriptor {
    pub fn unspecified(property: PropertyId) -> Self {
        Self {
            property,
            positive_tolerance: UNSPECIFIED_TOLERANCE,
            negative_tolerance: UNSPECIFIED_TOLERANCE,
            sampling_function: SAMPLE_FUNCTION_UNSPECIFIED,
            measure_period: MEASURE_PERIOD_NOT_APPLICABLE,
            update_interval: UPDATE_INTERVAL_NOT_APPLICABLE,
        }
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let pos = self.positive_tolerance & 0x0FFF;
        let neg = self.negative_tolerance & 0x0FFF;
        buf.extend_from_slice(&self.property.to_le_bytes());
        buf.push((pos & 0xFF) as u8);
        buf.push(((pos >> 8) as u8) | (((neg & 0x0F) as u8) << 4));
        buf.push((neg >> 4) as u8);
        buf.push(self.sampling_function);
        buf.push(self.measure_period);
        buf.push(self.update_interval);
    }
}

/// Parse a Sensor Descriptor Status. A bare property id means the server
/// does not support that property and yields no descriptors.
pub fn parse_descriptors(data: &[u8]) -> Result<Vec<SensorDescriptor>, SensorDataError> {
    if data.len() == 2 {
        return Ok(vec![]);
    }
    if data.len() % DESCRIPTOR_LEN != 0 {
        return Err(PayloadError::Length {
            expected: (data.len() / DESCRIPTOR_LEN + 1) * DESCRIPTOR_LEN,
            got: data.len(),
        }
        .into());
    }

    let mut r = Reader::new(data);
    let mut out = vec![];
    while !r.remaining().is_empty() {
        let property = r.u16()?;
        let t = r.take(3)?;
        out.push(SensorDescriptor {
            property,
            positive_tolerance: t[0] as u16 | ((t[1] as u16 & 0x0F) << 8),
            negative_tolerance: (t[1] >> 4) as u16 | ((t[2] as u16) << 4),
            sampling_function: r.u8()?,
            measure_period: r.u8()?,
            update_interval: r.u8()?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_a_mpid() {
        // Temperature 8 under 0x0056, raw 40 => 20 degrees
        let e = encode_value(
            PRESENT_INDOOR_AMBIENT_TEMPERATURE,
            Some(SensorValue::Temperature(20.0)),
        );
        let buf = encode(&[e.clone()]).expect("encode");
        assert_eq!(buf, vec![0xC0, 0x0A, 40]);

        let parsed = parse(&buf).expect("parse");
        assert_eq!(parsed, vec![e]);
        assert_eq!(
            decode_value(&parsed[0]),
            Ok(Some(SensorValue::Temperature(20.0)))
        );
    }

    #[test]
    fn format_b_zero_length() {
        let buf = encode(&[SensorEntry {
            property: 0x1234,
            raw: vec![],
        }])
        .expect("encode");
        assert_eq!(buf, vec![0xFF, 0x34, 0x12]);
        let parsed = parse(&buf).expect("parse");
        assert_eq!(parsed[0].property, 0x1234);
        assert!(parsed[0].raw.is_empty());
    }

    #[test]
    fn mixed_status_decodes_by_property() {
        let entries = [
            encode_value(
                PRESENT_AMBIENT_RELATIVE_HUMIDITY,
                Some(SensorValue::Humidity(55.0)),
            ),
            encode_value(
                PRESENT_AMBIENT_TEMPERATURE,
                Some(SensorValue::Temperature(21.5)),
            ),
            encode_value(
                PRESENT_AMBIENT_LIGHT_LEVEL,
                Some(SensorValue::Illuminance(312.25)),
            ),
        ];
        let values = decode_status(&encode(&entries).expect("encode")).expect("decode");
        assert_eq!(
            values,
            vec![
                (PRESENT_AMBIENT_RELATIVE_HUMIDITY, SensorValue::Humidity(55.0)),
                (PRESENT_AMBIENT_TEMPERATURE, SensorValue::Temperature(21.5)),
                (PRESENT_AMBIENT_LIGHT_LEVEL, SensorValue::Illuminance(312.25)),
            ]
        );
    }

    #[test]
    fn three_octet_positional_buffer_is_not_three_channels() {
        // A bare {temp, hum, light} triple is not marshalled sensor data
        assert!(decode_status(&[40, 60, 10]).is_err());
    }

    #[test]
    fn wrong_characteristic_length_rejected() {
        let bad = SensorEntry {
            property: PRESENT_AMBIENT_TEMPERATURE,
            raw: vec![1, 2],
        };
        let buf = encode(&[bad]).expect("encode");
        assert_eq!(
            decode_status(&buf),
            Err(SensorDataError::Length {
                property: PRESENT_AMBIENT_TEMPERATURE,
                expected: 1,
                got: 2
            })
        );
    }

    #[test]
    fn truncated_value_rejected() {
        // Format A, length 2, property 0x0076, one value octet present
        let mut buf = encode(&[encode_value(
            PRESENT_AMBIENT_RELATIVE_HUMIDITY,
            Some(SensorValue::Humidity(10.0)),
        )])
        .expect("encode");
        buf.pop();
        assert!(matches!(
            parse(&buf),
            Err(SensorDataError::TruncatedValue { .. })
        ));
    }

    #[test]
    fn unknown_sentinel_is_not_a_value() {
        let e = encode_value(PRESENT_AMBIENT_TEMPERATURE, None);
        assert_eq!(decode_value(&e), Ok(None));
    }

    #[test]
    fn descriptor_layout() {
        let d = SensorDescriptor {
            property: PRESENT_INDOOR_AMBIENT_TEMPERATURE,
            positive_tolerance: 0x0ABC,
            negative_tolerance: 0x0123,
            sampling_function: 1,
            measure_period: 2,
            update_interval: 3,
        };
        let mut buf = vec![];
        d.write(&mut buf);
        assert_eq!(buf.len(), DESCRIPTOR_LEN);
        assert_eq!(parse_descriptors(&buf), Ok(vec![d]));
        assert_eq!(parse_descriptors(&[0x56, 0x00]), Ok(vec![]));
        assert!(parse_descriptors(&buf[..5]).is_err());
    }
}
