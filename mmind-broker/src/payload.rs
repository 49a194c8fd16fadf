//! Canonical wire schema for the vendor model payloads.
//!
//! Every record is packed little endian and starts with a persistent
//! format identifier octet, so two nodes can never silently disagree on
//! the layout behind an opcode. Decoding compares the buffer length with
//! the record's wire length before any field is read.
use std::time::Duration;
use thiserror::Error;

use crate::Tid;

#[derive(Error, Debug, PartialEq)]
pub enum PayloadError {
    #[error("Length mismatch: expected {expected} got {got}")]
    Length { expected: usize, got: usize },
    #[error("Unknown format id 0x{got:02x}, expected 0x{expected:02x}")]
    Format { expected: u8, got: u8 },
    #[error("Invalid field {0}")]
    Field(&'static str),
    #[error("Truncated payload")]
    Truncated,
}

pub const FORMAT_DHT: u8 = 0x01;
pub const FORMAT_LDR: u8 = 0x02;
pub const FORMAT_LED: u8 = 0x03;

/// Value of the `timestamp` field: sender uptime in milliseconds modulo
/// 2^32. Receivers must treat it as a wrapping counter (about 49.7 days).
pub fn uptime_ms(elapsed: Duration) -> u32 {
    (elapsed.as_millis() % (1u128 << 32)) as u32
}

/// Fixed layout record carried by a single opcode
pub trait TypedPayload: Sized {
    /// Exact encoded size, format id included
    const WIRE_LEN: usize;

    fn write(&self, buf: &mut Vec<u8>);

    /// Only called with a buffer of exactly [`Self::WIRE_LEN`] octets
    fn read(buf: &[u8]) -> Result<Self, PayloadError>;

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        self.write(&mut buf);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, PayloadError> {
        if buf.len() != Self::WIRE_LEN {
            return Err(PayloadError::Length {
                expected: Self::WIRE_LEN,
                got: buf.len(),
            });
        }
        Self::read(buf)
    }
}

/// Bounds checked little endian reader
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], PayloadError> {
        let end = self.pos.checked_add(n).ok_or(PayloadError::Truncated)?;
        let out = self.buf.get(self.pos..end).ok_or(PayloadError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, PayloadError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, PayloadError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, PayloadError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn f32(&mut self) -> Result<f32, PayloadError> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        self.buf.get(self.pos..).unwrap_or(&[])
    }

    fn format(&mut self, expected: u8) -> Result<(), PayloadError> {
        let got = self.u8()?;
        if got != expected {
            return Err(PayloadError::Format { expected, got });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhtReading {
    /// Degrees Celsius
    pub temperature: f32,
    /// Percent relative humidity
    pub humidity: f32,
    /// Sender uptime, milliseconds
    pub timestamp: u32,
}

impl TypedPayload for DhtReading {
    const WIRE_LEN: usize = 13;

    fn write(&self, buf: &mut Vec<u8>) {
        buf.push(FORMAT_DHT);
        buf.extend_from_slice(&self.temperature.to_le_bytes());
        buf.extend_from_slice(&self.humidity.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Result<Self, PayloadError> {
        let mut r = Reader::new(buf);
        r.format(FORMAT_DHT)?;
        let temperature = r.f32()?;
        let humidity = r.f32()?;
        if !temperature.is_finite() || !humidity.is_finite() {
            return Err(PayloadError::Field("dht value not finite"));
        }
        Ok(Self {
            temperature,
            humidity,
            timestamp: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LightStatus {
    Dark = 0,
    Dim = 1,
    Bright = 2,
}

impl LightStatus {
    pub fn from_level(level: u16) -> Self {
        match level {
            0..=999 => LightStatus::Dark,
            1000..=2999 => LightStatus::Dim,
            _ => LightStatus::Bright,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LightStatus::Dark => "Dark",
            LightStatus::Dim => "Dim",
            LightStatus::Bright => "Bright",
        }
    }
}

impl TryFrom<u8> for LightStatus {
    type Error = PayloadError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(LightStatus::Dark),
            1 => Ok(LightStatus::Dim),
            2 => Ok(LightStatus::Bright),
            _ => Err(PayloadError::Field("light_status")),
        }
    }
}

pub const LDR_MAX_LEVEL: u16 = 4095;
const LDR_REF_VOLTAGE: f32 = 3.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LdrReading {
    /// 12 bit ADC count
    pub light_level: u16,
    pub voltage: f32,
    pub light_status: LightStatus,
    pub timestamp: u32,
}

impl LdrReading {
    pub fn from_level(level: u16, timestamp: u32) -> Self {
        let light_level = level.min(LDR_MAX_LEVEL);
        Self {
            light_level,
            voltage: light_level as f32 * LDR_REF_VOLTAGE / LDR_MAX_LEVEL as f32,
            light_status: LightStatus::from_level(light_level),
            timestamp,
        }
    }
}

impl TypedPayload for LdrReading {
    const WIRE_LEN: usize = 12;

    fn write(&self, buf: &mut Vec<u8>) {
        buf.push(FORMAT_LDR);
        buf.extend_from_slice(&self.light_level.to_le_bytes());
        buf.extend_from_slice(&self.voltage.to_le_bytes());
        buf.push(self.light_status as u8);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Result<Self, PayloadError> {
        let mut r = Reader::new(buf);
        r.format(FORMAT_LDR)?;
        let light_level = r.u16()?;
        if light_level > LDR_MAX_LEVEL {
            return Err(PayloadError::Field("light_level"));
        }
        let voltage = r.f32()?;
        let light_status = LightStatus::try_from(r.u8()?)?;
        Ok(Self {
            light_level,
            voltage,
            light_status,
            timestamp: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedControl {
    pub on: bool,
    pub timestamp: u32,
}

impl TypedPayload for LedControl {
    const WIRE_LEN: usize = 6;

    fn write(&self, buf: &mut Vec<u8>) {
        buf.push(FORMAT_LED);
        buf.push(self.on as u8);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Result<Self, PayloadError> {
        let mut r = Reader::new(buf);
        r.format(FORMAT_LED)?;
        let on = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(PayloadError::Field("led_state")),
        };
        Ok(Self {
            on,
            timestamp: r.u32()?,
        })
    }
}

/// Transaction id carried by the vendor SEND probe and its STATUS echo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorTid(pub Tid);

impl TypedPayload for VendorTid {
    const WIRE_LEN: usize = 2;

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Result<Self, PayloadError> {
        Ok(Self(Reader::new(buf).u16()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dht() -> DhtReading {
        DhtReading {
            temperature: 21.5,
            humidity: 55.0,
            timestamp: 1234,
        }
    }

    #[test]
    fn dht_layout() {
        let buf = dht().encode();
        assert_eq!(buf.len(), DhtReading::WIRE_LEN);
        assert_eq!(buf[0], FORMAT_DHT);
        assert_eq!(&buf[1..5], &21.5f32.to_le_bytes());
        assert_eq!(&buf[9..13], &1234u32.to_le_bytes());
        assert_eq!(DhtReading::decode(&buf), Ok(dht()));
    }

    #[test]
    fn uptime_wraps_past_u32() {
        assert_eq!(uptime_ms(Duration::from_millis(1234)), 1234);
        assert_eq!(uptime_ms(Duration::from_millis(u32::MAX as u64)), u32::MAX);
        assert_eq!(uptime_ms(Duration::from_millis(u32::MAX as u64 + 5)), 4);
        assert_eq!(uptime_ms(Duration::from_secs(50 * 24 * 3600)), 25_032_704);
    }

    #[test]
    fn every_wrong_length_is_rejected() {
        let dht = dht().encode();
        let ldr = LdrReading::from_level(1500, 7).encode();
        let led = LedControl {
            on: true,
            timestamp: 1,
        }
        .encode();

        for len in 0..=255usize {
            let mut buf = vec![0u8; len];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = *dht.get(i).unwrap_or(&0xAA);
            }
            if len != DhtReading::WIRE_LEN {
                assert_eq!(
                    DhtReading::decode(&buf),
                    Err(PayloadError::Length {
                        expected: DhtReading::WIRE_LEN,
                        got: len
                    })
                );
            }
            if len != LdrReading::WIRE_LEN {
                let buf: Vec<u8> = (0..len).map(|i| *ldr.get(i).unwrap_or(&0)).collect();
                assert!(matches!(
                    LdrReading::decode(&buf),
                    Err(PayloadError::Length { .. })
                ));
            }
            if len != LedControl::WIRE_LEN {
                let buf: Vec<u8> = (0..len).map(|i| *led.get(i).unwrap_or(&1)).collect();
                assert!(matches!(
                    LedControl::decode(&buf),
                    Err(PayloadError::Length { .. })
                ));
            }
            if len != VendorTid::WIRE_LEN {
                assert!(VendorTid::decode(&vec![7u8; len]).is_err());
            }
        }
    }

    #[test]
    fn format_id_is_checked() {
        let mut buf = dht().encode();
        buf[0] = FORMAT_LDR;
        assert_eq!(
            DhtReading::decode(&buf),
            Err(PayloadError::Format {
                expected: FORMAT_DHT,
                got: FORMAT_LDR
            })
        );
    }

    #[test]
    fn ldr_status_thresholds() {
        assert_eq!(LdrReading::from_level(999, 0).light_status, LightStatus::Dark);
        assert_eq!(LdrReading::from_level(1000, 0).light_status, LightStatus::Dim);
        assert_eq!(LdrReading::from_level(3000, 0).light_status, LightStatus::Bright);
        let full = LdrReading::from_level(9000, 0);
        assert_eq!(full.light_level, LDR_MAX_LEVEL);
        assert!((full.voltage - 3.3).abs() < 1e-4);
    }

    #[test]
    fn led_rejects_bad_state() {
        let buf = [FORMAT_LED, 2, 0, 0, 0, 0];
        assert_eq!(
            LedControl::decode(&buf),
            Err(PayloadError::Field("led_state"))
        );
    }

    #[test]
    fn tid_is_little_endian() {
        assert_eq!(VendorTid(0x0007).encode(), vec![0x07, 0x00]);
        assert_eq!(VendorTid::decode(&[0x34, 0x12]), Ok(VendorTid(0x1234)));
    }
}
