use crate::{
    payload::{DhtReading, LdrReading, LightStatus},
    sensor_data::{PropertyId, SensorValue},
    sensor_data::{
        PRESENT_AMBIENT_LIGHT_LEVEL, PRESENT_AMBIENT_RELATIVE_HUMIDITY,
        PRESENT_AMBIENT_TEMPERATURE, PRESENT_INDOOR_AMBIENT_TEMPERATURE,
        PRESENT_OUTDOOR_AMBIENT_TEMPERATURE,
    },
    UnicastAddr,
};

/// A validated reading received over the mesh
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Dht(DhtReading),
    Ldr(LdrReading),
    /// Decoded SIG Sensor Status values
    Sensor(Vec<(PropertyId, SensorValue)>),
}

/// Last known value per channel. Channels never received stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub light_level: Option<f32>,
    pub voltage: Option<f32>,
    pub light_status: Option<LightStatus>,
    pub source: Option<UnicastAddr>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.light_level.is_none()
            && self.voltage.is_none()
            && self.light_status.is_none()
    }

    /// Latest value wins, per channel
    pub fn apply(&mut self, source: UnicastAddr, reading: &Reading) {
        match reading {
            Reading::Dht(d) => {
                self.temperature = Some(d.temperature);
                self.humidity = Some(d.humidity);
            }
            Reading::Ldr(l) => {
                self.light_level = Some(l.light_level as f32);
                self.voltage = Some(l.voltage);
                self.light_status = Some(l.light_status);
            }
            Reading::Sensor(values) => {
                for (property, v) in values {
                    match (*property, *v) {
                        (
                            PRESENT_AMBIENT_TEMPERATURE
                            | PRESENT_INDOOR_AMBIENT_TEMPERATURE
                            | PRESENT_OUTDOOR_AMBIENT_TEMPERATURE,
                            SensorValue::Temperature(t),
                        ) => self.temperature = Some(t),
                        (PRESENT_AMBIENT_RELATIVE_HUMIDITY, SensorValue::Humidity(h)) => {
                            self.humidity = Some(h)
                        }
                        (PRESENT_AMBIENT_LIGHT_LEVEL, SensorValue::Illuminance(l)) => {
                            self.light_level = Some(l)
                        }
                        (p, v) => log::debug!("Ignoring property 0x{p:04x} value {v:?}"),
                    }
                }
            }
        }
        self.source = Some(source);
    }

    /// Value to report for a sensor property, if known
    pub fn value_for(&self, property: PropertyId) -> Option<SensorValue> {
        match property {
            PRESENT_AMBIENT_TEMPERATURE
            | PRESENT_INDOOR_AMBIENT_TEMPERATURE
            | PRESENT_OUTDOOR_AMBIENT_TEMPERATURE => self.temperature.map(SensorValue::Temperature),
            PRESENT_AMBIENT_RELATIVE_HUMIDITY => self.humidity.map(SensorValue::Humidity),
            PRESENT_AMBIENT_LIGHT_LEVEL => self.light_level.map(SensorValue::Illuminance),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_value_wins_per_channel() {
        let mut snap = Snapshot::default();
        assert!(snap.is_empty());

        snap.apply(
            0x0005,
            &Reading::Dht(DhtReading {
                temperature: 21.5,
                humidity: 55.0,
                timestamp: 1,
            }),
        );
        snap.apply(0x0006, &Reading::Ldr(LdrReading::from_level(3500, 2)));
        snap.apply(
            0x0007,
            &Reading::Sensor(vec![(
                PRESENT_INDOOR_AMBIENT_TEMPERATURE,
                SensorValue::Temperature(19.0),
            )]),
        );

        assert_eq!(snap.temperature, Some(19.0));
        assert_eq!(snap.humidity, Some(55.0));
        assert_eq!(snap.light_level, Some(3500.0));
        assert_eq!(snap.light_status, Some(LightStatus::Bright));
        assert_eq!(snap.source, Some(0x0007));
    }
}
