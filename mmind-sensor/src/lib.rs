//! Sensor lib defining the sampling and actuation interfaces used by
//! mesh-minder nodes.
//!
//! Nodes never talk to hardware directly. Instead a node is handed:
//!
//! 1. One [`Sampler`] per physical quantity (temperature, humidity, light).
//!    Sampling is pull based, synchronous and must be cheap: it is called
//!    from the periodic publish timer and from request handlers.
//! 2. An [`Actuator`] that applies control state (currently only the
//!    on-board LED) immediately when a control message arrives.
//!
//! Real builds would poll hardware behind these traits. The builds in this
//! workspace use [`RandomWalk`] samplers, which wander within a fixed range,
//! and a [`SimulatedLed`] whose state can be observed through a
//! [`LedHandle`].
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Read Error")]
    ReadError,
    #[error("Write Error")]
    WriteError,
    #[error("Unsupported actuator {0:?}")]
    UnsupportedActuator(ActuatorId),
    #[error("Invalid walk range {min}..={max} (start {start})")]
    InvalidRange { start: i32, min: i32, max: i32 },
}

/// Physical quantity served by a [`Sampler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// Degrees Celsius
    Temperature,
    /// Relative humidity, percent
    Humidity,
    /// Light level, raw 12 bit ADC counts for LDR builds
    Light,
}

/// Pull based sensor interface, one instance per quantity
pub trait Sampler: Send {
    fn quantity(&self) -> Quantity;
    fn sample(&mut self) -> Result<f32, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActuatorId {
    Led,
}

/// Push based actuator interface
pub trait Actuator: Send {
    fn set(&mut self, id: ActuatorId, on: bool) -> Result<(), SensorError>;
}

/// Bounds and starting point of a simulated quantity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WalkConfig {
    pub start: i32,
    pub min: i32,
    pub max: i32,
    /// Largest change applied by a single sample
    pub step: i32,
}

impl WalkConfig {
    pub const TEMPERATURE: WalkConfig = WalkConfig {
        start: 20,
        min: 0,
        max: 50,
        step: 5,
    };
    pub const HUMIDITY: WalkConfig = WalkConfig {
        start: 50,
        min: 0,
        max: 100,
        step: 5,
    };
    pub const LIGHT: WalkConfig = WalkConfig {
        start: 2048,
        min: 0,
        max: 4095,
        step: 200,
    };
}

/// Simulated sensor performing a bounded random walk. Each sample picks a
/// direction and a magnitude below `step`, then clamps into `min..=max`.
pub struct RandomWalk {
    quantity: Quantity,
    value: i32,
    cfg: WalkConfig,
    rng: StdRng,
}

impl RandomWalk {
    pub fn new(quantity: Quantity, cfg: WalkConfig) -> Result<Self, SensorError> {
        Self::with_rng(quantity, cfg, StdRng::from_entropy())
    }

    /// Deterministic walk, used by tests and reproducible runs
    pub fn seeded(quantity: Quantity, cfg: WalkConfig, seed: u64) -> Result<Self, SensorError> {
        Self::with_rng(quantity, cfg, StdRng::seed_from_u64(seed))
    }

    fn with_rng(quantity: Quantity, cfg: WalkConfig, rng: StdRng) -> Result<Self, SensorError> {
        if cfg.min > cfg.max || cfg.start < cfg.min || cfg.start > cfg.max || cfg.step <= 0 {
            log::error!("Rejecting walk config for {quantity:?}: {cfg:?}");
            return Err(SensorError::InvalidRange {
                start: cfg.start,
                min: cfg.min,
                max: cfg.max,
            });
        }
        Ok(Self {
            quantity,
            value: cfg.start,
            cfg,
            rng,
        })
    }

    pub fn temperature() -> Result<Self, SensorError> {
        Self::new(Quantity::Temperature, WalkConfig::TEMPERATURE)
    }

    pub fn humidity() -> Result<Self, SensorError> {
        Self::new(Quantity::Humidity, WalkConfig::HUMIDITY)
    }

    pub fn light() -> Result<Self, SensorError> {
        Self::new(Quantity::Light, WalkConfig::LIGHT)
    }

    pub fn current(&self) -> i32 {
        self.value
    }
}

impl Sampler for RandomWalk {
    fn quantity(&self) -> Quantity {
        self.quantity
    }

    fn sample(&mut self) -> Result<f32, SensorError> {
        let change = self.rng.gen_range(-self.cfg.step..self.cfg.step);
        let next = if self.rng.gen_bool(0.5) {
            self.value.saturating_add(change)
        } else {
            self.value.saturating_sub(change)
        };
        self.value = next.clamp(self.cfg.min, self.cfg.max);
        log::trace!("{:?} sample {}", self.quantity, self.value);
        Ok(self.value as f32)
    }
}

/// Sampler that always returns the same value
pub struct FixedSampler {
    pub quantity: Quantity,
    pub value: f32,
}

impl Sampler for FixedSampler {
    fn quantity(&self) -> Quantity {
        self.quantity
    }

    fn sample(&mut self) -> Result<f32, SensorError> {
        Ok(self.value)
    }
}

/// Shared view of a [`SimulatedLed`], cheap to clone
#[derive(Debug, Clone, Default)]
pub struct LedHandle(Arc<AtomicBool>);

impl LedHandle {
    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// On-board LED stand-in
#[derive(Debug, Default)]
pub struct SimulatedLed {
    state: LedHandle,
}

impl SimulatedLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> LedHandle {
        self.state.clone()
    }
}

impl Actuator for SimulatedLed {
    fn set(&mut self, id: ActuatorId, on: bool) -> Result<(), SensorError> {
        match id {
            ActuatorId::Led => {
                self.state.0.store(on, Ordering::SeqCst);
                log::info!("LED {}", if on { "ON" } else { "OFF" });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_stays_in_bounds() {
        let mut walk = RandomWalk::seeded(Quantity::Temperature, WalkConfig::TEMPERATURE, 7)
            .expect("valid config");
        for _ in 0..10_000 {
            let v = walk.sample().expect("sample");
            assert!((0.0..=50.0).contains(&v));
        }
    }

    #[test]
    fn walk_step_is_bounded() {
        let mut walk = RandomWalk::seeded(Quantity::Light, WalkConfig::LIGHT, 99).expect("cfg");
        let mut prev = walk.current();
        for _ in 0..1_000 {
            walk.sample().expect("sample");
            assert!((walk.current() - prev).abs() <= WalkConfig::LIGHT.step);
            prev = walk.current();
        }
    }

    #[test]
    fn rejects_inverted_range() {
        let cfg = WalkConfig {
            start: 5,
            min: 10,
            max: 0,
            step: 1,
        };
        assert!(RandomWalk::new(Quantity::Humidity, cfg).is_err());
    }

    #[test]
    fn led_handle_tracks_state() {
        let mut led = SimulatedLed::new();
        let handle = led.handle();
        assert!(!handle.is_on());
        led.set(ActuatorId::Led, true).expect("set");
        assert!(handle.is_on());
        led.set(ActuatorId::Led, false).expect("set");
        assert!(!handle.is_on());
    }
}
