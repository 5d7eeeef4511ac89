//! # STEMMA Soil Sensor
//!
//! Driver for the Adafruit STEMMA capacitive soil sensor. The sensor
//! answers a `(base, function)` register select with a big-endian 16-bit
//! raw capacitance code, which is reported as-is: no scaling, filtering or
//! range check.
//!
//! The driver owns the bus for its whole lifetime. `initialize` and
//! `deinitialize` are both idempotent, so at most one bus and one device
//! exist at any time.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::ErrorType;

use crate::bus::{BusFactory, Device};
use crate::config::{BusConfig, DeviceConfig, MOISTURE_BASE_REG, MOISTURE_FUNC_REG};
use crate::error::SensorError;
use crate::fmt::Dbg;

/// Bus error type of a factory's bus.
pub type BusError<F> = <<F as BusFactory>::Bus as ErrorType>::Error;

/// Anything that can produce a raw moisture reading.
#[allow(async_fn_in_trait)]
pub trait MoistureSensor {
    /// The error returned when a sample could not be taken.
    type Error: core::fmt::Debug;

    /// Takes one sample.
    async fn read_moisture(&mut self) -> Result<u16, Self::Error>;
}

/// Reconstructs the moisture code from the two bytes on the wire.
pub const fn decode_moisture(raw: [u8; 2]) -> u16 {
    u16::from_be_bytes(raw)
}

/// STEMMA soil sensor on a bus created through `F`.
pub struct Stemma<F: BusFactory, D> {
    factory: F,
    delay: D,
    bus_config: BusConfig,
    device_config: DeviceConfig,
    device: Option<Device<F::Bus>>,
}

impl<F: BusFactory, D: DelayNs> Stemma<F, D> {
    /// Creates an uninitialized driver with the default wiring.
    pub fn new(factory: F, delay: D) -> Self {
        Self::with_config(factory, delay, BusConfig::default(), DeviceConfig::default())
    }

    /// Creates an uninitialized driver with custom wiring.
    pub fn with_config(
        factory: F,
        delay: D,
        bus_config: BusConfig,
        device_config: DeviceConfig,
    ) -> Self {
        Self {
            factory,
            delay,
            bus_config,
            device_config,
            device: None,
        }
    }

    /// Whether the bus and device are installed.
    pub fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    /// Creates the bus and attaches the sensor to it.
    ///
    /// Returns immediately when already initialized. On failure nothing is
    /// left installed: a bus created before a failed attach is released.
    pub fn initialize(&mut self) -> Result<(), F::Error> {
        if self.device.is_some() {
            return Ok(());
        }

        let mut bus = self.factory.create(&self.bus_config)?;
        if let Err(e) = self.factory.attach(&mut bus, &self.device_config) {
            self.factory.release(bus);
            return Err(e);
        }

        debug!(
            "stemma: attached at {:#x}, {} Hz",
            self.device_config.address,
            self.device_config.scl_speed_hz
        );
        self.device = Some(Device::new(bus, self.device_config));
        Ok(())
    }

    /// Reads the raw moisture code.
    pub async fn read_moisture(&mut self) -> Result<u16, SensorError<BusError<F>>> {
        let device = self.device.as_mut().ok_or(SensorError::NotInitialized)?;

        let mut data = [0u8; 2];
        device
            .register_read(&mut self.delay, MOISTURE_BASE_REG, MOISTURE_FUNC_REG, &mut data)
            .await?;

        Ok(decode_moisture(data))
    }

    /// Detaches the sensor and releases the bus. Safe to call at any time.
    pub fn deinitialize(&mut self) {
        if let Some(device) = self.device.take() {
            let (mut bus, config) = device.into_bus();
            self.factory.detach(&mut bus, &config);
            self.factory.release(bus);
            debug!("stemma: bus released");
        }
    }
}

impl<F, D> MoistureSensor for Stemma<F, D>
where
    F: BusFactory,
    D: DelayNs,
{
    type Error = SensorError<BusError<F>>;

    async fn read_moisture(&mut self) -> Result<u16, Self::Error> {
        let result = Stemma::read_moisture(self).await;
        if let Err(e) = &result {
            trace!("stemma: read failed: {:?}", Dbg(e));
        }
        result
    }
}
