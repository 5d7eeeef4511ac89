//! # Bus Transport
//!
//! Ownership of the two-wire bus and the addressed sensor on it, plus the
//! two-phase register read the STEMMA sensor expects:
//!
//! ```text
//! 1. select   | start | addr + W | base | function | stop |
//!    settle   25 ms, the sensor prepares the data
//! 2. read     | start | addr + R | data[0] .. data[n-1] (last NACK) | stop |
//! ```
//!
//! Creating and tearing down the bus is platform work and goes through the
//! [`BusFactory`] trait. The transactions themselves only need
//! [`embedded_hal_async::i2c::I2c`].

use core::future::Future;
use core::pin::pin;

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use futures::future::{Either, select};

use crate::config::{BusConfig, DeviceConfig, SETTLE_DELAY_MS, TRANSACTION_TIMEOUT_MS};
use crate::error::SensorError;

/// Platform hook that creates the bus and registers devices on it.
///
/// Implemented by the firmware on top of its HAL (pin muxing, clock source,
/// pull-ups, glitch filter).
pub trait BusFactory {
    /// The configured bus.
    type Bus: I2c;
    /// Configuration error.
    type Error: core::fmt::Debug;

    /// Configures the bus controller and returns exclusive ownership of it.
    fn create(&mut self, config: &BusConfig) -> Result<Self::Bus, Self::Error>;

    /// Registers `device` on `bus`.
    fn attach(&mut self, bus: &mut Self::Bus, device: &DeviceConfig) -> Result<(), Self::Error>;

    /// Removes a device registered with [`attach`](Self::attach).
    fn detach(&mut self, bus: &mut Self::Bus, device: &DeviceConfig);

    /// Tears the bus down. The controller is free again afterwards.
    fn release(&mut self, bus: Self::Bus);
}

/// A device attached to an owned bus.
///
/// The pair lives and dies together: dropping the bus is only possible by
/// taking the whole `Device` apart with [`into_bus`](Self::into_bus).
pub struct Device<B> {
    bus: B,
    config: DeviceConfig,
}

impl<B: I2c> Device<B> {
    pub fn new(bus: B, config: DeviceConfig) -> Self {
        Self { bus, config }
    }

    /// The device's bus configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Splits the device into its bus and configuration.
    pub fn into_bus(self) -> (B, DeviceConfig) {
        (self.bus, self.config)
    }

    /// Reads `buf.len()` bytes from the register selected by
    /// `(selector_high, selector_low)`.
    ///
    /// The select phase must succeed before the read phase is attempted.
    /// Errors are returned as reported by the bus. There is no retry here.
    pub async fn register_read<D: DelayNs>(
        &mut self,
        delay: &mut D,
        selector_high: u8,
        selector_low: u8,
        buf: &mut [u8],
    ) -> Result<(), SensorError<B::Error>> {
        let address = self.config.address;
        let command = [selector_high, selector_low];

        with_timeout(delay, self.bus.write(address, &command)).await?;

        delay.delay_ms(SETTLE_DELAY_MS).await;

        with_timeout(delay, self.bus.read(address, buf)).await
    }
}

/// Races a bus operation against the transaction timeout.
async fn with_timeout<D, F, E>(delay: &mut D, op: F) -> Result<(), SensorError<E>>
where
    D: DelayNs,
    F: Future<Output = Result<(), E>>,
{
    let timer = delay.delay_ms(TRANSACTION_TIMEOUT_MS);
    match select(pin!(op), pin!(timer)).await {
        Either::Left((result, _)) => result.map_err(SensorError::Bus),
        Either::Right(((), _)) => Err(SensorError::Timeout),
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted bus and delay shared by the sensor tests.

    use std::vec::Vec;

    use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation};
    use embedded_hal_async::delay::DelayNs;
    use embedded_hal_async::i2c::I2c;

    use super::BusFactory;
    use crate::config::{BusConfig, DeviceConfig};

    /// What the mock bus does on a phase.
    #[derive(Clone, Copy, Debug)]
    pub enum Reply {
        Ok,
        Nack,
        /// Never completes.
        Stall,
    }

    pub struct MockBus {
        pub write_reply: Reply,
        pub read_reply: Reply,
        pub data: [u8; 2],
        pub writes: Vec<(u8, Vec<u8>)>,
        pub reads: Vec<(u8, usize)>,
    }

    impl MockBus {
        pub fn returning(data: [u8; 2]) -> Self {
            Self {
                write_reply: Reply::Ok,
                read_reply: Reply::Ok,
                data,
                writes: Vec::new(),
                reads: Vec::new(),
            }
        }
    }

    async fn reply(reply: Reply) -> Result<(), ErrorKind> {
        match reply {
            Reply::Ok => Ok(()),
            Reply::Nack => Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)),
            Reply::Stall => core::future::pending().await,
        }
    }

    impl ErrorType for MockBus {
        type Error = ErrorKind;
    }

    impl I2c for MockBus {
        async fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            for op in operations {
                match op {
                    Operation::Write(bytes) => {
                        self.writes.push((address, bytes.to_vec()));
                        reply(self.write_reply).await?;
                    }
                    Operation::Read(buf) => {
                        self.reads.push((address, buf.len()));
                        reply(self.read_reply).await?;
                        for (dst, src) in buf.iter_mut().zip(self.data.iter()) {
                            *dst = *src;
                        }
                    }
                }
            }
            Ok(())
        }
    }

    /// Records every delay in milliseconds and returns immediately.
    #[derive(Default)]
    pub struct RecordingDelay {
        pub delays_ms: Vec<u32>,
    }

    impl DelayNs for RecordingDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.delays_ms.push(ns / 1_000_000);
        }

        async fn delay_ms(&mut self, ms: u32) {
            self.delays_ms.push(ms);
        }
    }

    /// Hands out [`MockBus`] instances and counts lifecycle calls.
    pub struct MockFactory {
        pub data: [u8; 2],
        pub write_reply: Reply,
        pub fail_create: bool,
        pub fail_attach: bool,
        pub created: usize,
        pub attached: usize,
        pub detached: usize,
        pub released: usize,
    }

    impl MockFactory {
        pub fn returning(data: [u8; 2]) -> Self {
            Self {
                data,
                write_reply: Reply::Ok,
                fail_create: false,
                fail_attach: false,
                created: 0,
                attached: 0,
                detached: 0,
                released: 0,
            }
        }
    }

    impl BusFactory for MockFactory {
        type Bus = MockBus;
        type Error = ErrorKind;

        fn create(&mut self, _config: &BusConfig) -> Result<MockBus, ErrorKind> {
            if self.fail_create {
                return Err(ErrorKind::Other);
            }
            self.created += 1;
            let mut bus = MockBus::returning(self.data);
            bus.write_reply = self.write_reply;
            Ok(bus)
        }

        fn attach(&mut self, _bus: &mut MockBus, _device: &DeviceConfig) -> Result<(), ErrorKind> {
            if self.fail_attach {
                return Err(ErrorKind::Other);
            }
            self.attached += 1;
            Ok(())
        }

        fn detach(&mut self, _bus: &mut MockBus, _device: &DeviceConfig) {
            self.detached += 1;
        }

        fn release(&mut self, _bus: MockBus) {
            self.released += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use embedded_hal::i2c::ErrorKind;

    use super::mock::{MockBus, RecordingDelay, Reply};
    use super::*;

    fn device(bus: MockBus) -> Device<MockBus> {
        Device::new(bus, DeviceConfig::default())
    }

    #[test]
    fn sends_selector_then_reads_after_settling() {
        let mut dev = device(MockBus::returning([0x02, 0x58]));
        let mut delay = RecordingDelay::default();
        let mut buf = [0u8; 2];

        block_on(dev.register_read(&mut delay, 0x0F, 0x10, &mut buf)).unwrap();

        assert_eq!(buf, [0x02, 0x58]);
        let (bus, _) = dev.into_bus();
        assert_eq!(bus.writes, [(0x36, std::vec![0x0F, 0x10])]);
        assert_eq!(bus.reads, [(0x36, 2)]);
        assert_eq!(delay.delays_ms, [25]);
    }

    #[test]
    fn failed_select_skips_read_phase() {
        let mut bus = MockBus::returning([0x00, 0x00]);
        bus.write_reply = Reply::Nack;
        let mut dev = device(bus);
        let mut delay = RecordingDelay::default();
        let mut buf = [0u8; 2];

        let err = block_on(dev.register_read(&mut delay, 0x0F, 0x10, &mut buf)).unwrap_err();

        assert!(matches!(err, SensorError::Bus(ErrorKind::NoAcknowledge(_))));
        let (bus, _) = dev.into_bus();
        assert!(bus.reads.is_empty());
        assert!(delay.delays_ms.is_empty());
    }

    #[test]
    fn stalled_read_times_out() {
        let mut bus = MockBus::returning([0x00, 0x00]);
        bus.read_reply = Reply::Stall;
        let mut dev = device(bus);
        let mut delay = RecordingDelay::default();
        let mut buf = [0u8; 2];

        let err = block_on(dev.register_read(&mut delay, 0x0F, 0x10, &mut buf)).unwrap_err();

        assert_eq!(err, SensorError::Timeout);
        assert_eq!(delay.delays_ms, [25, 1000]);
    }
}
