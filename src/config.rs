//! # Node Configuration
//!
//! Fixed hardware parameters, timing constants and the borrowed credential
//! structures handed in by the firmware at startup.
//!
//! The timing values were tuned against the real sensor and broker and are
//! part of the node's behaviour: changing them changes what ends up on the
//! wire.

use embassy_time::Duration;
use embedded_hal::i2c::SevenBitAddress;

use crate::error::UriError;

/// I2C address of the STEMMA soil sensor.
pub const SENSOR_ADDRESS: SevenBitAddress = 0x36;
/// Base register of the moisture (touch) module.
pub const MOISTURE_BASE_REG: u8 = 0x0F;
/// Function register selecting the moisture channel.
pub const MOISTURE_FUNC_REG: u8 = 0x10;

/// GPIO used for the I2C data line.
pub const I2C_SDA_PIN: u8 = 21;
/// GPIO used for the I2C clock line.
pub const I2C_SCL_PIN: u8 = 22;
/// Bus clock in Hz.
pub const I2C_FREQ_HZ: u32 = 100_000;
/// Glitch filter length in APB clock cycles.
pub const I2C_GLITCH_IGNORE_COUNT: u8 = 7;

/// Time the sensor needs between the register select and the data read.
pub const SETTLE_DELAY_MS: u32 = 25;
/// Upper bound for each phase of a bus transaction.
pub const TRANSACTION_TIMEOUT_MS: u32 = 1000;

/// Station reconnect attempts before the link is declared failed.
pub const MAX_LINK_RETRIES: u8 = 5;

/// Delay between two samples.
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Topic every reading is published to.
pub const MOISTURE_TOPIC: &str = "/topic/soil-moisture";

/// Default MQTT port for `mqtt://` URIs without an explicit port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Physical bus setup applied when the bus is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusConfig {
    /// Controller port number.
    pub port: u8,
    pub sda_pin: u8,
    pub scl_pin: u8,
    pub glitch_ignore_count: u8,
    pub internal_pullup: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: 0,
            sda_pin: I2C_SDA_PIN,
            scl_pin: I2C_SCL_PIN,
            glitch_ignore_count: I2C_GLITCH_IGNORE_COUNT,
            internal_pullup: true,
        }
    }
}

/// A peer attached to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceConfig {
    /// 7-bit device address.
    pub address: SevenBitAddress,
    /// Clock used when talking to this device.
    pub scl_speed_hz: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: SENSOR_ADDRESS,
            scl_speed_hz: I2C_FREQ_HZ,
        }
    }
}

/// Credentials of the wireless network the station joins.
#[derive(Debug, Clone, Copy)]
pub struct WifiCredentials<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
}

/// Everything needed to open the broker session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig<'a> {
    /// Broker address, e.g. `mqtt://192.168.1.10:1883`.
    pub broker_uri: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub client_id: &'a str,
    /// Keep-alive interval announced in CONNECT.
    pub keep_alive_secs: u16,
    /// Read timeout on the broker socket. An idle timeout triggers a PINGREQ,
    /// so it must stay below the keep-alive interval.
    pub network_timeout: Duration,
    /// Pause before reconnecting after the connection is lost.
    pub reconnect_delay: Duration,
}

impl<'a> SessionConfig<'a> {
    /// Creates a configuration with the default client id and timings.
    pub fn new(broker_uri: &'a str) -> Self {
        Self {
            broker_uri,
            username: None,
            password: None,
            client_id: "myrtio-soil",
            keep_alive_secs: 120,
            network_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(10),
        }
    }

    /// Sets the username and password sent in CONNECT.
    pub fn with_credentials(mut self, username: &'a str, password: &'a str) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }
}

/// A parsed `mqtt://host[:port]` broker address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BrokerUri<'a> {
    pub host: &'a str,
    pub port: u16,
}

impl<'a> BrokerUri<'a> {
    /// Parses a broker URI. Only plain TCP (`mqtt://`) is supported.
    pub fn parse(uri: &'a str) -> Result<Self, UriError> {
        let (scheme, rest) = uri.split_once("://").ok_or(UriError::MissingScheme)?;
        if scheme != "mqtt" && scheme != "tcp" {
            return Err(UriError::UnsupportedScheme);
        }

        // Anything after the authority (a path) is ignored.
        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| UriError::InvalidPort)?,
            ),
            None => (authority, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() {
            return Err(UriError::MissingHost);
        }
        if port == 0 {
            return Err(UriError::InvalidPort);
        }
        Ok(Self { host, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let uri = BrokerUri::parse("mqtt://192.168.1.10:1884").unwrap();
        assert_eq!(uri.host, "192.168.1.10");
        assert_eq!(uri.port, 1884);
    }

    #[test]
    fn falls_back_to_default_port() {
        let uri = BrokerUri::parse("mqtt://broker.local").unwrap();
        assert_eq!(uri.host, "broker.local");
        assert_eq!(uri.port, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn rejects_tls_and_garbage() {
        assert_eq!(
            BrokerUri::parse("mqtts://broker.local"),
            Err(UriError::UnsupportedScheme)
        );
        assert_eq!(BrokerUri::parse("broker.local"), Err(UriError::MissingScheme));
        assert_eq!(BrokerUri::parse("mqtt://:1883"), Err(UriError::MissingHost));
        assert_eq!(
            BrokerUri::parse("mqtt://broker:http"),
            Err(UriError::InvalidPort)
        );
    }

    #[test]
    fn defaults_match_the_wiring() {
        let bus = BusConfig::default();
        assert_eq!((bus.sda_pin, bus.scl_pin), (21, 22));
        assert!(bus.internal_pullup);
        assert_eq!(bus.glitch_ignore_count, 7);

        let device = DeviceConfig::default();
        assert_eq!(device.address, 0x36);
        assert_eq!(device.scl_speed_hz, 100_000);
    }
}
