//! # Control Loop
//!
//! Samples the sensor once per [`SAMPLE_PERIOD`] and publishes each good
//! reading while the broker session is up.
//!
//! Nothing in a cycle can stop the loop. A failed read skips that cycle,
//! a disconnected session skips the publish, and a refused publish is only
//! logged. The next cycle starts on schedule either way.

use core::fmt::Write;

use embassy_time::Timer;
use heapless::String;

use crate::config::{MOISTURE_TOPIC, SAMPLE_PERIOD};
use crate::error::PublishError;
use crate::fmt::Dbg;
use crate::mqtt::QoS;
use crate::sensor::MoistureSensor;
use crate::session::{MessageId, SessionClient, SessionTransport};

/// Longest decimal rendering of a `u16`.
const PAYLOAD_LEN: usize = 5;

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Cycle {
    /// The sensor read failed.
    ReadFailed,
    /// Read `value`, but the session was down.
    Skipped { value: u16 },
    /// Read `value` and the transport accepted it.
    Published { value: u16, message_id: MessageId },
    /// Read `value` and the transport refused it.
    PublishFailed { value: u16, error: PublishError },
}

/// Renders a reading the way it goes on the wire: plain decimal ASCII.
pub fn format_reading(value: u16) -> String<PAYLOAD_LEN> {
    let mut payload = String::new();
    if write!(payload, "{}", value).is_err() {
        error!("monitor: reading {} does not fit the payload buffer", value);
    }
    payload
}

/// The periodic sampler.
pub struct SoilMonitor<'s, S, T> {
    sensor: S,
    session: SessionClient<'s, T>,
    topic: &'s str,
}

impl<'s, S, T> SoilMonitor<'s, S, T>
where
    S: MoistureSensor,
    T: SessionTransport,
{
    /// Publishes to the default moisture topic.
    pub fn new(sensor: S, session: SessionClient<'s, T>) -> Self {
        Self::with_topic(sensor, session, MOISTURE_TOPIC)
    }

    pub fn with_topic(sensor: S, session: SessionClient<'s, T>, topic: &'s str) -> Self {
        Self {
            sensor,
            session,
            topic,
        }
    }

    /// Runs a single cycle.
    pub async fn tick(&mut self) -> Cycle {
        let value = match self.sensor.read_moisture().await {
            Ok(value) => value,
            Err(e) => {
                warn!("monitor: sensor read failed: {:?}", Dbg(&e));
                return Cycle::ReadFailed;
            }
        };
        info!("monitor: moisture {}", value);

        if !self.session.is_connected() {
            debug!("monitor: session down, not publishing");
            return Cycle::Skipped { value };
        }

        let payload = format_reading(value);
        match self
            .session
            .publish(self.topic, payload.as_bytes(), QoS::AtMostOnce, false)
        {
            Ok(message_id) => {
                info!("monitor: published {}, msg_id={}", payload.as_str(), message_id);
                Cycle::Published { value, message_id }
            }
            Err(error) => {
                warn!("monitor: publish failed ({}): {:?}", error.code(), error);
                Cycle::PublishFailed { value, error }
            }
        }
    }

    /// Runs cycles forever, one every [`SAMPLE_PERIOD`].
    pub async fn run(&mut self) -> ! {
        loop {
            self.tick().await;
            Timer::after(SAMPLE_PERIOD).await;
        }
    }

    /// Gives the parts back.
    pub fn into_parts(self) -> (S, SessionClient<'s, T>) {
        (self.sensor, self.session)
    }
}
