//! Node startup.
//!
//! Brings the node up in dependency order: settings store, sensor bus,
//! wireless link, broker session. Failing to set up any of the first three
//! is fatal. The link outcome itself is not: the session is started either
//! way and keeps retrying in the background.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;

use crate::bus::BusFactory;
use crate::config::WifiCredentials;
use crate::error::StartupError;
use crate::fmt::Dbg;
use crate::link::{LinkOutcome, LinkSupervisor, WifiStation};
use crate::sensor::Stemma;
use crate::session::{SessionClient, SessionTransport};
use crate::settings::{SettingsStore, init_settings};

/// Startup error for a given store, bus factory and station.
pub type BootError<St, F, W> = StartupError<
    <St as SettingsStore>::Error,
    <F as BusFactory>::Error,
    <W as WifiStation>::Error,
>;

/// Runs the startup sequence and returns how the link came up.
///
/// Waits for the link with no timeout of its own; the supervisor's retry
/// budget bounds the wait.
pub async fn boot<St, F, D, W, T, M, const DEPTH: usize>(
    store: &mut St,
    sensor: &mut Stemma<F, D>,
    link: &LinkSupervisor<M, DEPTH>,
    station: &mut W,
    credentials: &WifiCredentials<'_>,
    session: &mut SessionClient<'_, T>,
) -> Result<LinkOutcome, BootError<St, F, W>>
where
    St: SettingsStore,
    F: BusFactory,
    D: DelayNs,
    W: WifiStation,
    T: SessionTransport,
    M: RawMutex,
{
    init_settings(store).map_err(StartupError::Settings)?;

    sensor.initialize().map_err(|e| {
        error!("boot: sensor bus setup failed: {:?}", Dbg(&e));
        StartupError::Sensor(e)
    })?;
    info!("boot: sensor ready");

    let outcome = link.establish(station, credentials).await.map_err(|e| {
        error!("boot: station setup failed: {:?}", Dbg(&e));
        StartupError::Link(e)
    })?;
    if !outcome.is_connected() {
        warn!("boot: continuing without a link");
    }

    session.start();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use core::net::Ipv4Addr;

    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embedded_hal::i2c::ErrorKind;

    use super::*;
    use crate::bus::mock::{MockFactory, RecordingDelay};
    use crate::config::MAX_LINK_RETRIES;
    use crate::error::{SettingsError, StoreError};
    use crate::link::LinkEvent;
    use crate::link::mock::MockStation;
    use crate::session::SessionState;
    use crate::session::mock::RecordingTransport;
    use crate::settings::mock::ScriptedStore;

    const ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 7);
    const CREDENTIALS: WifiCredentials<'static> = WifiCredentials {
        ssid: "garden",
        password: "hunter22",
    };

    struct Rig {
        store: ScriptedStore,
        sensor: Stemma<MockFactory, RecordingDelay>,
        link: LinkSupervisor<NoopRawMutex, 16>,
        station: MockStation,
        state: SessionState,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                store: ScriptedStore::default(),
                sensor: Stemma::new(MockFactory::returning([0, 0]), RecordingDelay::default()),
                link: LinkSupervisor::new(),
                station: MockStation::default(),
                state: SessionState::new(),
            }
        }

        fn post(&self, events: &[LinkEvent]) {
            for event in events {
                self.link.notify(*event).unwrap();
            }
        }

        fn boot(
            &mut self,
        ) -> (
            Result<LinkOutcome, BootError<ScriptedStore, MockFactory, MockStation>>,
            usize,
        ) {
            let mut session = SessionClient::new(&self.state, RecordingTransport::default());
            let result = block_on(boot(
                &mut self.store,
                &mut self.sensor,
                &self.link,
                &mut self.station,
                &CREDENTIALS,
                &mut session,
            ));
            (result, session.transport_mut().started)
        }
    }

    #[test]
    fn brings_everything_up_in_order() {
        let mut rig = Rig::new();
        rig.post(&[LinkEvent::StationStarted, LinkEvent::AddressAcquired(ADDRESS)]);

        let (result, started) = rig.boot();

        assert_eq!(result.unwrap(), LinkOutcome::Connected { address: ADDRESS });
        assert_eq!(rig.store.inits, 1);
        assert!(rig.sensor.is_initialized());
        assert!(rig.station.configured);
        assert_eq!(started, 1);
    }

    #[test]
    fn starts_session_even_when_link_fails() {
        let mut rig = Rig::new();
        rig.post(&[LinkEvent::StationStarted]);
        for _ in 0..=MAX_LINK_RETRIES {
            rig.post(&[LinkEvent::StationDisconnected { reason: 15 }]);
        }

        let (result, started) = rig.boot();

        assert_eq!(
            result.unwrap(),
            LinkOutcome::Failed {
                attempts: MAX_LINK_RETRIES
            }
        );
        assert_eq!(started, 1);
    }

    #[test]
    fn unusable_settings_stop_before_the_bus() {
        let mut rig = Rig::new();
        rig.store = ScriptedStore::new([Err(StoreError::Other(1))]);

        let (result, started) = rig.boot();

        assert!(matches!(
            result,
            Err(StartupError::Settings(SettingsError::Init(StoreError::Other(1))))
        ));
        assert!(!rig.sensor.is_initialized());
        assert!(!rig.station.configured);
        assert_eq!(started, 0);
    }

    #[test]
    fn bus_failure_is_fatal() {
        let mut rig = Rig::new();
        let mut factory = MockFactory::returning([0, 0]);
        factory.fail_create = true;
        rig.sensor = Stemma::new(factory, RecordingDelay::default());

        let (result, started) = rig.boot();

        assert!(matches!(result, Err(StartupError::Sensor(ErrorKind::Other))));
        assert!(!rig.station.configured);
        assert_eq!(started, 0);
    }

    #[test]
    fn station_failure_is_fatal() {
        let mut rig = Rig::new();
        rig.station.fail_start = true;

        let (result, started) = rig.boot();

        assert!(matches!(result, Err(StartupError::Link("radio off"))));
        assert_eq!(started, 0);
    }
}
