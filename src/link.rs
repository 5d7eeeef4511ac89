//! # Link Supervisor
//!
//! Supervises the wireless station association.
//!
//! The radio driver reports what happens on its own execution context by
//! posting [`LinkEvent`]s into the supervisor's queue. The supervisor folds
//! them into its state machine:
//!
//! ```text
//! Idle --start--> Connecting --address--> Connected
//!                  |    ^                    |
//!                  |    +--disconnect (n<max)+
//!                  +--disconnect (n=max)--> Failed
//! ```
//!
//! Each supervision episode ends in exactly one [`LinkOutcome`], delivered
//! through a one-shot signal. The retry counter goes back to zero only when
//! an address is acquired.

use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::channel::{Channel, Sender};
use embassy_sync::signal::Signal;

use crate::config::{MAX_LINK_RETRIES, WifiCredentials};
use crate::fmt::Dbg;

/// Queue depth of the supervisor used by firmware.
pub const LINK_EVENT_DEPTH: usize = 8;

/// Supervisor shared between the radio event context and the control task.
pub type SharedLinkSupervisor = LinkSupervisor<CriticalSectionRawMutex, LINK_EVENT_DEPTH>;

/// The radio driver in station mode.
pub trait WifiStation {
    /// Driver error.
    type Error: core::fmt::Debug;

    /// Applies the network credentials.
    fn configure(&mut self, credentials: &WifiCredentials<'_>) -> Result<(), Self::Error>;

    /// Starts the station. The driver answers with [`LinkEvent::StationStarted`].
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Begins one association attempt. The driver answers with either
    /// [`LinkEvent::AddressAcquired`] or [`LinkEvent::StationDisconnected`].
    fn connect(&mut self) -> Result<(), Self::Error>;
}

/// Notification from the radio driver or the IP stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    StationStarted,
    /// The association was lost or could not be made.
    StationDisconnected { reason: u8 },
    /// DHCP handed out an address.
    AddressAcquired(#[cfg_attr(feature = "defmt", defmt(Debug2Format))] Ipv4Addr),
}

/// Where the state machine currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LinkState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

impl LinkState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// Terminal result of a supervision episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkOutcome {
    /// The station is associated and holds `address`.
    Connected {
        #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
        address: Ipv4Addr,
    },
    /// The retry budget ran out after `attempts` reconnects.
    Failed { attempts: u8 },
}

impl LinkOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Bounded-retry station supervisor.
pub struct LinkSupervisor<M: RawMutex, const DEPTH: usize> {
    events: Channel<M, LinkEvent, DEPTH>,
    outcome: Signal<M, LinkOutcome>,
    state: AtomicU8,
    retries: AtomicU8,
    max_retries: u8,
}

impl<M: RawMutex, const DEPTH: usize> LinkSupervisor<M, DEPTH> {
    /// Creates a supervisor that gives up after five reconnects.
    pub const fn new() -> Self {
        Self::with_max_retries(MAX_LINK_RETRIES)
    }

    pub const fn with_max_retries(max_retries: u8) -> Self {
        Self {
            events: Channel::new(),
            outcome: Signal::new(),
            state: AtomicU8::new(LinkState::Idle as u8),
            retries: AtomicU8::new(0),
            max_retries,
        }
    }

    /// Posts an event from the driver's context without waiting.
    ///
    /// Hands the event back when the queue is full.
    pub fn notify(&self, event: LinkEvent) -> Result<(), LinkEvent> {
        self.events.try_send(event).map_err(|e| match e {
            embassy_sync::channel::TrySendError::Full(event) => event,
        })
    }

    /// A sender for drivers that post from async code.
    pub fn sender(&self) -> Sender<'_, M, LinkEvent, DEPTH> {
        self.events.sender()
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Reconnects spent since the last acquired address.
    pub fn retries(&self) -> u8 {
        self.retries.load(Ordering::Acquire)
    }

    /// Configures and starts the station.
    pub fn start<W: WifiStation>(
        &self,
        station: &mut W,
        credentials: &WifiCredentials<'_>,
    ) -> Result<(), W::Error> {
        station.configure(credentials)?;
        station.start()?;
        info!("link: station started, joining '{}'", credentials.ssid);
        Ok(())
    }

    /// Starts the station and waits until it is either connected or out of
    /// retries. There is no timeout: the wait is bounded by the retry budget.
    pub async fn establish<W: WifiStation>(
        &self,
        station: &mut W,
        credentials: &WifiCredentials<'_>,
    ) -> Result<LinkOutcome, W::Error> {
        self.start(station, credentials)?;

        loop {
            let event = self.events.receive().await;
            if let Some(outcome) = self.handle_event(event, station) {
                self.outcome.signal(outcome);
                match outcome {
                    LinkOutcome::Connected { .. } => {
                        info!("link: connected to ap SSID: {}", credentials.ssid)
                    }
                    LinkOutcome::Failed { .. } => {
                        warn!("link: failed to connect to SSID: {}", credentials.ssid)
                    }
                }
                return Ok(outcome);
            }
        }
    }

    /// Keeps folding driver events for the rest of the process lifetime.
    ///
    /// Every later episode (a drop after being connected) resolves the
    /// outcome signal again.
    pub async fn supervise<W: WifiStation>(&self, station: &mut W) -> ! {
        loop {
            let event = self.events.receive().await;
            if let Some(outcome) = self.handle_event(event, station) {
                self.outcome.signal(outcome);
            }
        }
    }

    /// Waits for the next episode outcome.
    pub async fn wait(&self) -> LinkOutcome {
        self.outcome.wait().await
    }

    /// Applies one event and returns the outcome if it ends an episode.
    pub fn handle_event<W: WifiStation>(
        &self,
        event: LinkEvent,
        station: &mut W,
    ) -> Option<LinkOutcome> {
        match event {
            LinkEvent::StationStarted => {
                self.set_state(LinkState::Connecting);
                self.connect(station);
                None
            }
            LinkEvent::StationDisconnected { reason } => {
                if self.state() == LinkState::Failed {
                    debug!("link: disconnect (reason {}) after giving up, ignored", reason);
                    return None;
                }

                let retries = self.retries();
                if retries < self.max_retries {
                    self.retries.store(retries + 1, Ordering::Release);
                    self.set_state(LinkState::Connecting);
                    self.connect(station);
                    info!(
                        "link: retry {}/{} to connect to the AP (reason {})",
                        retries + 1,
                        self.max_retries,
                        reason
                    );
                    None
                } else {
                    self.set_state(LinkState::Failed);
                    warn!("link: connect to the AP failed after {} retries", retries);
                    Some(LinkOutcome::Failed { attempts: retries })
                }
            }
            LinkEvent::AddressAcquired(address) => {
                self.retries.store(0, Ordering::Release);
                let previous = self.state.swap(LinkState::Connected as u8, Ordering::AcqRel);
                info!("link: got ip: {:?}", Dbg(&address));
                if previous == LinkState::Connected as u8 {
                    None
                } else {
                    Some(LinkOutcome::Connected { address })
                }
            }
        }
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn connect<W: WifiStation>(&self, station: &mut W) {
        if let Err(e) = station.connect() {
            warn!("link: connect request failed: {:?}", Dbg(&e));
        }
    }
}

impl<M: RawMutex, const DEPTH: usize> Default for LinkSupervisor<M, DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}
