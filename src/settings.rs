//! Persistent settings storage bring-up.
//!
//! The wireless stack keeps calibration and credentials in a flash
//! partition that must be usable before anything else starts. A partition
//! that is full or was written by a newer layout is wiped and initialised
//! again; any other failure is fatal.

use crate::error::{SettingsError, StoreError};
use crate::fmt::Dbg;

/// The platform's key-value partition.
pub trait SettingsStore {
    type Error: core::fmt::Debug;

    /// Opens the partition.
    fn init(&mut self) -> Result<(), StoreError<Self::Error>>;

    /// Erases the whole partition.
    fn erase(&mut self) -> Result<(), Self::Error>;
}

/// Brings the store up, erasing it once if its contents are unusable.
pub fn init_settings<S: SettingsStore>(store: &mut S) -> Result<(), SettingsError<S::Error>> {
    match store.init() {
        Ok(()) => Ok(()),
        Err(StoreError::NoFreePages | StoreError::NewVersionFound) => {
            warn!("settings: partition unusable, erasing");
            store.erase().map_err(SettingsError::Erase)?;
            store.init().map_err(SettingsError::Init)
        }
        Err(e) => {
            error!("settings: init failed: {:?}", Dbg(&e));
            Err(SettingsError::Init(e))
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;

    use super::*;

    /// Replays `init` results and counts erases.
    #[derive(Default)]
    pub struct ScriptedStore {
        pub init_results: VecDeque<Result<(), StoreError<u8>>>,
        pub erase_result: Option<u8>,
        pub inits: usize,
        pub erases: usize,
    }

    impl ScriptedStore {
        pub fn new(init_results: impl IntoIterator<Item = Result<(), StoreError<u8>>>) -> Self {
            Self {
                init_results: init_results.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl SettingsStore for ScriptedStore {
        type Error = u8;

        fn init(&mut self) -> Result<(), StoreError<u8>> {
            self.inits += 1;
            self.init_results.pop_front().unwrap_or(Ok(()))
        }

        fn erase(&mut self) -> Result<(), u8> {
            self.erases += 1;
            self.erase_result.map_or(Ok(()), Err)
        }
    }
}
