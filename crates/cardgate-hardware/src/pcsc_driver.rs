//! PC/SC backend.
//!
//! Implements [`CardDriver`] on top of the `pcsc` crate, which binds to
//! pcsclite on Linux/macOS and winscard on Windows. Enabled with the
//! `hardware-pcsc` feature.

use crate::{
    Result,
    error::DriverError,
    traits::{CardDriver, Protocols, ReaderFlags, ReaderState},
};
use std::ffi::CString;
use std::time::Duration;
use tracing::debug;

/// Driver talking to the system PC/SC service.
#[derive(Debug)]
pub struct PcscDriver {
    scope: pcsc::Scope,
}

impl PcscDriver {
    /// Driver establishing system-scoped contexts.
    pub fn new() -> Self {
        Self {
            scope: pcsc::Scope::System,
        }
    }
}

impl Default for PcscDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn map_error(error: pcsc::Error) -> DriverError {
    match error {
        pcsc::Error::NoService | pcsc::Error::ServiceStopped => DriverError::NoService,
        pcsc::Error::NoReadersAvailable => DriverError::NoReadersAvailable,
        pcsc::Error::Timeout => DriverError::Timeout,
        pcsc::Error::Cancelled => DriverError::Cancelled,
        pcsc::Error::NoSmartcard => DriverError::NoSmartCard,
        pcsc::Error::RemovedCard => DriverError::RemovedCard,
        pcsc::Error::InvalidHandle => DriverError::InvalidHandle,
        pcsc::Error::InvalidParameter | pcsc::Error::InvalidValue => {
            DriverError::invalid_parameter(error.to_string())
        }
        other => DriverError::communication(other.to_string()),
    }
}

fn reader_cstring(reader: &str) -> Result<CString> {
    CString::new(reader).map_err(|e| DriverError::invalid_parameter(format!("reader name: {e}")))
}

impl CardDriver for PcscDriver {
    type Context = pcsc::Context;
    type Card = pcsc::Card;

    fn establish_context(&mut self) -> Result<pcsc::Context> {
        pcsc::Context::establish(self.scope).map_err(map_error)
    }

    fn list_readers(&mut self, context: &pcsc::Context) -> Result<Vec<String>> {
        let len = context.list_readers_len().map_err(map_error)?;
        let mut buffer = vec![0u8; len];
        let names = context.list_readers(&mut buffer).map_err(map_error)?;
        Ok(names.map(|r| r.to_string_lossy().into_owned()).collect())
    }

    fn get_status_change(
        &mut self,
        context: &pcsc::Context,
        timeout: Duration,
        state: &mut ReaderState,
    ) -> Result<()> {
        let current = pcsc::State::from_bits_truncate(state.current_state.bits() as _);
        let mut states = [pcsc::ReaderState::new(reader_cstring(&state.name)?, current)];

        match context.get_status_change(timeout, &mut states) {
            Ok(()) => {}
            // Nothing changed relative to the caller's view within `timeout`.
            Err(pcsc::Error::Timeout) => {
                state.event_state = state.current_state;
                return Ok(());
            }
            Err(e) => return Err(map_error(e)),
        }

        state.event_state = ReaderFlags::from_bits(states[0].event_state().bits() as u32);
        state.atr = states[0].atr().to_vec();
        Ok(())
    }

    fn connect(
        &mut self,
        context: &pcsc::Context,
        reader: &str,
        protocols: Protocols,
    ) -> Result<pcsc::Card> {
        let preferred = pcsc::Protocols::from_bits_truncate(protocols.bits() as _);
        let card = context
            .connect(&reader_cstring(reader)?, pcsc::ShareMode::Shared, preferred)
            .map_err(map_error)?;
        debug!("Connected to card on {}", reader);
        Ok(card)
    }

    fn transmit(&mut self, card: &pcsc::Card, command: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
        let response = card.transmit(command, &mut buffer).map_err(map_error)?;
        Ok(response.to_vec())
    }

    fn disconnect(&mut self, card: pcsc::Card) -> Result<()> {
        card.disconnect(pcsc::Disposition::LeaveCard)
            .map_err(|(_card, e)| map_error(e))
    }

    fn release_context(&mut self, context: pcsc::Context) -> Result<()> {
        context.release().map_err(|(_context, e)| map_error(e))
    }
}
