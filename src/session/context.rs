//! Controller context
//!
//! The handle an admitted user holds. A context names exactly one oscillator
//! slot; the session owns the contexts (keyed by slot) and a context reaches
//! back through a weak reference, so dropping a session never leaves a
//! dangling controller.

use super::session::Session;
use crate::error::{Error, Result};
use crate::events::Signal;
use std::sync::{Arc, Weak};

/// Events a controller frontend subscribes to.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// The set of connected users changed
    PlayerListUpdated(Vec<String>),
    /// A parameter visible to this controller was changed elsewhere
    /// (global frequency, or a plugin write)
    ParamsUpdatedExternally,
    /// Another controller or a plugin changed a phase relation
    RelationChanged,
    /// User-visible feedback text from a plugin
    Feedback(String),
    /// The session's published objective groups changed
    ObjectivesUpdated,
}

pub struct ControllerContext {
    session: Weak<Session>,
    slot: usize,
    display_name: String,
    events: Signal<ControllerEvent>,
}

impl ControllerContext {
    pub(crate) fn new(session: Weak<Session>, slot: usize, display_name: &str) -> Self {
        Self {
            session,
            slot,
            display_name: display_name.to_string(),
            events: Signal::new(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn events(&self) -> &Signal<ControllerEvent> {
        &self.events
    }

    pub(crate) fn emit(&self, event: ControllerEvent) {
        self.events.emit(&event);
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session.upgrade().ok_or(Error::SessionClosed)
    }

    /// Set the session-wide frequency (broadcast to every oscillator).
    pub fn set_frequency(&self, value: f32) -> Result<()> {
        self.session()?.user_set_frequency(self.slot, value);
        Ok(())
    }

    /// Set this slot's amplitude.
    pub fn set_amplitude(&self, value: f32) -> Result<()> {
        self.session()?
            .user_set_param(self.slot, super::session::ParamField::Amplitude, value);
        Ok(())
    }

    /// Set this slot's offset.
    pub fn set_offset(&self, value: f32) -> Result<()> {
        self.session()?
            .user_set_param(self.slot, super::session::ParamField::Offset, value);
        Ok(())
    }

    /// Set this slot's phase shift.
    pub fn set_phase_shift(&self, value: f32) -> Result<()> {
        self.session()?
            .user_set_param(self.slot, super::session::ParamField::PhaseShift, value);
        Ok(())
    }

    /// Return this slot's oscillator to the defaults (and the shared
    /// frequency to zero).
    pub fn reset(&self) -> Result<()> {
        let session = self.session()?;
        session.user_set_frequency(self.slot, 0.0);
        session.user_set_param(self.slot, super::session::ParamField::Amplitude, 0.0);
        session.user_set_param(
            self.slot,
            super::session::ParamField::Offset,
            crate::protocol::packets::DEFAULT_OFFSET,
        );
        session.user_set_param(self.slot, super::session::ParamField::PhaseShift, 0.0);
        Ok(())
    }

    /// Leave the session, returning the slot to the pool.
    pub fn leave(&self) {
        if let Some(session) = self.session.upgrade() {
            session.release(self.slot);
        }
    }
}
