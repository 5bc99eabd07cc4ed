//! Session plugin contract
//!
//! Plugins attach to a session and observe its lifecycle, traffic, and
//! parameter changes; they can also steer the session back through the
//! [`PluginHost`] handed to every callback.
//!
//! # Capabilities
//!
//! Each plugin declares the callbacks it actually implements as a
//! [`PluginCaps`] bitset, built once at registration. The session consults
//! the bitset before dispatching, so a plugin that only wants `update()`
//! never pays for IMU traffic.
//!
//! # Calling back into the session
//!
//! Callbacks run while the session holds its plugin set. Writes requested
//! through the host (`set_frequency`, feedback, objectives) are therefore
//! queued and applied by the session after the dispatch round completes:
//! a plugin can never deadlock the session by steering it mid-callback, and
//! the resulting notifications reach *other* plugins as the
//! `*_changed_by_plugin` family.
//!
//! # Priority
//!
//! Priority is the registration index: the plugin factory yields plugins in
//! plugin-directory enumeration order (the loader's concern), and a lower
//! index runs first in every dispatch round, `update()` included.

use crate::protocol::{ImuRecord, OscillatorState};
use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

bitflags! {
    /// Which callbacks a plugin implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PluginCaps: u32 {
        const SESSION_STARTED    = 1 << 0;
        const SESSION_ENDED      = 1 << 1;
        const USER_JOINED        = 1 << 2;
        const USER_LEFT          = 1 << 3;
        const IMU_DATA           = 1 << 4;
        const OSCILLATOR_DATA    = 1 << 5;
        const FREQUENCY_CHANGED  = 1 << 6;
        const AMPLITUDE_CHANGED  = 1 << 7;
        const OFFSET_CHANGED     = 1 << 8;
        const PHASE_SHIFT_CHANGED = 1 << 9;
        const PLUGIN_CHANGES     = 1 << 10;
        const UPDATE             = 1 << 11;
    }
}

/// A host-visible session plugin. All callbacks default to no-ops; declare
/// the implemented ones in [`SessionPlugin::capabilities`].
#[allow(unused_variables)]
pub trait SessionPlugin: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> PluginCaps;

    fn session_started(&mut self, host: &mut PluginHost) {}

    fn session_ended(&mut self, host: &mut PluginHost) {}

    fn user_joined(&mut self, host: &mut PluginHost, slot: usize, name: &str) {}

    fn user_left(&mut self, host: &mut PluginHost, slot: usize, name: &str) {}

    fn imu_data(&mut self, host: &mut PluginHost, record: &ImuRecord) {}

    fn oscillator_data(&mut self, host: &mut PluginHost, index: usize, state: &OscillatorState) {}

    fn frequency_changed_by_user(&mut self, host: &mut PluginHost, slot: usize, value: f32) {}

    fn amplitude_changed_by_user(&mut self, host: &mut PluginHost, slot: usize, value: f32) {}

    fn offset_changed_by_user(&mut self, host: &mut PluginHost, slot: usize, value: f32) {}

    fn phase_shift_changed_by_user(&mut self, host: &mut PluginHost, slot: usize, value: f32) {}

    fn frequency_changed_by_plugin(&mut self, host: &mut PluginHost, origin: &str, value: f32) {}

    fn amplitude_changed_by_plugin(
        &mut self,
        host: &mut PluginHost,
        origin: &str,
        index: usize,
        value: f32,
    ) {
    }

    fn offset_changed_by_plugin(
        &mut self,
        host: &mut PluginHost,
        origin: &str,
        index: usize,
        value: f32,
    ) {
    }

    fn phase_shift_changed_by_plugin(
        &mut self,
        host: &mut PluginHost,
        origin: &str,
        index: usize,
        value: f32,
    ) {
    }

    /// One reconciliation tick (default 50 ms cadence), priority order.
    fn update(&mut self, host: &mut PluginHost) {}
}

/// Factory invoked once per new session; yields plugins in priority order.
pub type PluginFactory = Arc<dyn Fn() -> Vec<Box<dyn SessionPlugin>> + Send + Sync>;

// ============================================================================
// Host command queue
// ============================================================================

/// One queued plugin request against the session.
#[derive(Debug, Clone)]
pub(crate) enum HostOp {
    SetFrequency(f32),
    SetAmplitude(usize, f32),
    SetOffset(usize, f32),
    SetPhaseShift(usize, f32),
    Feedback {
        /// Target slot, or every controller when `None`
        slot: Option<usize>,
        message: String,
    },
    PublishObjectives(ObjectiveGroup),
}

/// The session surface a plugin steers through. Requests queue up and the
/// session applies them once the current dispatch round finishes.
pub struct PluginHost {
    ops: Vec<HostOp>,
}

impl PluginHost {
    pub(crate) fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub(crate) fn take_ops(&mut self) -> Vec<HostOp> {
        std::mem::take(&mut self.ops)
    }

    /// Set the session-wide frequency.
    pub fn set_frequency(&mut self, value: f32) {
        self.ops.push(HostOp::SetFrequency(value));
    }

    pub fn set_amplitude(&mut self, index: usize, value: f32) {
        self.ops.push(HostOp::SetAmplitude(index, value));
    }

    pub fn set_offset(&mut self, index: usize, value: f32) {
        self.ops.push(HostOp::SetOffset(index, value));
    }

    pub fn set_phase_shift(&mut self, index: usize, value: f32) {
        self.ops.push(HostOp::SetPhaseShift(index, value));
    }

    /// Send user-visible feedback to one controller, or to all of them.
    pub fn feedback(&mut self, slot: Option<usize>, message: impl Into<String>) {
        self.ops.push(HostOp::Feedback {
            slot,
            message: message.into(),
        });
    }

    /// Publish (or republish) an objective group to the session.
    pub fn publish_objectives(&mut self, group: ObjectiveGroup) {
        self.ops.push(HostOp::PublishObjectives(group));
    }
}

// ============================================================================
// Objectives
// ============================================================================

/// A single plugin-defined goal. Completion is monotone: once reached it
/// stays reached for the life of the session.
#[derive(Debug)]
pub struct Objective {
    title: String,
    description: Option<String>,
    completed: AtomicBool,
}

impl Objective {
    pub fn new(title: impl Into<String>, description: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            title: title.into(),
            description,
            completed: AtomicBool::new(false),
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Mark reached. There is no way back.
    pub fn complete(&self) {
        self.completed.store(true, Ordering::Relaxed);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }
}

/// A titled set of objectives, shared between the publishing plugin and the
/// session's controllers.
#[derive(Debug, Clone)]
pub struct ObjectiveGroup {
    pub title: String,
    pub description: Option<String>,
    pub objectives: Vec<Arc<Objective>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objective_completion_is_monotone() {
        let objective = Objective::new("Synchronize phases", None);
        assert!(!objective.is_completed());
        objective.complete();
        objective.complete();
        assert!(objective.is_completed());
    }

    #[test]
    fn test_host_queues_ops() {
        let mut host = PluginHost::new();
        host.set_frequency(1.5);
        host.feedback(Some(2), "well done");
        let ops = host.take_ops();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], HostOp::SetFrequency(v) if v == 1.5));
        assert!(host.take_ops().is_empty());
    }
}
