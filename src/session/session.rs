//! Session
//!
//! One session per device identifier. The session arbitrates concurrent
//! controllers (one oscillator slot each), holds the authoritative parameter
//! snapshot, hosts the plugin set, and re-asserts its snapshot to the device
//! on a fixed cadence so bursty edits and lost datagrams cost nothing.
//!
//! # Locking
//!
//! Two locks, never held together across a callback boundary:
//!
//! - `inner` guards users, the slot pool, parameters, and the device binding;
//! - `plugins` guards the plugin set during dispatch.
//!
//! Plugin callbacks run under the plugin lock only; anything they ask of the
//! session is queued on their [`PluginHost`] and applied afterwards.
//! Controller notifications are emitted after `inner` is released, so a
//! frontend handler may call straight back into the session.

use super::context::{ControllerContext, ControllerEvent};
use super::manager::SessionManager;
use crate::device::{DeviceEvent, FusedDevice};
use crate::error::{Error, Result};
use crate::events::Subscription;
use crate::plugins::{HostOp, ObjectiveGroup, PluginCaps, PluginHost, SessionPlugin};
use crate::protocol::{HostCommand, OscillatorParams};
use crate::sink::EventSink;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Plugin writes may trigger further plugin writes; chains longer than this
/// are cut (a plugin ping-ponging values would otherwise never converge).
const MAX_PLUGIN_CHAIN: usize = 4;

/// The per-oscillator parameters a single slot owner may set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamField {
    Amplitude,
    Offset,
    PhaseShift,
}

enum Origin {
    User(usize),
    Plugin { index: usize, name: String },
}

struct PluginEntry {
    name: String,
    caps: PluginCaps,
    plugin: Box<dyn SessionPlugin>,
}

struct ReconTask {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct SessionInner {
    device: Option<Arc<FusedDevice>>,
    device_watch: Option<Subscription>,
    params: Vec<OscillatorParams>,
    arm_hues: Vec<u16>,
    slot_pool: BinaryHeap<Reverse<usize>>,
    users: BTreeMap<usize, Arc<ControllerContext>>,
    objectives: Vec<ObjectiveGroup>,
    last_time: u32,
    closed: bool,
}

pub struct Session {
    identifier: String,
    reconcile_interval: Duration,
    sink: Arc<dyn EventSink>,
    manager: Option<Weak<SessionManager>>,
    inner: Mutex<SessionInner>,
    plugins: Mutex<Vec<PluginEntry>>,
    recon: Mutex<Option<ReconTask>>,
}

impl Session {
    /// Create a session, optionally binding it to a device right away.
    /// Plugins arrive in priority order (index = priority, lower first).
    pub fn new(
        identifier: &str,
        plugins: Vec<Box<dyn SessionPlugin>>,
        device: Option<Arc<FusedDevice>>,
        sink: Arc<dyn EventSink>,
        manager: Option<Weak<SessionManager>>,
        reconcile_interval: Duration,
    ) -> Arc<Self> {
        let entries = plugins
            .into_iter()
            .map(|plugin| PluginEntry {
                name: plugin.name().to_string(),
                caps: plugin.capabilities(),
                plugin,
            })
            .collect();

        let session = Arc::new(Self {
            identifier: identifier.to_string(),
            reconcile_interval,
            sink,
            manager,
            inner: Mutex::new(SessionInner {
                device: None,
                device_watch: None,
                params: Vec::new(),
                arm_hues: Vec::new(),
                slot_pool: BinaryHeap::new(),
                users: BTreeMap::new(),
                objectives: Vec::new(),
                last_time: 0,
                closed: false,
            }),
            plugins: Mutex::new(entries),
            recon: Mutex::new(None),
        });

        session
            .sink
            .line(&format!("Session {:?} created", identifier));
        session.dispatch_plugins(PluginCaps::SESSION_STARTED, 0, |plugin, host| {
            plugin.session_started(host)
        });
        if let Some(device) = device {
            session.attach(device);
        }
        session
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    // ========================================================================
    // Device binding
    // ========================================================================

    /// Bind (or re-bind) to a fused device: grow the parameter table, rebuild
    /// the free-slot pool, re-assert host state, resume the device clock, and
    /// start reconciliation. Existing controllers keep their slots.
    pub fn attach(self: &Arc<Self>, device: Arc<FusedDevice>) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            let count = device.oscillator_count() as usize;
            if count > inner.params.len() {
                inner.params.resize_with(count, OscillatorParams::default);
            }
            let pool: BinaryHeap<Reverse<usize>> = (0..count)
                .filter(|slot| !inner.users.contains_key(slot))
                .map(Reverse)
                .collect();
            inner.slot_pool = pool;
            inner.arm_hues = device.arm_hues();

            for index in 0..count {
                device.send(&HostCommand::UpdateOscillator {
                    index: index as u8,
                    params: inner.params[index],
                });
            }
            device.send(&HostCommand::SessionStart(inner.last_time));

            let weak: Weak<Session> = Arc::downgrade(self);
            inner.device_watch = Some(device.events().connect(move |event| {
                if let Some(session) = weak.upgrade() {
                    session.on_device_event(event);
                }
            }));
            inner.device = Some(device);
        }
        self.start_reconciliation();
        self.sink
            .line(&format!("Session {:?} bound to device", self.identifier));
    }

    /// Drop the device binding; parameters and users are retained so a later
    /// re-bind is seamless.
    pub fn detach(&self) {
        self.stop_reconciliation();
        let mut inner = self.inner.lock();
        inner.device_watch = None;
        if inner.device.take().is_some() {
            self.sink
                .line(&format!("Session {:?} lost its device", self.identifier));
        }
    }

    pub fn is_bound(&self) -> bool {
        self.inner.lock().device.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn has_room(&self) -> bool {
        let inner = self.inner.lock();
        !inner.closed && !inner.slot_pool.is_empty()
    }

    pub fn free_slots(&self) -> usize {
        self.inner.lock().slot_pool.len()
    }

    pub fn oscillator_params(&self) -> Vec<OscillatorParams> {
        self.inner.lock().params.clone()
    }

    pub fn arm_hues(&self) -> Vec<u16> {
        self.inner.lock().arm_hues.clone()
    }

    pub fn user_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .users
            .values()
            .map(|context| context.display_name().to_string())
            .collect()
    }

    pub fn objectives(&self) -> Vec<ObjectiveGroup> {
        self.inner.lock().objectives.clone()
    }

    fn on_device_event(self: &Arc<Self>, event: &DeviceEvent) {
        match event {
            DeviceEvent::Time(time) => {
                self.inner.lock().last_time = *time;
            }
            DeviceEvent::Oscillation { index, state } => {
                let index = *index as usize;
                self.dispatch_plugins(PluginCaps::OSCILLATOR_DATA, 0, |plugin, host| {
                    plugin.oscillator_data(host, index, state)
                });
            }
            DeviceEvent::Imu(record) => {
                self.dispatch_plugins(PluginCaps::IMU_DATA, 0, |plugin, host| {
                    plugin.imu_data(host, record)
                });
            }
            DeviceEvent::LockChanged(_) => self.notify_manager(),
            DeviceEvent::Unknown(bytes) => {
                log::trace!(
                    "Session {:?}: {} unrecognized bytes from device",
                    self.identifier,
                    bytes.len()
                );
            }
        }
    }

    // ========================================================================
    // Controller admission and departure
    // ========================================================================

    /// Admit a controller: lowest free slot wins.
    pub fn create_context(self: &Arc<Self>, user_name: &str) -> Result<Arc<ControllerContext>> {
        let (context, slot, listeners, roster) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::SessionClosed);
            }
            let Some(Reverse(slot)) = inner.slot_pool.pop() else {
                return Err(Error::SessionFull);
            };
            let context = Arc::new(ControllerContext::new(
                Arc::downgrade(self),
                slot,
                user_name,
            ));
            inner.users.insert(slot, Arc::clone(&context));
            let roster: Vec<String> = inner
                .users
                .values()
                .map(|c| c.display_name().to_string())
                .collect();
            let listeners: Vec<Arc<ControllerContext>> = inner.users.values().cloned().collect();
            (context, slot, listeners, roster)
        };

        self.sink.line(&format!(
            "Session {:?}: {:?} joined on slot {}",
            self.identifier, user_name, slot
        ));
        for listener in listeners {
            listener.emit(ControllerEvent::PlayerListUpdated(roster.clone()));
        }
        let name = user_name.to_string();
        self.dispatch_plugins(PluginCaps::USER_JOINED, 0, |plugin, host| {
            plugin.user_joined(host, slot, &name)
        });
        Ok(context)
    }

    /// Controller departure: return the slot, tell everyone, and tear the
    /// session down when the last user leaves.
    pub fn release(self: &Arc<Self>, slot: usize) {
        let (context, listeners, roster, now_empty) = {
            let mut inner = self.inner.lock();
            let Some(context) = inner.users.remove(&slot) else {
                return;
            };
            inner.slot_pool.push(Reverse(slot));
            let roster: Vec<String> = inner
                .users
                .values()
                .map(|c| c.display_name().to_string())
                .collect();
            let listeners: Vec<Arc<ControllerContext>> = inner.users.values().cloned().collect();
            let now_empty = inner.users.is_empty();
            (context, listeners, roster, now_empty)
        };

        self.sink.line(&format!(
            "Session {:?}: {:?} left slot {}",
            self.identifier,
            context.display_name(),
            slot
        ));
        let name = context.display_name().to_string();
        self.dispatch_plugins(PluginCaps::USER_LEFT, 0, |plugin, host| {
            plugin.user_left(host, slot, &name)
        });
        for listener in listeners {
            listener.emit(ControllerEvent::PlayerListUpdated(roster.clone()));
        }
        if now_empty {
            self.close();
        }
        self.notify_manager();
    }

    // ========================================================================
    // Parameter authority
    // ========================================================================

    /// Frequency is uniform across the whole device: any slot's write lands
    /// in every oscillator and every *other* controller hears about it.
    pub(crate) fn user_set_frequency(self: &Arc<Self>, slot: usize, value: f32) {
        self.write_frequency(value, Origin::User(slot), 0);
    }

    pub(crate) fn user_set_param(self: &Arc<Self>, slot: usize, field: ParamField, value: f32) {
        self.write_param(slot, field, value, Origin::User(slot), 0);
    }

    fn write_frequency(self: &Arc<Self>, value: f32, origin: Origin, depth: usize) {
        let listeners = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.params.iter().all(|p| p.frequency == value) {
                return;
            }
            for params in inner.params.iter_mut() {
                params.frequency = value;
            }
            self.external_listeners(&inner, &origin)
        };
        for listener in listeners {
            listener.emit(ControllerEvent::ParamsUpdatedExternally);
        }
        match origin {
            Origin::User(slot) => {
                self.dispatch_plugins(PluginCaps::FREQUENCY_CHANGED, depth, |plugin, host| {
                    plugin.frequency_changed_by_user(host, slot, value)
                });
            }
            Origin::Plugin { index, name } => {
                self.dispatch_plugins_except(index, PluginCaps::PLUGIN_CHANGES, depth, |plugin, host| {
                    plugin.frequency_changed_by_plugin(host, &name, value)
                });
            }
        }
    }

    fn write_param(
        self: &Arc<Self>,
        index: usize,
        field: ParamField,
        value: f32,
        origin: Origin,
        depth: usize,
    ) {
        let listeners = {
            let mut inner = self.inner.lock();
            if inner.closed || index >= inner.params.len() {
                return;
            }
            let params = &mut inner.params[index];
            let current = match field {
                ParamField::Amplitude => &mut params.amplitude,
                ParamField::Offset => &mut params.offset,
                ParamField::PhaseShift => &mut params.phase_shift,
            };
            if *current == value {
                return;
            }
            *current = value;

            // Amplitude and offset are private to the slot owner when the
            // owner wrote them; phase shift always concerns the other
            // controllers (it changes a relation), and any plugin write is
            // externally visible.
            match (&origin, field) {
                (Origin::User(_), ParamField::PhaseShift) => {
                    self.external_listeners(&inner, &origin)
                }
                (Origin::User(_), _) => Vec::new(),
                (Origin::Plugin { .. }, _) => self.external_listeners(&inner, &origin),
            }
        };

        let relation = field == ParamField::PhaseShift;
        for listener in listeners {
            listener.emit(if relation {
                ControllerEvent::RelationChanged
            } else {
                ControllerEvent::ParamsUpdatedExternally
            });
        }

        match origin {
            Origin::User(slot) => {
                let cap = match field {
                    ParamField::Amplitude => PluginCaps::AMPLITUDE_CHANGED,
                    ParamField::Offset => PluginCaps::OFFSET_CHANGED,
                    ParamField::PhaseShift => PluginCaps::PHASE_SHIFT_CHANGED,
                };
                self.dispatch_plugins(cap, depth, |plugin, host| match field {
                    ParamField::Amplitude => plugin.amplitude_changed_by_user(host, slot, value),
                    ParamField::Offset => plugin.offset_changed_by_user(host, slot, value),
                    ParamField::PhaseShift => plugin.phase_shift_changed_by_user(host, slot, value),
                });
            }
            Origin::Plugin { index: origin_index, name } => {
                self.dispatch_plugins_except(
                    origin_index,
                    PluginCaps::PLUGIN_CHANGES,
                    depth,
                    |plugin, host| match field {
                        ParamField::Amplitude => {
                            plugin.amplitude_changed_by_plugin(host, &name, index, value)
                        }
                        ParamField::Offset => {
                            plugin.offset_changed_by_plugin(host, &name, index, value)
                        }
                        ParamField::PhaseShift => {
                            plugin.phase_shift_changed_by_plugin(host, &name, index, value)
                        }
                    },
                );
            }
        }
    }

    /// Everyone who should hear "something changed outside your control":
    /// all controllers except the originating slot.
    fn external_listeners(
        &self,
        inner: &SessionInner,
        origin: &Origin,
    ) -> Vec<Arc<ControllerContext>> {
        let exclude = match origin {
            Origin::User(slot) => Some(*slot),
            Origin::Plugin { .. } => None,
        };
        inner
            .users
            .iter()
            .filter(|(slot, _)| Some(**slot) != exclude)
            .map(|(_, context)| Arc::clone(context))
            .collect()
    }

    // ========================================================================
    // Plugin dispatch
    // ========================================================================

    fn dispatch_plugins(
        self: &Arc<Self>,
        cap: PluginCaps,
        depth: usize,
        mut call: impl FnMut(&mut dyn SessionPlugin, &mut PluginHost),
    ) {
        self.dispatch_plugins_filtered(None, cap, depth, &mut call);
    }

    fn dispatch_plugins_except(
        self: &Arc<Self>,
        skip: usize,
        cap: PluginCaps,
        depth: usize,
        mut call: impl FnMut(&mut dyn SessionPlugin, &mut PluginHost),
    ) {
        self.dispatch_plugins_filtered(Some(skip), cap, depth, &mut call);
    }

    fn dispatch_plugins_filtered(
        self: &Arc<Self>,
        skip: Option<usize>,
        cap: PluginCaps,
        depth: usize,
        call: &mut dyn FnMut(&mut dyn SessionPlugin, &mut PluginHost),
    ) {
        if depth > MAX_PLUGIN_CHAIN {
            log::warn!(
                "Session {:?}: plugin write chain exceeded {} rounds, dropping",
                self.identifier,
                MAX_PLUGIN_CHAIN
            );
            return;
        }
        let batches: Vec<(usize, String, Vec<HostOp>)> = {
            let mut plugins = self.plugins.lock();
            let mut batches = Vec::new();
            for (index, entry) in plugins.iter_mut().enumerate() {
                if Some(index) == skip || !entry.caps.contains(cap) {
                    continue;
                }
                let mut host = PluginHost::new();
                call(entry.plugin.as_mut(), &mut host);
                let ops = host.take_ops();
                if !ops.is_empty() {
                    batches.push((index, entry.name.clone(), ops));
                }
            }
            batches
        };
        for (index, name, ops) in batches {
            self.apply_plugin_ops(index, name, ops, depth + 1);
        }
    }

    fn apply_plugin_ops(self: &Arc<Self>, index: usize, name: String, ops: Vec<HostOp>, depth: usize) {
        for op in ops {
            match op {
                HostOp::SetFrequency(value) => self.write_frequency(
                    value,
                    Origin::Plugin {
                        index,
                        name: name.clone(),
                    },
                    depth,
                ),
                HostOp::SetAmplitude(target, value) => self.write_param(
                    target,
                    ParamField::Amplitude,
                    value,
                    Origin::Plugin {
                        index,
                        name: name.clone(),
                    },
                    depth,
                ),
                HostOp::SetOffset(target, value) => self.write_param(
                    target,
                    ParamField::Offset,
                    value,
                    Origin::Plugin {
                        index,
                        name: name.clone(),
                    },
                    depth,
                ),
                HostOp::SetPhaseShift(target, value) => self.write_param(
                    target,
                    ParamField::PhaseShift,
                    value,
                    Origin::Plugin {
                        index,
                        name: name.clone(),
                    },
                    depth,
                ),
                HostOp::Feedback { slot, message } => {
                    let targets: Vec<Arc<ControllerContext>> = {
                        let inner = self.inner.lock();
                        match slot {
                            Some(slot) => inner.users.get(&slot).cloned().into_iter().collect(),
                            None => inner.users.values().cloned().collect(),
                        }
                    };
                    for target in targets {
                        target.emit(ControllerEvent::Feedback(message.clone()));
                    }
                }
                HostOp::PublishObjectives(group) => {
                    let listeners: Vec<Arc<ControllerContext>> = {
                        let mut inner = self.inner.lock();
                        inner.objectives.retain(|g| g.title != group.title);
                        inner.objectives.push(group);
                        inner.users.values().cloned().collect()
                    };
                    for listener in listeners {
                        listener.emit(ControllerEvent::ObjectivesUpdated);
                    }
                }
            }
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    fn start_reconciliation(self: &Arc<Self>) {
        let mut recon = self.recon.lock();
        if recon.is_some() {
            return;
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let weak: Weak<Session> = Arc::downgrade(self);
        let interval = self.reconcile_interval;
        let handle = thread::Builder::new()
            .name(format!("session-{}", self.identifier))
            .spawn(move || reconcile_loop(weak, flag, interval))
            .expect("failed to spawn reconciliation thread");
        *recon = Some(ReconTask { shutdown, handle });
    }

    fn stop_reconciliation(&self) {
        let task = self.recon.lock().take();
        if let Some(task) = task {
            task.shutdown.store(true, Ordering::Relaxed);
            let _ = task.handle.join();
        }
    }

    fn run_reconcile_tick(self: &Arc<Self>) {
        // Plugins first, priority order
        self.dispatch_plugins(PluginCaps::UPDATE, 0, |plugin, host| plugin.update(host));

        // Then re-assert the snapshot; lost writes are healed next tick
        let (device, params) = {
            let inner = self.inner.lock();
            (inner.device.clone(), inner.params.clone())
        };
        if let Some(device) = device {
            let count = (device.oscillator_count() as usize).min(params.len());
            for (index, params) in params.iter().enumerate().take(count) {
                device.send(&HostCommand::UpdateOscillator {
                    index: index as u8,
                    params: *params,
                });
            }
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Orderly teardown: reset the hardware, end the device session, detach,
    /// tell the manager, and let the plugins say goodbye. Idempotent; a
    /// closed session never reopens.
    pub fn close(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.stop_reconciliation();

        let device = {
            let mut inner = self.inner.lock();
            inner.device_watch = None;
            inner.device.take()
        };
        if let Some(device) = device {
            let count = device.oscillator_count() as usize;
            for index in 0..count {
                device.send(&HostCommand::UpdateOscillator {
                    index: index as u8,
                    params: OscillatorParams::default(),
                });
            }
            device.send(&HostCommand::SessionEnd);
        }

        self.notify_manager_closed();
        self.dispatch_plugins(PluginCaps::SESSION_ENDED, 0, |plugin, host| {
            plugin.session_ended(host)
        });
        self.plugins.lock().clear();
        self.sink
            .line(&format!("Session {:?} closed", self.identifier));
    }

    fn notify_manager(&self) {
        if let Some(manager) = self.manager.as_ref().and_then(Weak::upgrade) {
            manager.notify_available_changed();
        }
    }

    fn notify_manager_closed(&self) {
        if let Some(manager) = self.manager.as_ref().and_then(Weak::upgrade) {
            manager.session_closed(&self.identifier);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_reconciliation();
    }
}

fn reconcile_loop(session: Weak<Session>, shutdown: Arc<AtomicBool>, interval: Duration) {
    log::debug!("Reconciliation thread started");
    while !shutdown.load(Ordering::Relaxed) {
        {
            let Some(session) = session.upgrade() else { break };
            session.run_reconcile_tick();
        }
        thread::sleep(interval);
    }
    log::debug!("Reconciliation thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockLink;
    use crate::device::DeviceConnection;
    use crate::protocol::frame;
    use crate::sink::default_sink;

    /// A fused device with one identified mock connection.
    fn mock_device(oscillators: u8) -> (Arc<FusedDevice>, Arc<MockLink>) {
        let link = MockLink::connected("mock0");
        let connection = DeviceConnection::new(link.clone());
        let mut payload = vec![0u8];
        payload.extend_from_slice(b"Snake1");
        payload.push(0);
        payload.push(oscillators);
        for i in 0..oscillators {
            payload.extend_from_slice(&(i as u16 * 10).to_le_bytes());
        }
        payload.push(0);
        link.inject(&frame(&payload));

        let fused = FusedDevice::new("Snake1");
        fused.add(connection);
        (fused, link)
    }

    fn test_session(oscillators: u8) -> (Arc<Session>, Arc<MockLink>) {
        let (device, link) = mock_device(oscillators);
        let session = Session::new(
            "Snake1",
            Vec::new(),
            Some(device),
            default_sink(),
            None,
            Duration::from_millis(50),
        );
        (session, link)
    }

    #[derive(Default)]
    struct Probe {
        joins: Vec<(usize, String)>,
        leaves: Vec<(usize, String)>,
        freq_by_user: Vec<(usize, f32)>,
        freq_by_plugin: Vec<(String, f32)>,
        updates: usize,
    }

    struct ProbePlugin {
        probe: Arc<Mutex<Probe>>,
    }

    impl SessionPlugin for ProbePlugin {
        fn name(&self) -> &str {
            "probe"
        }
        fn capabilities(&self) -> PluginCaps {
            PluginCaps::USER_JOINED
                | PluginCaps::USER_LEFT
                | PluginCaps::FREQUENCY_CHANGED
                | PluginCaps::PLUGIN_CHANGES
                | PluginCaps::UPDATE
        }
        fn user_joined(&mut self, _host: &mut PluginHost, slot: usize, name: &str) {
            self.probe.lock().joins.push((slot, name.to_string()));
        }
        fn user_left(&mut self, _host: &mut PluginHost, slot: usize, name: &str) {
            self.probe.lock().leaves.push((slot, name.to_string()));
        }
        fn frequency_changed_by_user(&mut self, _host: &mut PluginHost, slot: usize, value: f32) {
            self.probe.lock().freq_by_user.push((slot, value));
        }
        fn frequency_changed_by_plugin(&mut self, _host: &mut PluginHost, origin: &str, value: f32) {
            self.probe.lock().freq_by_plugin.push((origin.to_string(), value));
        }
        fn update(&mut self, _host: &mut PluginHost) {
            self.probe.lock().updates += 1;
        }
    }

    #[test]
    fn test_admission_cap_and_slot_order() {
        let (session, _link) = test_session(4);

        let a = session.create_context("ana").unwrap();
        let b = session.create_context("ben").unwrap();
        let c = session.create_context("cal").unwrap();
        let d = session.create_context("dee").unwrap();
        assert_eq!(
            [a.slot(), b.slot(), c.slot(), d.slot()],
            [0, 1, 2, 3]
        );
        assert!(matches!(
            session.create_context("eve"),
            Err(Error::SessionFull)
        ));

        // Slot accounting stays exact through churn
        assert_eq!(session.free_slots() + session.user_names().len(), 4);
        b.leave();
        assert_eq!(session.user_names().len(), 3);
        assert_eq!(session.free_slots() + session.user_names().len(), 4);
        let b2 = session.create_context("bea").unwrap();
        assert_eq!(b2.slot(), 1);
        assert_eq!(session.free_slots() + session.user_names().len(), 4);
        assert!(matches!(
            session.create_context("eve"),
            Err(Error::SessionFull)
        ));
    }

    #[test]
    fn test_params_default_after_bind() {
        let (session, _link) = test_session(3);
        let params = session.oscillator_params();
        assert_eq!(params.len(), 3);
        for p in params {
            assert_eq!(p.offset, 90.0);
            assert_eq!(p.frequency, 0.0);
        }
    }

    #[test]
    fn test_frequency_broadcast() {
        let probe = Arc::new(Mutex::new(Probe::default()));
        let (device, _link) = mock_device(4);
        let session = Session::new(
            "Snake1",
            vec![Box::new(ProbePlugin { probe: probe.clone() })],
            Some(device),
            default_sink(),
            None,
            Duration::from_millis(50),
        );

        let a = session.create_context("ana").unwrap();
        let b = session.create_context("ben").unwrap();

        let a_events = Arc::new(Mutex::new(0usize));
        let b_events = Arc::new(Mutex::new(0usize));
        let ae = a_events.clone();
        let _sa = a.events().connect(move |event| {
            if matches!(event, ControllerEvent::ParamsUpdatedExternally) {
                *ae.lock() += 1;
            }
        });
        let be = b_events.clone();
        let _sb = b.events().connect(move |event| {
            if matches!(event, ControllerEvent::ParamsUpdatedExternally) {
                *be.lock() += 1;
            }
        });

        a.set_frequency(1.5).unwrap();

        // Uniform across every oscillator
        for p in session.oscillator_params() {
            assert_eq!(p.frequency, 1.5);
        }
        // The other controller hears it exactly once; the writer does not
        assert_eq!(*b_events.lock(), 1);
        assert_eq!(*a_events.lock(), 0);
        // The plugin hears it exactly once
        assert_eq!(probe.lock().freq_by_user, [(0, 1.5)]);

        // Unchanged writes are ignored
        a.set_frequency(1.5).unwrap();
        assert_eq!(*b_events.lock(), 1);
        assert_eq!(probe.lock().freq_by_user.len(), 1);
    }

    #[test]
    fn test_phase_shift_notifies_relations() {
        let (session, _link) = test_session(2);
        let a = session.create_context("ana").unwrap();
        let b = session.create_context("ben").unwrap();

        let relations = Arc::new(Mutex::new(0usize));
        let r = relations.clone();
        let _sb = b.events().connect(move |event| {
            if matches!(event, ControllerEvent::RelationChanged) {
                *r.lock() += 1;
            }
        });

        a.set_phase_shift(180.0).unwrap();
        assert_eq!(*relations.lock(), 1);
        assert_eq!(session.oscillator_params()[0].phase_shift, 180.0);

        // Amplitude is private to the owner: no relation event
        a.set_amplitude(40.0).unwrap();
        assert_eq!(*relations.lock(), 1);
    }

    #[test]
    fn test_plugin_write_reaches_controllers_and_other_plugins() {
        struct Driver;
        impl SessionPlugin for Driver {
            fn name(&self) -> &str {
                "driver"
            }
            fn capabilities(&self) -> PluginCaps {
                PluginCaps::USER_JOINED
            }
            fn user_joined(&mut self, host: &mut PluginHost, slot: usize, _name: &str) {
                host.set_frequency(2.0 + slot as f32);
            }
        }

        let probe = Arc::new(Mutex::new(Probe::default()));
        let (device, _link) = mock_device(2);
        let session = Session::new(
            "Snake1",
            vec![
                Box::new(Driver),
                Box::new(ProbePlugin { probe: probe.clone() }),
            ],
            Some(device),
            default_sink(),
            None,
            Duration::from_millis(50),
        );

        let a = session.create_context("ana").unwrap();
        let a_events = Arc::new(Mutex::new(0usize));
        let ae = a_events.clone();
        let _sa = a.events().connect(move |event| {
            if matches!(event, ControllerEvent::ParamsUpdatedExternally) {
                *ae.lock() += 1;
            }
        });

        // Admission triggers the driver plugin, whose queued write lands
        // after dispatch: params change, the probe plugin is told with the
        // originator's name, and the already-subscribed controller hears it.
        let b = session.create_context("ben").unwrap();
        assert_eq!(session.oscillator_params()[0].frequency, 3.0);
        assert_eq!(
            probe.lock().freq_by_plugin,
            [("driver".to_string(), 2.0), ("driver".to_string(), 3.0)]
        );
        assert_eq!(*a_events.lock(), 1);
        drop(b);
    }

    #[test]
    fn test_reconciliation_writes_snapshot() {
        let (session, link) = test_session(2);
        link.take_written();

        // Within a few ticks the snapshot shows up on the wire
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut wire = Vec::new();
        while std::time::Instant::now() < deadline {
            wire = link.written();
            if !wire.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        // An UpdateOscillator frame: header, tag 3, index, 16 param bytes
        assert!(!wire.is_empty());
        assert_eq!(&wire[..2], b"ED");
        assert_eq!(wire[2], 3);
        drop(session);
    }

    #[test]
    fn test_close_resets_hardware_and_is_final() {
        let (session, link) = test_session(2);
        let a = session.create_context("ana").unwrap();
        link.take_written();

        a.leave(); // last user out → close

        assert!(session.is_closed());
        let wire = link.written();
        // Defaults for both oscillators then SessionEnd (tag 6)
        let mut frames = Vec::new();
        let mut assembler = crate::protocol::FrameAssembler::new();
        assembler.push(&wire, |p| frames.push(p));
        let tags: Vec<u8> = frames.iter().map(|f| f[0]).collect();
        // Reconciliation may have interleaved extra UpdateOscillator frames
        // before close; the tail is deterministic.
        assert!(tags.ends_with(&[3, 3, 6]));

        // Closed sessions never re-admit
        assert!(matches!(
            session.create_context("eve"),
            Err(Error::SessionClosed)
        ));
        // ...and never reopen
        session.close();
        assert!(session.is_closed());
    }

    #[test]
    fn test_detach_retains_state_for_rebind() {
        let (session, _link) = test_session(2);
        let a = session.create_context("ana").unwrap();
        a.set_frequency(1.0).unwrap();

        session.detach();
        assert!(!session.is_bound());
        assert_eq!(session.user_names(), ["ana"]);
        assert_eq!(session.oscillator_params()[0].frequency, 1.0);

        // Rebind: same identifier shows up again (e.g. after failover churn)
        let (device2, link2) = mock_device(4);
        session.attach(device2);
        assert!(session.is_bound());
        // Grown to the larger device, existing slot retained
        assert_eq!(session.oscillator_params().len(), 4);
        assert_eq!(a.slot(), 0);
        let b = session.create_context("ben").unwrap();
        assert_eq!(b.slot(), 1);
        // SessionStart went out on the new device
        let wire = link2.written();
        let mut frames = Vec::new();
        let mut assembler = crate::protocol::FrameAssembler::new();
        assembler.push(&wire, |p| frames.push(p));
        assert!(frames.iter().any(|f| f[0] == 1));
    }

    #[test]
    fn test_imu_events_reach_plugins() {
        use crate::protocol::packets::TAG_IMU_DATA;
        use crate::protocol::ImuRecord;

        struct ImuProbe {
            count: Arc<Mutex<usize>>,
        }
        impl SessionPlugin for ImuProbe {
            fn name(&self) -> &str {
                "imu-probe"
            }
            fn capabilities(&self) -> PluginCaps {
                PluginCaps::IMU_DATA
            }
            fn imu_data(&mut self, _host: &mut PluginHost, _record: &ImuRecord) {
                *self.count.lock() += 1;
            }
        }

        let count = Arc::new(Mutex::new(0usize));
        let (device, link) = mock_device(1);
        let _session = Session::new(
            "Snake1",
            vec![Box::new(ImuProbe { count: count.clone() })],
            Some(device),
            default_sink(),
            None,
            Duration::from_millis(50),
        );

        let mut payload = vec![TAG_IMU_DATA];
        ImuRecord::default().write_to(&mut payload);
        link.inject(&frame(&payload));
        assert_eq!(*count.lock(), 1);
    }
}
