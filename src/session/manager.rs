//! Session manager
//!
//! The catalog: fused devices the connection manager has surfaced become
//! *candidates*; a candidate becomes an *active* session lazily, on the first
//! admission attempt. The available list is the frontend's menu and is
//! invalidated (one `()` pulse, cheap to debounce upstream) whenever
//! candidates, admissions, locks, or bindings change.

use super::context::ControllerContext;
use super::session::Session;
use crate::device::DirectoryEvent;
use crate::error::{Error, Result};
use crate::events::{Signal, Subscription};
use crate::plugins::PluginFactory;
use crate::device::FusedDevice;
use crate::sink::EventSink;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct ManagerInner {
    candidates: HashMap<String, Arc<FusedDevice>>,
    actives: HashMap<String, Arc<Session>>,
}

pub struct SessionManager {
    weak: Weak<SessionManager>,
    plugin_factory: Option<PluginFactory>,
    sink: Arc<dyn EventSink>,
    reconcile_interval: Duration,
    inner: Mutex<ManagerInner>,
    updated: Signal<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        plugin_factory: Option<PluginFactory>,
        sink: Arc<dyn EventSink>,
        reconcile_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            plugin_factory,
            sink,
            reconcile_interval,
            inner: Mutex::new(ManagerInner {
                candidates: HashMap::new(),
                actives: HashMap::new(),
            }),
            updated: Signal::new(),
            pump: Mutex::new(None),
        })
    }

    /// Consume the connection manager's directory events on a dedicated
    /// thread; the pump exits when the directory side hangs up.
    pub fn start_pump(self: &Arc<Self>, events: Receiver<DirectoryEvent>) {
        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("session-catalog".to_string())
            .spawn(move || {
                for event in events {
                    manager.handle_directory_event(event);
                }
                log::debug!("Session catalog pump exiting");
            })
            .expect("failed to spawn session catalog thread");
        *self.pump.lock() = Some(handle);
    }

    /// Join the pump thread (call after stopping the connection manager).
    pub fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn handle_directory_event(self: &Arc<Self>, event: DirectoryEvent) {
        match event {
            DirectoryEvent::Connected(device) => {
                let identifier = device.identifier().to_string();
                let session = {
                    let mut inner = self.inner.lock();
                    inner
                        .candidates
                        .insert(identifier.clone(), Arc::clone(&device));
                    inner.actives.get(&identifier).cloned()
                };
                // A surviving session for this identifier re-binds seamlessly
                if let Some(session) = session {
                    session.attach(device);
                }
            }
            DirectoryEvent::Lost(identifier) => {
                let session = {
                    let mut inner = self.inner.lock();
                    inner.candidates.remove(&identifier);
                    inner.actives.get(&identifier).cloned()
                };
                if let Some(session) = session {
                    session.detach();
                }
            }
            DirectoryEvent::LockChanged { identifier, locked } => {
                log::info!(
                    "Device {:?} soft lock {}",
                    identifier,
                    if locked { "taken" } else { "released" }
                );
            }
        }
        self.notify_available_changed();
    }

    /// Identifiers a new controller could join right now: unclaimed unlocked
    /// candidates, plus active sessions that still have room and a device.
    pub fn available_sessions(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut available: Vec<String> = inner
            .candidates
            .iter()
            .filter(|(identifier, device)| match inner.actives.get(*identifier) {
                None => !device.is_locked(),
                Some(session) => session.has_room() && session.is_bound(),
            })
            .map(|(identifier, _)| identifier.clone())
            .collect();
        available.sort();
        available
    }

    /// Admit `user_name` to the identified device, creating the session on
    /// first contact.
    pub fn attempt_connection_to(
        &self,
        identifier: &str,
        user_name: &str,
    ) -> Result<Arc<ControllerContext>> {
        let session = {
            let mut inner = self.inner.lock();
            let existing = inner.actives.get(identifier).cloned();
            if let Some(session) = existing {
                session
            } else {
                let device = inner
                    .candidates
                    .get(identifier)
                    .cloned()
                    .ok_or_else(|| Error::NoSuchSession(identifier.to_string()))?;
                if device.is_locked() {
                    return Err(Error::LockedByOtherHost(identifier.to_string()));
                }
                let plugins = self
                    .plugin_factory
                    .as_ref()
                    .map(|factory| factory())
                    .unwrap_or_default();
                let session = Session::new(
                    identifier,
                    plugins,
                    Some(device),
                    Arc::clone(&self.sink),
                    Some(self.weak.clone()),
                    self.reconcile_interval,
                );
                inner.actives.insert(identifier.to_string(), Arc::clone(&session));
                session
            }
        };
        let result = session.create_context(user_name);
        self.notify_available_changed();
        result
    }

    pub fn active_session_count(&self) -> usize {
        self.inner.lock().actives.len()
    }

    pub fn candidate_count(&self) -> usize {
        self.inner.lock().candidates.len()
    }

    /// Subscribe to available-list invalidation.
    pub fn on_available_changed(&self, handler: impl Fn() + Send + 'static) -> Subscription {
        self.updated.connect(move |_| handler())
    }

    pub(crate) fn notify_available_changed(&self) {
        self.updated.emit(&());
    }

    /// A session finished tearing down; drop it from the catalog.
    pub(crate) fn session_closed(&self, identifier: &str) {
        self.inner.lock().actives.remove(identifier);
        self.notify_available_changed();
    }

    /// Close every active session (daemon shutdown).
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let inner = self.inner.lock();
            inner.actives.values().cloned().collect()
        };
        for session in sessions {
            session.close();
        }
    }
}
