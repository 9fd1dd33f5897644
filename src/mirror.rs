//! In-memory GATT mirror shared by every transport.
//!
//! The mirror is the authoritative store for the synthetic service tree:
//! characteristic values, property masks, write handlers, and subscriber
//! sets. TCP sessions and the BLE peripheral attach an outbound channel and
//! receive notification fanout through it; the socket/BLE I/O itself happens
//! in the owning transport task, never under the mirror lock.
//!
//! All operations are synchronous and the internal lock is never held across
//! an await point.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Largest storable characteristic value (ATT maximum).
pub const MAX_VALUE_LEN: usize = 512;

/// Outbound notification queue depth per transport. A transport that falls
/// this far behind starts losing notifications rather than blocking others.
pub const NOTIFY_QUEUE_DEPTH: usize = 32;

/// Identifies one attached transport (a TCP session or the BLE peripheral).
pub type SessionId = u64;

/// Handler invoked after a write commits. Runs outside the mirror lock, so
/// it may freely call back into the mirror.
pub type WriteHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A value change fanned out to a subscribed transport.
#[derive(Debug, Clone)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// Characteristic property mask. The bit values double as the TNP wire
/// property byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Props(u8);

impl Props {
    pub const READ: Props = Props(0x01);
    pub const WRITE: Props = Props(0x02);
    pub const NOTIFY: Props = Props(0x04);
    pub const INDICATE: Props = Props(0x08);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Props) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn readable(self) -> bool {
        self.contains(Props::READ)
    }

    pub fn writable(self) -> bool {
        self.contains(Props::WRITE)
    }

    pub fn notifiable(self) -> bool {
        self.contains(Props::NOTIFY)
    }

    pub fn indicatable(self) -> bool {
        self.contains(Props::INDICATE)
    }

    /// NOTIFY or INDICATE: eligible for subscriptions.
    pub fn subscribable(self) -> bool {
        self.0 & (Props::NOTIFY.0 | Props::INDICATE.0) != 0
    }
}

impl BitOr for Props {
    type Output = Props;

    fn bitor(self, rhs: Props) -> Props {
        Props(self.0 | rhs.0)
    }
}

/// Specification of one characteristic at registration time.
pub struct CharacteristicSpec {
    pub uuid: Uuid,
    pub props: Props,
    pub value: Vec<u8>,
    pub write_handler: Option<WriteHandler>,
}

impl CharacteristicSpec {
    pub fn new(uuid: Uuid, props: Props) -> Self {
        CharacteristicSpec {
            uuid,
            props,
            value: Vec::new(),
            write_handler: None,
        }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    pub fn on_write(mut self, handler: WriteHandler) -> Self {
        self.write_handler = Some(handler);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorError {
    UnknownService,
    UnknownCharacteristic,
    NotReadable,
    NotWritable,
    NotSubscribable,
    ValueTooLarge,
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorError::UnknownService => write!(f, "service not found"),
            MirrorError::UnknownCharacteristic => write!(f, "characteristic not found"),
            MirrorError::NotReadable => write!(f, "characteristic is not readable"),
            MirrorError::NotWritable => write!(f, "characteristic is not writable"),
            MirrorError::NotSubscribable => {
                write!(f, "characteristic supports neither notify nor indicate")
            }
            MirrorError::ValueTooLarge => write!(f, "value exceeds {MAX_VALUE_LEN} bytes"),
        }
    }
}

impl std::error::Error for MirrorError {}

struct CharacteristicEntry {
    uuid: Uuid,
    props: Props,
    value: Vec<u8>,
    write_handler: Option<WriteHandler>,
    subscribers: Vec<SessionId>,
}

struct ServiceEntry {
    uuid: Uuid,
    characteristics: Vec<CharacteristicEntry>,
}

#[derive(Default)]
struct Inner {
    services: Vec<ServiceEntry>,
    advertised: Vec<Uuid>,
    transports: HashMap<SessionId, mpsc::Sender<Notification>>,
    next_session: SessionId,
}

impl Inner {
    fn find(&self, uuid: &Uuid) -> Option<&CharacteristicEntry> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == *uuid)
    }

    fn find_mut(&mut self, uuid: &Uuid) -> Option<&mut CharacteristicEntry> {
        self.services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.uuid == *uuid)
    }
}

/// The synthetic GATT database. See module docs.
pub struct GattMirror {
    inner: Mutex<Inner>,
}

impl Default for GattMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl GattMirror {
    pub fn new() -> Self {
        GattMirror {
            inner: Mutex::new(Inner {
                next_session: 1,
                ..Inner::default()
            }),
        }
    }

    /// Register a service with its characteristics. Startup only; the tree
    /// never shrinks. A duplicate service UUID is ignored with a warning.
    pub fn register_service(&self, uuid: Uuid, characteristics: Vec<CharacteristicSpec>) {
        let mut inner = self.lock();
        if inner.services.iter().any(|s| s.uuid == uuid) {
            warn!("Service {uuid} already registered, ignoring");
            return;
        }
        let entries = characteristics
            .into_iter()
            .map(|spec| CharacteristicEntry {
                uuid: spec.uuid,
                props: spec.props,
                value: spec.value,
                write_handler: spec.write_handler,
                subscribers: Vec::new(),
            })
            .collect();
        inner.services.push(ServiceEntry {
            uuid,
            characteristics: entries,
        });
    }

    /// Fix the ordered service list answered to DISCOVER_SERVICES. Without
    /// this, discovery answers the full tree in registration order.
    pub fn set_advertised_services(&self, services: Vec<Uuid>) {
        self.lock().advertised = services;
    }

    /// Ordered service list for discovery.
    pub fn advertised_services(&self) -> Vec<Uuid> {
        let inner = self.lock();
        if inner.advertised.is_empty() {
            inner.services.iter().map(|s| s.uuid).collect()
        } else {
            inner.advertised.clone()
        }
    }

    /// All registered services, in registration order.
    pub fn services(&self) -> Vec<Uuid> {
        self.lock().services.iter().map(|s| s.uuid).collect()
    }

    /// Characteristics of one service, in registration order.
    pub fn characteristics(&self, service: &Uuid) -> Result<Vec<(Uuid, Props)>, MirrorError> {
        let inner = self.lock();
        let entry = inner
            .services
            .iter()
            .find(|s| s.uuid == *service)
            .ok_or(MirrorError::UnknownService)?;
        Ok(entry
            .characteristics
            .iter()
            .map(|c| (c.uuid, c.props))
            .collect())
    }

    /// Attach a transport; returns the id used for subscriptions.
    pub fn attach(&self, sender: mpsc::Sender<Notification>) -> SessionId {
        let mut inner = self.lock();
        let id = inner.next_session;
        inner.next_session += 1;
        inner.transports.insert(id, sender);
        id
    }

    /// Detach a transport and remove it from every subscriber set.
    pub fn drop_session(&self, session: SessionId) {
        let mut inner = self.lock();
        inner.transports.remove(&session);
        for service in &mut inner.services {
            for characteristic in &mut service.characteristics {
                characteristic.subscribers.retain(|s| *s != session);
            }
        }
        debug!("Dropped session {session} and its subscriptions");
    }

    /// Current value without a property check (handlers, debug console).
    pub fn value(&self, uuid: &Uuid) -> Result<Vec<u8>, MirrorError> {
        let inner = self.lock();
        inner
            .find(uuid)
            .map(|c| c.value.clone())
            .ok_or(MirrorError::UnknownCharacteristic)
    }

    /// Property-checked read, as a transport performs it.
    pub fn read(&self, uuid: &Uuid) -> Result<Vec<u8>, MirrorError> {
        let inner = self.lock();
        let entry = inner.find(uuid).ok_or(MirrorError::UnknownCharacteristic)?;
        if !entry.props.readable() {
            return Err(MirrorError::NotReadable);
        }
        Ok(entry.value.clone())
    }

    /// Validate and store a written value, returning the write handler so
    /// the caller can emit its acknowledgment before running it. Zero-length
    /// values are valid writes.
    pub fn commit_write(
        &self,
        uuid: &Uuid,
        value: &[u8],
    ) -> Result<Option<WriteHandler>, MirrorError> {
        if value.len() > MAX_VALUE_LEN {
            return Err(MirrorError::ValueTooLarge);
        }
        let mut inner = self.lock();
        let entry = inner
            .find_mut(uuid)
            .ok_or(MirrorError::UnknownCharacteristic)?;
        if !entry.props.writable() {
            return Err(MirrorError::NotWritable);
        }
        entry.value = value.to_vec();
        Ok(entry.write_handler.clone())
    }

    /// Commit a write and run its handler immediately. Used where the
    /// transport imposes no acknowledgment ordering of its own.
    pub fn write(&self, uuid: &Uuid, value: &[u8]) -> Result<(), MirrorError> {
        let handler = self.commit_write(uuid, value)?;
        if let Some(handler) = handler {
            handler(value);
        }
        Ok(())
    }

    /// Add `session` to the subscriber set of `uuid`.
    pub fn subscribe(&self, session: SessionId, uuid: &Uuid) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        let entry = inner
            .find_mut(uuid)
            .ok_or(MirrorError::UnknownCharacteristic)?;
        if !entry.props.subscribable() {
            return Err(MirrorError::NotSubscribable);
        }
        if !entry.subscribers.contains(&session) {
            entry.subscribers.push(session);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, session: SessionId, uuid: &Uuid) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        let entry = inner
            .find_mut(uuid)
            .ok_or(MirrorError::UnknownCharacteristic)?;
        entry.subscribers.retain(|s| *s != session);
        Ok(())
    }

    pub fn subscriber_count(&self, uuid: &Uuid) -> usize {
        self.lock()
            .find(uuid)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Store a new value and fan it out to every subscriber. Enqueueing is a
    /// non-blocking push; a transport whose queue is full loses this
    /// notification and the rest continue.
    pub fn notify(&self, uuid: &Uuid, value: &[u8]) {
        let mut inner = self.lock();
        let Some(entry) = inner.find_mut(uuid) else {
            warn!("Notify for unknown characteristic {uuid}");
            return;
        };
        entry.value = value.to_vec();
        let subscribers = entry.subscribers.clone();
        for session in subscribers {
            let Some(sender) = inner.transports.get(&session) else {
                continue;
            };
            let notification = Notification {
                uuid: *uuid,
                value: value.to_vec(),
            };
            match sender.try_send(notification) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Notify queue full for session {session}, dropping {uuid}");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Notify channel closed for session {session}");
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
