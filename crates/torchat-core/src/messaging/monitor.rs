//! Application-facing event interface.
//!
//! The engine reports to any number of [`EventMonitor`]s. Callbacks run on
//! engine tasks and must return immediately. Monitors are held weakly:
//! dropping the last `Arc` unsubscribes, and dead entries are pruned the
//! next time an event is emitted.

use crate::messaging::file_transfer::FileInfo;
use crate::messaging::peer::{BuddyInfo, BuddyState};
use crate::protocol::Presence;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;

/// Presence change of a buddy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuddyStateUpdate {
    /// Buddy id.
    pub buddy_id: String,
    /// New state.
    pub state: BuddyState,
    /// Last presence the buddy reported.
    pub presence: Option<Presence>,
    /// Identification and profile learned so far.
    pub info: BuddyInfo,
}

/// A chat message from a buddy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Sender.
    pub buddy_id: String,
    /// Text, lossily decoded as UTF-8.
    pub message: String,
}

/// Kind of an [`OtherEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtherEventKind {
    /// Dialing a buddy.
    Connecting,
    /// A buddy session is being torn down.
    Disconnecting,
    /// A message was queued on the outbound connection.
    MessageTransmitted,
    /// The buddy sent `remove_me`.
    BuddyRemoved,
    /// Anything else worth showing.
    Info,
}

/// Miscellaneous notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtherEvent {
    /// Buddy concerned, if any.
    pub buddy_id: Option<String>,
    /// Kind.
    pub kind: OtherEventKind,
    /// Human-readable description.
    pub description: String,
}

impl OtherEvent {
    pub(crate) fn new(buddy_id: &str, kind: OtherEventKind, description: impl Into<String>) -> Self {
        Self {
            buddy_id: Some(buddy_id.to_string()),
            kind,
            description: description.into(),
        }
    }
}

/// Receives engine notifications. Every method has a no-op default; the
/// authorization requests approve by default.
pub trait EventMonitor: Send + Sync {
    /// A new inbound connection greeted us as `buddy_id`. Return `false` to
    /// refuse it.
    fn on_incoming_connection(&self, _buddy_id: &str) -> bool {
        true
    }

    /// `buddy_id` asked to be added. Return `false` to refuse.
    fn on_add_new_buddy(&self, _buddy_id: &str) -> bool {
        true
    }

    /// `buddy_id` was accepted as a buddy.
    fn on_buddy_added(&self, _buddy_id: &str) {}

    /// A buddy's state or presence changed.
    fn on_buddy_state_update(&self, _update: &BuddyStateUpdate) {}

    /// A chat message arrived.
    fn on_incoming_message(&self, _message: &IncomingMessage) {}

    /// A buddy offered a file.
    fn on_incoming_file_transfer(&self, _file: &FileInfo) {}

    /// A transfer progressed or changed state.
    fn on_file_transfer_update(&self, _file: &FileInfo) {}

    /// Anything else.
    fn on_other_event(&self, _event: &OtherEvent) {}

    /// The listener is bound.
    fn on_listening(&self, _addr: SocketAddr) {}

    /// The engine finished shutting down. Sent once.
    fn on_shutdown_complete(&self) {}
}

/// Registration handle returned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorHandle(u64);

/// Weakly held subscriber list.
#[derive(Default)]
pub struct MonitorRegistry {
    next: AtomicU64,
    entries: RwLock<Vec<(MonitorHandle, Weak<dyn EventMonitor>)>>,
}

impl MonitorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `monitor`.
    pub fn add(&self, monitor: &Arc<dyn EventMonitor>) -> MonitorHandle {
        let handle = MonitorHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, Arc::downgrade(monitor)));
        handle
    }

    /// Unsubscribe. Returns whether the handle was registered.
    pub fn remove(&self, handle: MonitorHandle) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(h, _)| *h != handle);
        entries.len() != before
    }

    /// Live monitors; dead entries are dropped.
    pub fn live(&self) -> Vec<Arc<dyn EventMonitor>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut live = Vec::with_capacity(entries.len());
        entries.retain(|(_, weak)| match weak.upgrade() {
            Some(monitor) => {
                live.push(monitor);
                true
            }
            None => false,
        });
        live
    }

    /// Number of registered entries, dead ones included.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` on every live monitor.
    pub fn emit(&self, f: impl Fn(&dyn EventMonitor)) {
        for monitor in self.live() {
            f(monitor.as_ref());
        }
    }

    /// Whether every live monitor approves `f`.
    pub fn approve(&self, f: impl Fn(&dyn EventMonitor) -> bool) -> bool {
        self.live().iter().all(|m| f(m.as_ref()))
    }
}

/// Event forwarded by [`ChannelMonitor`].
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The listener is bound.
    Listening {
        /// Local address.
        addr: SocketAddr,
    },
    /// An inbound connection was authorized.
    IncomingConnection {
        /// Buddy id from the greeting.
        buddy_id: String,
    },
    /// A buddy was accepted.
    BuddyAdded {
        /// Buddy id.
        buddy_id: String,
    },
    /// Buddy state or presence changed.
    BuddyStateUpdate(BuddyStateUpdate),
    /// Chat message.
    IncomingMessage(IncomingMessage),
    /// File offered by a buddy.
    IncomingFileTransfer(FileInfo),
    /// Transfer progress.
    FileTransferUpdate(FileInfo),
    /// Anything else.
    Other(OtherEvent),
    /// The engine is down.
    ShutdownComplete,
}

/// Monitor that forwards every callback onto a channel.
pub struct ChannelMonitor {
    tx: mpsc::UnboundedSender<EngineEvent>,
    approve: bool,
}

impl ChannelMonitor {
    /// Monitor approving every authorization request.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        Self::with_policy(true)
    }

    /// Monitor answering authorization requests with `approve`.
    pub fn with_policy(approve: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, approve }), rx)
    }

    fn forward(&self, event: EngineEvent) {
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl EventMonitor for ChannelMonitor {
    fn on_incoming_connection(&self, buddy_id: &str) -> bool {
        if self.approve {
            self.forward(EngineEvent::IncomingConnection {
                buddy_id: buddy_id.to_string(),
            });
        }
        self.approve
    }

    fn on_add_new_buddy(&self, _buddy_id: &str) -> bool {
        self.approve
    }

    fn on_buddy_added(&self, buddy_id: &str) {
        self.forward(EngineEvent::BuddyAdded {
            buddy_id: buddy_id.to_string(),
        });
    }

    fn on_buddy_state_update(&self, update: &BuddyStateUpdate) {
        self.forward(EngineEvent::BuddyStateUpdate(update.clone()));
    }

    fn on_incoming_message(&self, message: &IncomingMessage) {
        self.forward(EngineEvent::IncomingMessage(message.clone()));
    }

    fn on_incoming_file_transfer(&self, file: &FileInfo) {
        self.forward(EngineEvent::IncomingFileTransfer(file.clone()));
    }

    fn on_file_transfer_update(&self, file: &FileInfo) {
        self.forward(EngineEvent::FileTransferUpdate(file.clone()));
    }

    fn on_other_event(&self, event: &OtherEvent) {
        self.forward(EngineEvent::Other(event.clone()));
    }

    fn on_listening(&self, addr: SocketAddr) {
        self.forward(EngineEvent::Listening { addr });
    }

    fn on_shutdown_complete(&self) {
        self.forward(EngineEvent::ShutdownComplete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        messages: AtomicUsize,
        approve: bool,
    }

    impl EventMonitor for Counter {
        fn on_add_new_buddy(&self, _buddy_id: &str) -> bool {
            self.approve
        }

        fn on_incoming_message(&self, _message: &IncomingMessage) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn message() -> IncomingMessage {
        IncomingMessage {
            buddy_id: "abcdefghijklmnop".into(),
            message: "hello".into(),
        }
    }

    #[test]
    fn test_dead_monitors_pruned_on_emit() {
        let registry = MonitorRegistry::new();
        let kept: Arc<dyn EventMonitor> = Arc::new(Counter::default());
        let dropped: Arc<dyn EventMonitor> = Arc::new(Counter::default());
        registry.add(&kept);
        registry.add(&dropped);
        assert_eq!(registry.len(), 2);

        drop(dropped);
        registry.emit(|m| m.on_incoming_message(&message()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove() {
        let registry = MonitorRegistry::new();
        let monitor: Arc<dyn EventMonitor> = Arc::new(Counter::default());
        let handle = registry.add(&monitor);
        assert!(registry.remove(handle));
        assert!(!registry.remove(handle));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_approval_needs_every_monitor() {
        let registry = MonitorRegistry::new();
        assert!(registry.approve(|m| m.on_add_new_buddy("x")));

        let yes: Arc<dyn EventMonitor> = Arc::new(Counter { approve: true, ..Default::default() });
        let no: Arc<dyn EventMonitor> = Arc::new(Counter::default());
        registry.add(&yes);
        assert!(registry.approve(|m| m.on_add_new_buddy("x")));
        registry.add(&no);
        assert!(!registry.approve(|m| m.on_add_new_buddy("x")));
    }

    #[test]
    fn test_channel_monitor_forwards() {
        let (monitor, mut rx) = ChannelMonitor::new();
        let registry = MonitorRegistry::new();
        let dyn_monitor: Arc<dyn EventMonitor> = monitor.clone();
        registry.add(&dyn_monitor);

        registry.emit(|m| m.on_incoming_message(&message()));
        registry.emit(|m| m.on_shutdown_complete());

        match rx.try_recv().unwrap() {
            EngineEvent::IncomingMessage(msg) => assert_eq!(msg, message()),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::ShutdownComplete));
    }

    #[test]
    fn test_channel_monitor_policy() {
        let (monitor, _rx) = ChannelMonitor::with_policy(false);
        assert!(!monitor.on_add_new_buddy("x"));
        assert!(!monitor.on_incoming_connection("x"));
    }
}
