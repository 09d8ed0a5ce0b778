//! Ownership of the one serial connection.
//!
//! [`ConnectionManager`] holds at most one open [`Transport`], the
//! [`ConnectionState`] describing it, and an exclusive claim token. Two
//! locks are in play:
//!
//! - the **claim** is an application-level token: a tool must hold it for
//!   the duration of a job, and a second tool is refused rather than queued;
//! - the **stream lock** is the transport mutex, taken by the codecs for a
//!   single exchange only.
//!
//! Every state change is pushed synchronously to subscribers before the
//! changing call returns.

mod claim;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::port::{Port, SerialConfig, Transport};
use crate::subscribers::{Subscribers, Subscription};

pub use claim::ClaimGuard;

/// Opens a port from a configuration.
pub type PortOpener = Box<dyn Fn(&SerialConfig) -> Result<Box<dyn Port>> + Send + Sync>;

/// Snapshot broadcast to subscribers.
///
/// `owner` is only ever set while `connected` is true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionState {
    /// A transport is open.
    pub connected: bool,
    /// Firmware version reported by the radio, once known.
    pub firmware_version: Option<String>,
    /// Tool currently holding the claim.
    pub owner: Option<String>,
}

struct Inner {
    transport: Option<Transport>,
    state: ConnectionState,
}

struct Shared {
    inner: Mutex<Inner>,
    subscribers: Arc<Subscribers<ConnectionState>>,
    opener: PortOpener,
}

/// Owner of the serial connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

#[cfg(feature = "native")]
impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Manager opening native serial ports.
    #[cfg(feature = "native")]
    pub fn new() -> Self {
        Self::with_opener(|config| {
            let port = crate::port::NativePort::open(config)?;
            Ok(Box::new(port) as Box<dyn Port>)
        })
    }

    /// Manager opening ports through `opener`.
    pub fn with_opener<F>(opener: F) -> Self
    where
        F: Fn(&SerialConfig) -> Result<Box<dyn Port>> + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    transport: None,
                    state: ConnectionState::default(),
                }),
                subscribers: Subscribers::new(),
                opener: Box::new(opener),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `change` under the delivery lock and broadcast the state it
    /// reports.
    fn publish<R>(&self, change: impl FnOnce(&mut Inner) -> (R, Option<ConnectionState>)) -> R {
        self.shared.subscribers.publish(|| change(&mut self.inner()))
    }

    /// Open the port, or return the open transport unchanged.
    ///
    /// On failure the state is reset to disconnected and the error returned.
    pub fn connect(&self, config: &SerialConfig) -> Result<Transport> {
        self.publish(|inner| {
            if let Some(transport) = &inner.transport {
                if is_usable(transport) {
                    debug!("Reusing open connection");
                    return (Ok(Arc::clone(transport)), None);
                }
                debug!("Dropping dead connection");
                inner.transport = None;
            }

            match (self.shared.opener)(config) {
                Ok(port) => {
                    let transport: Transport = Arc::new(Mutex::new(port));
                    inner.transport = Some(Arc::clone(&transport));
                    inner.state = ConnectionState {
                        connected: true,
                        ..ConnectionState::default()
                    };
                    info!(
                        "Connected to {} at {} baud",
                        config.port_name, config.baud_rate
                    );
                    (Ok(transport), Some(inner.state.clone()))
                },
                Err(e) => {
                    let changed = inner.state != ConnectionState::default();
                    inner.state = ConnectionState::default();
                    warn!("Failed to open {}: {e}", config.port_name);
                    (Err(e), changed.then(ConnectionState::default))
                },
            }
        })
    }

    /// Close the port and clear all state. Safe to call when disconnected.
    ///
    /// An exchange in flight keeps the stream lock until its own deadline;
    /// the port is closed as soon as it is released.
    pub fn disconnect(&self) {
        let transport = self.publish(|inner| {
            let changed = inner.state != ConnectionState::default();
            inner.state = ConnectionState::default();
            if changed {
                info!("Disconnected");
            }
            (inner.transport.take(), changed.then(ConnectionState::default))
        });

        if let Some(transport) = transport {
            let mut port = transport.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = port.close() {
                warn!("Error closing {}: {e}", port.name());
            }
        }
    }

    /// The open transport, if any.
    pub fn transport(&self) -> Option<Transport> {
        self.inner().transport.clone()
    }

    /// The open transport, or [`Error::NotConnected`].
    pub fn require_transport(&self) -> Result<Transport> {
        self.transport().ok_or(Error::NotConnected)
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.inner().state.clone()
    }

    /// Whether a transport is open.
    pub fn is_connected(&self) -> bool {
        self.inner().state.connected
    }

    /// Record the firmware version reported by the connected radio.
    pub fn set_firmware_version(&self, version: Option<String>) {
        self.publish(|inner| {
            if !inner.state.connected || inner.state.firmware_version == version {
                return ((), None);
            }
            inner.state.firmware_version = version;
            ((), Some(inner.state.clone()))
        });
    }

    /// Take the claim for `owner`.
    ///
    /// Returns `false` when disconnected or when another owner holds it.
    /// Claiming again as the current owner succeeds without a notification.
    pub fn claim(&self, owner: &str) -> bool {
        self.publish(|inner| {
            if !inner.state.connected {
                debug!("Claim by {owner} refused: not connected");
                return (false, None);
            }
            match inner.state.owner.as_deref() {
                Some(current) if current == owner => (true, None),
                Some(current) => {
                    debug!("Claim by {owner} refused: held by {current}");
                    (false, None)
                },
                None => {
                    inner.state.owner = Some(owner.to_string());
                    debug!("Connection claimed by {owner}");
                    (true, Some(inner.state.clone()))
                },
            }
        })
    }

    /// Drop the claim if `owner` holds it; otherwise do nothing.
    pub fn release(&self, owner: &str) {
        self.publish(|inner| {
            if inner.state.owner.as_deref() != Some(owner) {
                return ((), None);
            }
            inner.state.owner = None;
            debug!("Connection released by {owner}");
            ((), Some(inner.state.clone()))
        });
    }

    /// Claim for `owner`, released again when the guard drops.
    pub fn try_claim(&self, owner: &str) -> Option<ClaimGuard> {
        self.claim(owner)
            .then(|| ClaimGuard::new(self.clone(), owner.to_string()))
    }

    /// Watch state changes; `callback` runs at once with the current state.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(|| self.state(), callback)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn is_usable(transport: &Transport) -> bool {
    match transport.try_lock() {
        Ok(port) => port.is_open(),
        // Busy with an exchange, so alive
        Err(TryLockError::WouldBlock) => true,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_open(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::LoopbackPort;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn loopback_manager() -> (ConnectionManager, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opens);
        let manager = ConnectionManager::with_opener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(LoopbackPort::new()) as Box<dyn Port>)
        });
        (manager, opens)
    }

    fn config() -> SerialConfig {
        SerialConfig::new("loopback", 38400)
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (manager, opens) = loopback_manager();
        let first = manager.connect(&config()).unwrap();
        let second = manager.connect(&config()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());
    }

    #[test]
    fn test_connect_failure_leaves_disconnected() {
        let manager =
            ConnectionManager::with_opener(|_| Err(Error::Io(std::io::ErrorKind::NotFound.into())));
        assert!(manager.connect(&config()).is_err());
        assert_eq!(manager.state(), ConnectionState::default());
        assert!(manager.transport().is_none());
    }

    #[test]
    fn test_reconnect_after_port_died() {
        let (manager, opens) = loopback_manager();
        let transport = manager.connect(&config()).unwrap();
        transport.lock().unwrap().close().unwrap();

        let fresh = manager.connect(&config()).unwrap();
        assert!(!Arc::ptr_eq(&transport, &fresh));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disconnect_closes_and_is_idempotent() {
        let (manager, _) = loopback_manager();
        let transport = manager.connect(&config()).unwrap();
        assert!(manager.claim("backup"));

        manager.disconnect();
        manager.disconnect();

        assert!(!transport.lock().unwrap().is_open());
        assert_eq!(manager.state(), ConnectionState::default());
        assert!(matches!(manager.require_transport(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_claim_exclusivity() {
        let (manager, _) = loopback_manager();
        assert!(!manager.claim("a"), "claim needs a connection");

        manager.connect(&config()).unwrap();
        assert!(manager.claim("a"));
        assert!(manager.claim("a"));
        assert!(!manager.claim("b"));

        manager.release("b");
        assert_eq!(manager.state().owner.as_deref(), Some("a"));

        manager.release("a");
        assert!(manager.claim("b"));
    }

    #[test]
    fn test_claim_guard_releases_on_drop() {
        let (manager, _) = loopback_manager();
        manager.connect(&config()).unwrap();
        {
            let guard = manager.try_claim("restore").unwrap();
            assert_eq!(guard.owner(), "restore");
            assert!(manager.try_claim("clean").is_none());
        }
        assert!(manager.state().owner.is_none());
        assert!(manager.try_claim("clean").is_some());
    }

    #[test]
    fn test_subscribers_see_every_change() {
        let (manager, _) = loopback_manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = manager.subscribe(move |s| sink.lock().unwrap().push(s.clone()));

        manager.connect(&config()).unwrap();
        manager.set_firmware_version(Some("2.01.32".into()));
        assert!(manager.claim("info"));
        manager.release("info");
        manager.disconnect();
        sub.unsubscribe();
        manager.connect(&config()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        assert!(!seen[0].connected);
        assert!(seen[1].connected);
        assert_eq!(seen[2].firmware_version.as_deref(), Some("2.01.32"));
        assert_eq!(seen[3].owner.as_deref(), Some("info"));
        assert!(seen[4].owner.is_none());
        assert_eq!(seen[5], ConnectionState::default());
    }

    #[test]
    fn test_callback_may_query_manager() {
        let (manager, _) = loopback_manager();
        let observer = manager.clone();
        let observed = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&observed);
        let _sub = manager.subscribe(move |state| {
            assert_eq!(observer.state(), *state);
            count.fetch_add(1, Ordering::SeqCst);
        });
        manager.connect(&config()).unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    fn track_latest(manager: &ConnectionManager) -> (Subscription, Arc<Mutex<Option<ConnectionState>>>) {
        let latest = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&latest);
        let sub = manager.subscribe(move |s| *sink.lock().unwrap() = Some(s.clone()));
        (sub, latest)
    }

    #[test]
    fn test_subscribe_racing_connect_ends_current() {
        for _ in 0..500 {
            let (manager, _) = loopback_manager();
            let barrier = Arc::new(Barrier::new(2));
            let connector = {
                let manager = manager.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.connect(&config()).unwrap();
                })
            };

            barrier.wait();
            let (_sub, latest) = track_latest(&manager);
            connector.join().unwrap();

            assert_eq!(latest.lock().unwrap().as_ref(), Some(&manager.state()));
        }
    }

    #[test]
    fn test_concurrent_changes_arrive_in_order() {
        let (manager, _) = loopback_manager();
        manager.connect(&config()).unwrap();
        let (_sub, latest) = track_latest(&manager);

        let workers: Vec<_> = (0..4)
            .map(|n| {
                let manager = manager.clone();
                thread::spawn(move || {
                    let owner = format!("tool-{n}");
                    for _ in 0..200 {
                        if manager.claim(&owner) {
                            manager.release(&owner);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(latest.lock().unwrap().as_ref(), Some(&manager.state()));
        assert!(manager.state().owner.is_none());
    }
}
