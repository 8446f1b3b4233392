/*!
 * Host-side connection manager.
 *
 * The [`DeviceManager`] owns one [`Device`] per connected port and one
 * listener thread per device. Listener threads only read: they decode frames
 * and push [`DeviceEvent`]s into a single bounded channel. Everything else
 * (sending, draining events, updating the cached device model) happens on the
 * thread that owns the manager.
 *
 * Within one port, events arrive in read order. Across ports there is no
 * ordering guarantee. When the channel is full a listener blocks, re-checking
 * its stop flag between attempts, so no event is dropped and a disconnect can
 * still end the thread.
 */
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use labwire_core::config::ManagerConfig;
use labwire_core::logging::component_span;
use labwire_core::message::Message;

use crate::device::{Device, DeviceError, Result};
use crate::discovery::{DeviceDiscovery, PortInfo};
use crate::postman::{LineReceiver, SplitPostman};

/// Interval at which a blocked listener re-checks its stop flag
const DELIVERY_RETRY: Duration = Duration::from_millis(50);

/// Builds a closed postman for a port
pub type PostmanFactory = Box<dyn Fn(&PortInfo) -> Box<dyn SplitPostman> + Send>;

/// One item of the merged inbound stream
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A frame that decoded into a message
    Recv {
        /// Source port
        port: String,
        /// Decoded message
        message: Message,
    },
    /// A frame that did not decode
    Raw {
        /// Source port
        port: String,
        /// The frame as received
        raw: String,
    },
    /// The listener failed and exited; the device stays connected until
    /// [`DeviceManager::disconnect_device`] is called
    Error {
        /// Source port
        port: String,
        /// Failure description
        detail: String,
    },
}

impl DeviceEvent {
    /// Port the event came from
    pub fn port(&self) -> &str {
        match self {
            DeviceEvent::Recv { port, .. } | DeviceEvent::Raw { port, .. } | DeviceEvent::Error { port, .. } => port,
        }
    }

    /// Short tag for logs
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceEvent::Recv { .. } => "RECV",
            DeviceEvent::Raw { .. } => "RAW",
            DeviceEvent::Error { .. } => "ERROR",
        }
    }
}

struct Listener {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Extension trait for timeout-capable thread joins
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> bool;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    /// Returns `false` if the thread did not finish in time; it is then left
    /// to exit on its own.
    fn join_timeout(self, timeout: Duration) -> bool {
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = tx.send(self.join().is_ok());
        });
        match rx.recv_timeout(timeout) {
            Ok(clean) => {
                if !clean {
                    warn!("Listener thread panicked before joining");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// Manages the connected instruments of one host process
pub struct DeviceManager {
    config: ManagerConfig,
    factory: PostmanFactory,
    discovery: Option<Box<dyn DeviceDiscovery>>,
    devices: HashMap<String, Device>,
    listeners: HashMap<String, Listener>,
    event_tx: Sender<DeviceEvent>,
    event_rx: Receiver<DeviceEvent>,
}

impl DeviceManager {
    /// Create a manager that opens serial ports with the given transport settings
    #[cfg(feature = "serial")]
    pub fn new(config: ManagerConfig, postman: labwire_core::config::PostmanConfig) -> Self {
        let factory: PostmanFactory = Box::new(move |info: &PortInfo| {
            Box::new(crate::postman::SerialPostman::new(info.port.clone(), &postman)) as Box<dyn SplitPostman>
        });
        Self::with_factory(config, factory).with_discovery(crate::discovery::SerialDiscovery::new())
    }

    /// Create a manager with a custom postman factory
    pub fn with_factory(config: ManagerConfig, factory: PostmanFactory) -> Self {
        let (event_tx, event_rx) = crossbeam_channel::bounded(config.queue_capacity.max(1));
        Self {
            config,
            factory,
            discovery: None,
            devices: HashMap::new(),
            listeners: HashMap::new(),
            event_tx,
            event_rx,
        }
    }

    /// Use a discovery provider for [`DeviceManager::scan_for_devices`]
    pub fn with_discovery<D: DeviceDiscovery + 'static>(mut self, discovery: D) -> Self {
        self.discovery = Some(Box::new(discovery));
        self
    }

    /// List candidate ports through the configured discovery provider
    pub fn scan_for_devices(&self) -> Result<Vec<PortInfo>> {
        match &self.discovery {
            Some(discovery) => discovery.scan(),
            None => Err(DeviceError::other("No discovery provider configured")),
        }
    }

    /// Open a port and start listening to it
    ///
    /// Returns `false`, leaving no thread or bookkeeping behind, if the port
    /// is already connected or cannot be opened.
    pub fn connect_device(&mut self, port: &str, vid: u16, pid: u16) -> bool {
        if self.devices.contains_key(port) {
            warn!("Device {} is already connected", port);
            return false;
        }

        let info = PortInfo::new(port, vid, pid);
        let mut postman = (self.factory)(&info);

        if let Err(e) = postman.open_channel() {
            error!("Failed to open {}: {}", info, e);
            return false;
        }
        let receiver = match postman.split_receiver() {
            Ok(receiver) => receiver,
            Err(e) => {
                error!("Failed to split receiver for {}: {}", info, e);
                let _ = postman.close_channel();
                return false;
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let spawned = thread::Builder::new()
            .name(format!("labwire-listener-{}", port))
            .spawn({
                let port = port.to_string();
                let tx = self.event_tx.clone();
                let stop = stop.clone();
                let poll = self.config.poll_interval();
                move || listen(port, receiver, tx, stop, poll)
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn listener for {}: {}", info, e);
                let _ = postman.close_channel();
                return false;
            }
        };

        info!("Connected {}", info);
        self.listeners.insert(port.to_string(), Listener { stop, handle });
        self.devices.insert(port.to_string(), Device::new(info, postman));
        true
    }

    /// Stop listening to a port, close it and forget it
    ///
    /// Returns `false` if the port was not connected.
    pub fn disconnect_device(&mut self, port: &str) -> bool {
        let listener = self.listeners.remove(port);
        let device = self.devices.remove(port);
        if listener.is_none() && device.is_none() {
            return false;
        }

        if let Some(listener) = listener {
            listener.stop.store(true, Ordering::Release);
            if !listener.handle.join_timeout(self.config.join_timeout()) {
                warn!(
                    "Listener for {} did not stop within {:?}, continuing",
                    port,
                    self.config.join_timeout()
                );
            }
        }

        if let Some(device) = device {
            let mut postman = device.into_postman();
            if let Err(e) = postman.close_channel() {
                warn!("Error closing {}: {}", port, e);
            }
        }

        info!("Disconnected {}", port);
        true
    }

    /// Disconnect every device
    pub fn disconnect_all(&mut self) {
        let ports: Vec<String> = self.devices.keys().cloned().collect();
        for port in ports {
            self.disconnect_device(&port);
        }
    }

    /// Write a message to a device on the calling thread
    pub fn send_message(&mut self, port: &str, message: &Message) -> Result<()> {
        let device = self
            .devices
            .get_mut(port)
            .ok_or_else(|| DeviceError::NotConnected(port.to_string()))?;
        device.postman().send_message(message).map_err(|e| {
            warn!("Failed to send to {}: {}", port, e);
            e
        })
    }

    /// Wait up to `timeout` for the next event
    pub fn next_event(&self, timeout: Duration) -> Option<DeviceEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Take the next event if one is waiting
    pub fn try_next_event(&self) -> Option<DeviceEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Iterate over the events waiting right now
    pub fn events(&self) -> impl Iterator<Item = DeviceEvent> + '_ {
        self.event_rx.try_iter()
    }

    /// Fold an event into the cached device model
    ///
    /// Events from ports that are no longer connected are ignored.
    pub fn apply_event(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Recv { port, message } => {
                if let Some(device) = self.devices.get_mut(port) {
                    device.observe(message);
                }
            }
            DeviceEvent::Raw { port, raw } => debug!("Unparsed frame from {}: {}", port, raw),
            DeviceEvent::Error { port, detail } => warn!("Listener for {} failed: {}", port, detail),
        }
    }

    /// Cached model of a connected device
    pub fn device(&self, port: &str) -> Option<&Device> {
        self.devices.get(port)
    }

    /// Cached models of every connected device
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Whether a port is connected
    pub fn is_connected(&self, port: &str) -> bool {
        self.devices.contains_key(port)
    }

    /// Names of the connected ports
    pub fn connected_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.devices.keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Whether a listener is registered for the port
    pub fn has_listener(&self, port: &str) -> bool {
        self.listeners.contains_key(port)
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("config", &self.config)
            .field("devices", &self.devices)
            .field("queued_events", &self.event_rx.len())
            .finish()
    }
}

/// Body of a listener thread
fn listen(
    port: String,
    mut receiver: Box<dyn LineReceiver>,
    tx: Sender<DeviceEvent>,
    stop: Arc<AtomicBool>,
    poll: Duration,
) {
    let span = component_span("listener", Some(&port));
    let _entered = span.enter();
    debug!("Listener started");

    while !stop.load(Ordering::Acquire) {
        let received = panic::catch_unwind(AssertUnwindSafe(|| receiver.receive()))
            .unwrap_or_else(|_| Err(DeviceError::other("receiver panicked")));

        match received {
            Ok(Some(raw)) => {
                let event = match Message::parse(&raw) {
                    Ok(message) => DeviceEvent::Recv {
                        port: port.clone(),
                        message,
                    },
                    Err(e) => {
                        debug!("Malformed frame: {}", e);
                        DeviceEvent::Raw {
                            port: port.clone(),
                            raw,
                        }
                    }
                };
                if !deliver(&tx, event, &stop) {
                    break;
                }
            }
            Ok(None) => thread::sleep(poll),
            Err(e) => {
                error!("Listener failed: {}", e);
                let event = DeviceEvent::Error {
                    port: port.clone(),
                    detail: e.to_string(),
                };
                deliver(&tx, event, &stop);
                break;
            }
        }
    }

    debug!("Listener stopped");
}

/// Push an event, blocking while the channel is full
///
/// Returns `false` if the listener should exit instead.
fn deliver(tx: &Sender<DeviceEvent>, mut event: DeviceEvent, stop: &AtomicBool) -> bool {
    loop {
        match tx.send_timeout(event, DELIVERY_RETRY) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => {
                if stop.load(Ordering::Acquire) {
                    return false;
                }
                event = returned;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}
