/*!
 * LabWire Devices
 *
 * This crate provides the transports that carry LabWire messages, port
 * discovery, and the host-side manager that listens to many instruments at
 * once.
 */

#![warn(missing_docs)]

// Re-export core types
pub use labwire_core::prelude;

pub mod device;
pub mod discovery;
pub mod manager;
pub mod postman;

pub use device::{Device, DeviceError, Result};
pub use discovery::{DeviceDiscovery, PortInfo, StaticDiscovery};
pub use manager::{DeviceEvent, DeviceManager, PostmanFactory};
pub use postman::{FakeLink, FakePostman, LineReceiver, Postman, SplitPostman, UsbEndpoint, UsbPostman};

#[cfg(feature = "serial")]
pub use discovery::SerialDiscovery;
#[cfg(feature = "serial")]
pub use postman::SerialPostman;

/// LabWire devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> std::result::Result<(), labwire_core::error::Error> {
    tracing::info!("LabWire Devices {} initialized", VERSION);
    Ok(())
}

/// Names of the transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["fake", "usb"];

    #[cfg(feature = "serial")]
    transports.push("serial");

    transports
}
