/*!
 * Line-framed transports.
 *
 * A [`Postman`] turns a byte channel into "send one line / receive one line".
 * `receive()` never blocks past a short configured timeout, which is what lets
 * the firmware's cooperative loop and each host listener thread poll it.
 *
 * Host transports also implement [`SplitPostman`], which hands out an
 * independent receiving half so a listener thread can read while the owning
 * thread keeps writing.
 */
use labwire_core::message::Message;

use crate::device::Result;

pub mod fake;
pub mod framing;
#[cfg(feature = "serial")]
pub mod serial;
pub mod usb;

pub use fake::{FakeLink, FakePostman};
pub use framing::{terminate, FrameAssembler, TERMINATOR};
#[cfg(feature = "serial")]
pub use serial::SerialPostman;
pub use usb::{UsbEndpoint, UsbPostman};

/// The receiving side of a line-framed channel
pub trait LineReceiver: Send {
    /// Return one complete line, or `None` if nothing arrived within the
    /// configured timeout
    fn receive(&mut self) -> Result<Option<String>>;
}

/// A line-framed, fire-and-forget transport
pub trait Postman: Send {
    /// Human-readable channel name for logs
    fn channel_name(&self) -> &str;

    /// Open the underlying channel; opening an open channel is a no-op
    fn open_channel(&mut self) -> Result<()>;

    /// Close the underlying channel and flush buffered input; closing a closed
    /// channel is a no-op
    fn close_channel(&mut self) -> Result<()>;

    /// Whether the channel is open
    fn is_open(&self) -> bool;

    /// Write one line, appending the terminator if it is missing
    ///
    /// There is no acknowledgement and no retry.
    fn send(&mut self, value: &str) -> Result<()>;

    /// Return one complete line, or `None` if nothing arrived within the
    /// configured timeout
    fn receive(&mut self) -> Result<Option<String>>;

    /// Serialize and send a message
    fn send_message(&mut self, message: &Message) -> Result<()> {
        let raw = message.serialize()?;
        self.send(&raw)
    }
}

/// A postman whose receiving half can be moved to another thread
pub trait SplitPostman: Postman {
    /// Create an independent receiver reading from the same channel
    ///
    /// The channel must be open.
    fn split_receiver(&mut self) -> Result<Box<dyn LineReceiver>>;
}
