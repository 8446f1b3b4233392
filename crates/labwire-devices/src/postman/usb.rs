/*!
 * Firmware postman over a USB CDC data endpoint.
 *
 * The board support layer supplies a [`UsbEndpoint`]; this module only adds
 * line framing and the open/closed discipline. All endpoint calls must return
 * immediately so that the postman can be polled from a cooperative loop.
 */
use std::io;

use tracing::debug;

use labwire_core::config::PostmanConfig;

use crate::device::{DeviceError, Result};
use crate::postman::framing::{terminate, FrameAssembler};
use crate::postman::Postman;

const READ_CHUNK: usize = 64;

/// A non-blocking USB serial data endpoint
pub trait UsbEndpoint: Send {
    /// Whether the data interface is enabled in the USB configuration
    fn is_available(&self) -> bool;

    /// Copy whatever bytes are already waiting into `buf`; `Ok(0)` when none
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Queue bytes for the host
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// A postman on a microcontroller's USB data endpoint
pub struct UsbPostman<E: UsbEndpoint> {
    endpoint: E,
    assembler: FrameAssembler,
    open: bool,
}

impl<E: UsbEndpoint> UsbPostman<E> {
    /// Wrap an endpoint; the channel starts closed
    pub fn new(endpoint: E, config: &PostmanConfig) -> Self {
        Self {
            endpoint,
            assembler: FrameAssembler::from_config(config),
            open: false,
        }
    }

    /// The wrapped endpoint
    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// The wrapped endpoint, mutably
    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.endpoint
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(DeviceError::channel_not_open(self.channel_name()))
        }
    }
}

impl<E: UsbEndpoint> Postman for UsbPostman<E> {
    fn channel_name(&self) -> &str {
        "usb-data"
    }

    fn open_channel(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        if !self.endpoint.is_available() {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "USB data endpoint is not enabled",
            )));
        }
        self.open = true;
        debug!("USB data channel open");
        Ok(())
    }

    fn close_channel(&mut self) -> Result<()> {
        self.open = false;
        self.assembler.flush();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn send(&mut self, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.endpoint.write(terminate(value).as_bytes())?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<String>> {
        self.ensure_open()?;
        if let Some(line) = self.assembler.next_line() {
            return Ok(Some(line));
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = match self.endpoint.read_available(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                break;
            }
            self.assembler.push(&chunk[..n]);
            if self.assembler.has_line() {
                break;
            }
        }
        Ok(self.assembler.next_line())
    }
}
