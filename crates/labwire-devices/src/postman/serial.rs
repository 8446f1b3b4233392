/*!
 * Host postman over an OS serial port.
 */
use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info};

use labwire_core::config::PostmanConfig;

use crate::device::{DeviceError, Result};
use crate::postman::framing::{terminate, FrameAssembler};
use crate::postman::{LineReceiver, Postman, SplitPostman};

const READ_CHUNK: usize = 256;

/// A postman on a serial port such as `/dev/ttyACM0` or `COM3`
pub struct SerialPostman {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    config: PostmanConfig,
    port: Option<Box<dyn SerialPort>>,
    assembler: FrameAssembler,
}

impl SerialPostman {
    /// Create a closed postman for `port_name`
    pub fn new<S: Into<String>>(port_name: S, config: &PostmanConfig) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: config.baud_rate,
            timeout: config.timeout(),
            config: config.clone(),
            port: None,
            assembler: FrameAssembler::from_config(config),
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        let name = &self.port_name;
        self.port.as_mut().ok_or_else(|| DeviceError::channel_not_open(name))
    }
}

impl Postman for SerialPostman {
    fn channel_name(&self) -> &str {
        &self.port_name
    }

    fn open_channel(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.timeout)
            .open()?;
        info!("Opened serial port {} at {} baud", self.port_name, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn close_channel(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.port_name);
        }
        self.assembler.flush();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn send(&mut self, value: &str) -> Result<()> {
        let line = terminate(value);
        let port = self.port_mut()?;
        port.write_all(line.as_bytes())?;
        port.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<String>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| DeviceError::channel_not_open(&self.port_name))?;
        read_line(port.as_mut(), &mut self.assembler)
    }
}

impl SplitPostman for SerialPostman {
    fn split_receiver(&mut self) -> Result<Box<dyn LineReceiver>> {
        let reader = self.port_mut()?.try_clone()?;
        Ok(Box::new(SerialReceiver {
            port: reader,
            assembler: FrameAssembler::from_config(&self.config),
        }))
    }
}

/// Receiving half of a [`SerialPostman`], backed by a cloned port handle
pub struct SerialReceiver {
    port: Box<dyn SerialPort>,
    assembler: FrameAssembler,
}

impl LineReceiver for SerialReceiver {
    fn receive(&mut self) -> Result<Option<String>> {
        read_line(self.port.as_mut(), &mut self.assembler)
    }
}

/// One bounded read: the port's own timeout caps how long this waits
fn read_line(port: &mut dyn SerialPort, assembler: &mut FrameAssembler) -> Result<Option<String>> {
    if let Some(line) = assembler.next_line() {
        return Ok(Some(line));
    }

    let mut chunk = [0u8; READ_CHUNK];
    match port.read(&mut chunk) {
        Ok(0) => Ok(None),
        Ok(n) => {
            assembler.push(&chunk[..n]);
            Ok(assembler.next_line())
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
