/*!
 * In-memory postman for protocol tests.
 *
 * [`FakePostman`] replays scripted inbound chunks and records every outbound
 * line verbatim. The script and the record live in a [`FakeLink`] that the
 * test keeps a clone of, so it can feed and inspect the wire while the postman
 * is owned by a machine or a device manager.
 */
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use labwire_core::message::Message;

use crate::device::{DeviceError, Result};
use crate::postman::framing::{terminate, FrameAssembler};
use crate::postman::{LineReceiver, Postman, SplitPostman};

#[derive(Debug)]
enum Chunk {
    Bytes(Vec<u8>),
    Failure(String),
}

#[derive(Debug, Default)]
struct Wire {
    inbound: VecDeque<Chunk>,
    outbound: Vec<String>,
    refuse_open: bool,
    opens: usize,
    closes: usize,
}

/// Test-side handle onto a fake wire
#[derive(Debug, Clone, Default)]
pub struct FakeLink {
    wire: Arc<Mutex<Wire>>,
}

impl FakeLink {
    fn lock(&self) -> MutexGuard<'_, Wire> {
        self.wire.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a raw chunk of inbound bytes, delivered on one `receive()` call
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.lock().inbound.push_back(Chunk::Bytes(bytes.to_vec()));
    }

    /// Queue one inbound line
    pub fn push_line(&self, line: &str) {
        self.push_bytes(terminate(line).as_bytes());
    }

    /// Queue one inbound message
    pub fn push_message(&self, message: &Message) {
        let raw = message.serialize().unwrap_or_default();
        self.push_line(&raw);
    }

    /// Make the next `receive()` that reaches this point fail with an I/O error
    pub fn inject_error(&self, detail: &str) {
        self.lock().inbound.push_back(Chunk::Failure(detail.to_string()));
    }

    /// Make every subsequent `open_channel()` fail
    pub fn refuse_open(&self, refuse: bool) {
        self.lock().refuse_open = refuse;
    }

    /// Number of inbound chunks not yet consumed
    pub fn pending_inbound(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Every line sent so far, terminator included
    pub fn sent(&self) -> Vec<String> {
        self.lock().outbound.clone()
    }

    /// Take and clear the sent lines
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.lock().outbound)
    }

    /// Decode every sent line that parses as a message
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent().iter().filter_map(|line| Message::parse(line).ok()).collect()
    }

    /// Take, clear and decode the sent messages
    pub fn take_sent_messages(&self) -> Vec<Message> {
        self.take_sent().iter().filter_map(|line| Message::parse(line).ok()).collect()
    }

    /// How many times the channel was opened
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// How many times the channel was closed
    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    /// Pull the next chunk into `assembler` and return a completed line
    fn receive_into(&self, assembler: &mut FrameAssembler) -> Result<Option<String>> {
        if let Some(line) = assembler.next_line() {
            return Ok(Some(line));
        }
        let chunk = self.lock().inbound.pop_front();
        match chunk {
            Some(Chunk::Bytes(bytes)) => {
                assembler.push(&bytes);
                Ok(assembler.next_line())
            }
            Some(Chunk::Failure(detail)) => Err(DeviceError::Io(io::Error::new(io::ErrorKind::Other, detail))),
            None => Ok(None),
        }
    }
}

/// An in-memory postman
#[derive(Debug, Default)]
pub struct FakePostman {
    link: FakeLink,
    assembler: FrameAssembler,
    open: bool,
}

impl FakePostman {
    /// Create a fake postman on a fresh wire
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fake postman on an existing wire
    pub fn on(link: FakeLink) -> Self {
        Self {
            link,
            assembler: FrameAssembler::default(),
            open: false,
        }
    }

    /// Handle onto this postman's wire
    pub fn link(&self) -> FakeLink {
        self.link.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(DeviceError::channel_not_open(self.channel_name()))
        }
    }
}

impl Postman for FakePostman {
    fn channel_name(&self) -> &str {
        "fake"
    }

    fn open_channel(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        let mut wire = self.link.lock();
        if wire.refuse_open {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "fake channel refused to open",
            )));
        }
        wire.opens += 1;
        drop(wire);
        self.open = true;
        Ok(())
    }

    fn close_channel(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.assembler.flush();
            self.link.lock().closes += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn send(&mut self, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.link.lock().outbound.push(terminate(value));
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<String>> {
        self.ensure_open()?;
        self.link.receive_into(&mut self.assembler)
    }
}

impl SplitPostman for FakePostman {
    fn split_receiver(&mut self) -> Result<Box<dyn LineReceiver>> {
        self.ensure_open()?;
        Ok(Box::new(FakeReceiver {
            link: self.link.clone(),
            assembler: FrameAssembler::default(),
        }))
    }
}

/// Receiving half of a [`FakePostman`]
#[derive(Debug)]
pub struct FakeReceiver {
    link: FakeLink,
    assembler: FrameAssembler,
}

impl LineReceiver for FakeReceiver {
    fn receive(&mut self) -> Result<Option<String>> {
        self.link.receive_into(&mut self.assembler)
    }
}
