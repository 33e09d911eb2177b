//! Tier 2 direct buffer: one large framed message in flight per direction.
//!
//! Messages above the slot threshold bypass Tier 1 and stage here fully
//! framed. Partial socket writes advance an offset, so a message survives
//! any number of short writes without copying.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectState {
    Idle,
    /// Framed and waiting for the socket to become writable.
    Ready,
    /// Partially written; only completion or connection teardown clears it.
    Sending,
}

#[derive(Debug)]
pub struct DirectBuffer {
    buf: Vec<u8>,
    len: usize,
    sent: usize,
    state: DirectState,
    /// Engine-side tag identifying what this buffer carries (plain message
    /// or a fragment of which transfer).
    tag: u32,
}

impl DirectBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            len: 0,
            sent: 0,
            state: DirectState::Idle,
            tag: 0,
        }
    }

    pub fn state(&self) -> DirectState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == DirectState::Idle
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Stage a framed message. One at a time: a second queue attempt while
    /// the buffer is occupied returns `WouldBlock` and the caller retries on
    /// a later service cycle.
    pub fn queue(&mut self, frame: &[u8], tag: u32) -> Result<()> {
        if self.state != DirectState::Idle {
            return Err(Error::WouldBlock);
        }
        if frame.len() > self.buf.len() {
            return Err(Error::MessageTooLarge);
        }
        self.buf[..frame.len()].copy_from_slice(frame);
        self.len = frame.len();
        self.sent = 0;
        self.tag = tag;
        self.state = DirectState::Ready;
        Ok(())
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.sent..self.len]
    }

    /// Record `n` bytes written. Returns true when the message completed,
    /// leaving the buffer idle again.
    pub fn advance(&mut self, n: usize) -> Result<bool> {
        if self.state == DirectState::Idle {
            return Err(Error::InvalidState);
        }
        if n > self.len - self.sent {
            return Err(Error::InvalidParam);
        }
        self.sent += n;
        if self.sent == self.len {
            self.state = DirectState::Idle;
            self.len = 0;
            self.sent = 0;
            Ok(true)
        } else {
            self.state = DirectState::Sending;
            Ok(false)
        }
    }

    /// Drop a staged message that has not touched the wire. A partially
    /// written message cannot be cancelled without corrupting the stream.
    pub fn cancel(&mut self) -> Result<()> {
        match self.state {
            DirectState::Idle => Err(Error::QueueEmpty),
            DirectState::Sending => Err(Error::InvalidState),
            DirectState::Ready => {
                self.state = DirectState::Idle;
                self.len = 0;
                self.sent = 0;
                Ok(())
            }
        }
    }

    /// Teardown path: clears regardless of state.
    pub fn reset(&mut self) {
        self.state = DirectState::Idle;
        self.len = 0;
        self.sent = 0;
        self.tag = 0;
    }
}
