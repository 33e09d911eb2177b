//! Tier 1 send/receive queue: fixed slots, four priority lists, coalescing.
//!
//! Capacity is a power of two fixed at creation; no allocation after that
//! beyond the payloads themselves. Higher priority always drains first, FIFO
//! within a priority. Pushing with a nonzero coalesce key replaces the
//! previous entry with that key in place, keeping its queue position.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::config::DIRECT_THRESHOLD;
use crate::error::{Error, Result};
use crate::wire::MessageKind;

/// Send priority. Order matters: higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

pub const PRIORITY_COUNT: usize = 4;

/// Backpressure bands derived from queue fill ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    None,
    Light,
    Moderate,
    Heavy,
    Blocking,
}

impl PressureLevel {
    pub fn from_percent(pct: u8) -> Self {
        match pct {
            0..=24 => PressureLevel::None,
            25..=49 => PressureLevel::Light,
            50..=74 => PressureLevel::Moderate,
            75..=89 => PressureLevel::Heavy,
            _ => PressureLevel::Blocking,
        }
    }
}

/// One queued message, header fields plus payload.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub kind: MessageKind,
    pub flags: u8,
    /// Wire sequence, assigned when the message is accepted.
    pub sequence: u8,
    pub priority: Priority,
    /// 0 means no coalescing. Keys below 0x0100 are reserved for protocol
    /// control; application keys are `key | (peer_id << 8)`.
    pub coalesce_key: u32,
    pub payload: Vec<u8>,
}

/// Fixed-capacity priority slot queue.
#[derive(Debug)]
pub struct SlotQueue {
    slots: Vec<Option<QueuedMessage>>,
    free: Vec<usize>,
    lists: [VecDeque<usize>; PRIORITY_COUNT],
    coalesce: HashMap<u32, usize>,
    len: usize,
}

impl SlotQueue {
    /// `capacity` must already be a power of two (config sanitizing ensures
    /// this); it is clamped up to 4 slots minimum.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(4);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            free: (0..capacity).rev().collect(),
            lists: Default::default(),
            coalesce: HashMap::new(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill ratio as an integer percentage.
    pub fn pressure_percent(&self) -> u8 {
        (self.len * 100 / self.slots.len()) as u8
    }

    pub fn pressure(&self) -> PressureLevel {
        PressureLevel::from_percent(self.pressure_percent())
    }

    /// Queue a message. Slot payloads are capped at the Tier 2 threshold;
    /// larger messages belong in the direct buffer.
    ///
    /// Admission narrows with pressure: at 75% and above only High and
    /// Critical are accepted. A coalesce replacement never grows the queue
    /// and is always accepted.
    pub fn push(&mut self, msg: QueuedMessage) -> Result<()> {
        if msg.payload.len() > DIRECT_THRESHOLD {
            return Err(Error::MessageTooLarge);
        }
        if msg.coalesce_key != 0 {
            if let Some(&idx) = self.coalesce.get(&msg.coalesce_key) {
                debug!(key = msg.coalesce_key, slot = idx, "coalesced queued message");
                self.slots[idx] = Some(msg);
                return Ok(());
            }
        }
        let pct = self.pressure_percent();
        if pct >= 75 && msg.priority < Priority::High {
            return Err(Error::Backpressure);
        }
        let idx = self.free.pop().ok_or(Error::BufferFull)?;
        self.lists[msg.priority as usize].push_back(idx);
        if msg.coalesce_key != 0 {
            self.coalesce.insert(msg.coalesce_key, idx);
        }
        self.slots[idx] = Some(msg);
        self.len += 1;
        Ok(())
    }

    fn front_index(&self) -> Option<usize> {
        self.lists.iter().rev().find_map(|l| l.front().copied())
    }

    /// Borrow the next message to send without removing it. The caller
    /// frames and writes it, then calls [`SlotQueue::commit`]; on a partial
    /// or failed write it simply does not commit and the entry stays put.
    pub fn peek(&self) -> Option<&QueuedMessage> {
        self.front_index().and_then(|i| self.slots[i].as_ref())
    }

    /// Remove and return the entry last returned by [`SlotQueue::peek`].
    pub fn commit(&mut self) -> Option<QueuedMessage> {
        let list = self.lists.iter_mut().rev().find(|l| !l.is_empty())?;
        let idx = list.pop_front()?;
        let msg = self.slots[idx].take()?;
        if msg.coalesce_key != 0 {
            self.coalesce.remove(&msg.coalesce_key);
        }
        self.free.push(idx);
        self.len -= 1;
        Some(msg)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.free = (0..self.slots.len()).rev().collect();
        for l in &mut self.lists {
            l.clear();
        }
        self.coalesce.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(priority: Priority, key: u32, byte: u8) -> QueuedMessage {
        QueuedMessage {
            kind: MessageKind::Data,
            flags: 0,
            sequence: 0,
            priority,
            coalesce_key: key,
            payload: vec![byte],
        }
    }

    #[test]
    fn drains_by_priority_then_fifo() {
        let mut q = SlotQueue::new(8);
        q.push(msg(Priority::Low, 0, 1)).unwrap();
        q.push(msg(Priority::Critical, 0, 2)).unwrap();
        q.push(msg(Priority::Normal, 0, 3)).unwrap();
        q.push(msg(Priority::Normal, 0, 4)).unwrap();
        let order: Vec<u8> = std::iter::from_fn(|| q.commit())
            .map(|m| m.payload[0])
            .collect();
        assert_eq!(order, vec![2, 3, 4, 1]);
    }

    #[test]
    fn coalesce_replaces_in_place() {
        let mut q = SlotQueue::new(8);
        q.push(msg(Priority::Normal, 0x0100, 1)).unwrap();
        q.push(msg(Priority::Normal, 0, 2)).unwrap();
        q.push(msg(Priority::Normal, 0x0100, 3)).unwrap();
        assert_eq!(q.len(), 2);
        // Replacement kept the original queue position.
        assert_eq!(q.commit().unwrap().payload, vec![3]);
        assert_eq!(q.commit().unwrap().payload, vec![2]);
    }

    #[test]
    fn full_queue_rejects_then_recovers() {
        let mut q = SlotQueue::new(4);
        for i in 0..4 {
            q.push(msg(Priority::Critical, 0, i)).unwrap();
        }
        assert_eq!(q.push(msg(Priority::Critical, 0, 9)), Err(Error::BufferFull));
        q.commit().unwrap();
        q.push(msg(Priority::Critical, 0, 9)).unwrap();
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn admission_narrows_under_pressure() {
        let mut q = SlotQueue::new(4);
        for i in 0..3 {
            q.push(msg(Priority::High, 0, i)).unwrap();
        }
        // 75% full: Normal and Low are refused, High still admitted.
        assert_eq!(q.pressure_percent(), 75);
        assert_eq!(q.push(msg(Priority::Normal, 0, 9)), Err(Error::Backpressure));
        assert_eq!(q.push(msg(Priority::Low, 0, 9)), Err(Error::Backpressure));
        q.push(msg(Priority::High, 0, 9)).unwrap();
    }

    #[test]
    fn oversized_payload_refused() {
        let mut q = SlotQueue::new(4);
        let mut m = msg(Priority::Normal, 0, 0);
        m.payload = vec![0; DIRECT_THRESHOLD + 1];
        assert_eq!(q.push(m), Err(Error::MessageTooLarge));
    }

    #[test]
    fn peek_does_not_remove() {
        let mut q = SlotQueue::new(4);
        q.push(msg(Priority::Normal, 0, 7)).unwrap();
        assert_eq!(q.peek().unwrap().payload, vec![7]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.commit().unwrap().payload, vec![7]);
        assert!(q.peek().is_none());
    }

    #[test]
    fn pressure_levels() {
        assert_eq!(PressureLevel::from_percent(0), PressureLevel::None);
        assert_eq!(PressureLevel::from_percent(25), PressureLevel::Light);
        assert_eq!(PressureLevel::from_percent(50), PressureLevel::Moderate);
        assert_eq!(PressureLevel::from_percent(75), PressureLevel::Heavy);
        assert_eq!(PressureLevel::from_percent(90), PressureLevel::Blocking);
        assert_eq!(PressureLevel::from_percent(100), PressureLevel::Blocking);
    }
}
