//! Per-frame buffer lifetime tracking.
//!
//! Every buffer handed out during a frame carries the number of kernel executions
//! that still have to touch it. When that count reaches zero an ephemeral buffer goes
//! back to the free list for its descriptor and may be handed to a later node of the
//! same frame. Durable buffers are tracked the same way but never recycled.

use std::collections::HashMap;

use crate::{device::BufferDesc, Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferId(usize);

#[derive(Debug)]
struct Entry<B> {
    buffer: B,
    desc: BufferDesc,
    pending: usize,
    live: bool,
    durable: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Buffers requested from the device.
    pub allocated: usize,
    /// Requests served from the free list.
    pub reused: usize,
    pub released: usize,
}

#[derive(Debug)]
pub struct FramePool<B> {
    entries: Vec<Entry<B>>,
    free: HashMap<BufferDesc, Vec<BufferId>>,
    stats: FrameStats,
}

impl<B> Default for FramePool<B> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: HashMap::new(),
            stats: FrameStats::default(),
        }
    }
}

impl<B> FramePool<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// An ephemeral buffer for `desc` that must survive `pending` more uses.
    pub fn acquire(
        &mut self,
        desc: BufferDesc,
        pending: usize,
        allocate: impl FnOnce(&BufferDesc) -> Result<B>,
    ) -> Result<BufferId> {
        if pending == 0 {
            return Err(Error::invariant(format!(
                "acquired a {} buffer nobody will use",
                desc.dims
            )));
        }
        if let Some(id) = self.free.get_mut(&desc).and_then(|ids| ids.pop()) {
            let entry = &mut self.entries[id.0];
            entry.pending = pending;
            entry.live = true;
            self.stats.reused += 1;
            return Ok(id);
        }
        let buffer = allocate(&desc)?;
        self.stats.allocated += 1;
        Ok(self.push(buffer, desc, pending, false))
    }

    /// Track a buffer owned elsewhere. It is never recycled.
    pub fn adopt(&mut self, buffer: B, desc: BufferDesc, pending: usize) -> BufferId {
        self.push(buffer, desc, pending, true)
    }

    fn push(&mut self, buffer: B, desc: BufferDesc, pending: usize, durable: bool) -> BufferId {
        self.entries.push(Entry {
            buffer,
            desc,
            pending,
            live: true,
            durable,
        });
        BufferId(self.entries.len() - 1)
    }

    fn entry(&self, id: BufferId) -> Result<&Entry<B>> {
        let entry = self
            .entries
            .get(id.0)
            .ok_or_else(|| Error::invariant(format!("unknown buffer {id:?}")))?;
        if !entry.live {
            return Err(Error::invariant(format!(
                "buffer {id:?} used after it was released"
            )));
        }
        Ok(entry)
    }

    pub fn buffer(&self, id: BufferId) -> Result<&B> {
        self.entry(id).map(|e| &e.buffer)
    }

    pub fn pending(&self, id: BufferId) -> Result<usize> {
        self.entry(id).map(|e| e.pending)
    }

    /// Record one finished use. Returns whether the buffer was released.
    pub fn consume(&mut self, id: BufferId) -> Result<bool> {
        self.entry(id)?;
        let entry = &mut self.entries[id.0];
        if entry.pending == 0 {
            return Err(Error::invariant(format!(
                "pending count of buffer {id:?} would drop below zero"
            )));
        }
        entry.pending -= 1;
        if entry.pending > 0 || entry.durable {
            return Ok(false);
        }
        entry.live = false;
        self.free.entry(entry.desc).or_default().push(id);
        self.stats.released += 1;
        Ok(true)
    }

    /// Sum of pending counts over all live buffers.
    pub fn outstanding(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.live)
            .map(|e| e.pending)
            .sum()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }
}
