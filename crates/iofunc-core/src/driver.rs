// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage behind the attributes

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::attr::{AttrFlags, AttrState};
use crate::error::{IoFuncError, IoResult};
use crate::notify::NotifyCond;
use crate::types::{is_fifo, Ino};

/// What a driver sees of a node when asked to move data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub ino: Ino,
    pub mode: u32,
    pub size: u64,
    pub writers: u32,
}

impl NodeInfo {
    pub(crate) fn of(ino: Ino, state: &AttrState) -> Self {
        Self {
            ino,
            mode: state.mode,
            size: state.size,
            writers: state.counts().writers,
        }
    }

    pub fn is_fifo(&self) -> bool {
        is_fifo(self.mode)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes read; empty at end of file
    Data(Vec<u8>),
    /// Nothing available yet
    WouldBlock,
}

/// Data path of a resource manager.
///
/// Called with the attribute lock held.
pub trait Driver: Send + Sync {
    fn read_at(&self, node: &NodeInfo, offset: u64, nbytes: usize) -> IoResult<ReadOutcome>;

    /// Returns the number of bytes accepted
    fn write_at(&self, node: &NodeInfo, offset: u64, data: &[u8]) -> IoResult<usize>;

    fn resize(&self, node: &NodeInfo, size: u64) -> IoResult<()>;

    /// Zero a byte range without changing the size. The default writes
    /// bounded chunks through `write_at`.
    fn zero_range(&self, node: &NodeInfo, offset: u64, len: u64) -> IoResult<()> {
        let zeros = [0u8; 4096];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(zeros.len() as u64) as usize;
            let written = self.write_at(node, offset + done, &zeros[..n])?;
            if written == 0 {
                return Err(IoFuncError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            done += written as u64;
        }
        Ok(())
    }

    /// Conditions currently satisfied, for notify
    fn readiness(&self, node: &NodeInfo) -> NotifyCond;

    /// Units of input available, compared against notify thresholds
    fn input_count(&self, node: &NodeInfo) -> u32 {
        u32::from(self.readiness(node).contains(NotifyCond::INPUT))
    }

    /// Persist dirty metadata; returns the bits that are now durable
    fn flush(&self, _node: &NodeInfo, dirty: AttrFlags) -> IoResult<AttrFlags> {
        Ok(dirty)
    }
}

/// Largest single transfer the memory driver hands out; longer reads are short
pub const MAX_TRANSFER: usize = 1 << 20;

const PAGE_SIZE: u64 = 4096;

/// One node's bytes. Regular files are paged and sparse: pages never
/// written read back as zeros.
#[derive(Debug, Default)]
struct Contents {
    /// FIFO data not yet consumed
    queue: Vec<u8>,
    pages: BTreeMap<u64, Box<[u8]>>,
    /// End of the furthest byte written or resized to
    len: u64,
}

impl Contents {
    fn read(&self, offset: u64, nbytes: usize, size: u64) -> IoResult<Vec<u8>> {
        let end = size.min(self.len);
        if offset >= end {
            return Ok(Vec::new());
        }
        let n = usize::try_from(end - offset).unwrap_or(usize::MAX).min(nbytes.min(MAX_TRANSFER));
        let mut buf = Vec::new();
        buf.try_reserve_exact(n).map_err(|_| IoFuncError::NoMemory)?;
        let mut pos = offset;
        while buf.len() < n {
            let at = (pos % PAGE_SIZE) as usize;
            let take = (PAGE_SIZE as usize - at).min(n - buf.len());
            match self.pages.get(&(pos / PAGE_SIZE)) {
                Some(page) => buf.extend_from_slice(&page[at..at + take]),
                None => buf.resize(buf.len() + take, 0),
            }
            pos += take as u64;
        }
        Ok(buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> IoResult<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(IoFuncError::InvalidArgument)?;
        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let at = (pos % PAGE_SIZE) as usize;
            let take = (PAGE_SIZE as usize - at).min(rest.len());
            let page = self
                .pages
                .entry(pos / PAGE_SIZE)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page[at..at + take].copy_from_slice(&rest[..take]);
            rest = &rest[take..];
            pos += take as u64;
        }
        self.len = self.len.max(end);
        Ok(())
    }

    /// Zero `[offset, end)`, dropping the pages it covers entirely.
    fn zero(&mut self, offset: u64, end: u64) {
        let first = offset / PAGE_SIZE;
        let last = end.div_ceil(PAGE_SIZE);
        let touched: Vec<u64> = self.pages.range(first..last).map(|(index, _)| *index).collect();
        for index in touched {
            let page_start = index * PAGE_SIZE;
            let from = offset.max(page_start) - page_start;
            let to = end.min(page_start + PAGE_SIZE) - page_start;
            if from == 0 && to == PAGE_SIZE {
                self.pages.remove(&index);
            } else if let Some(page) = self.pages.get_mut(&index) {
                page[from as usize..to as usize].fill(0);
            }
        }
    }

    fn truncate(&mut self, size: u64) {
        if size < self.len {
            let keep = size.div_ceil(PAGE_SIZE);
            self.pages.retain(|index, _| *index < keep);
            self.zero(size, keep.saturating_mul(PAGE_SIZE));
        }
        self.len = size;
    }
}

/// Keeps node contents in memory. FIFO nodes hand data out once.
#[derive(Debug, Default)]
pub struct MemDriver {
    contents: Mutex<HashMap<Ino, Contents>>,
}

impl MemDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current bytes of a node, for inspection. Holes come back as zeros.
    pub fn contents(&self, ino: Ino) -> Vec<u8> {
        let contents = self.contents.lock().unwrap();
        let Some(node) = contents.get(&ino) else {
            return Vec::new();
        };
        if !node.queue.is_empty() {
            return node.queue.clone();
        }
        let len = usize::try_from(node.len).unwrap_or(usize::MAX);
        let mut buf = vec![0u8; len];
        for (index, page) in &node.pages {
            let start = (index * PAGE_SIZE) as usize;
            let end = (start + page.len()).min(len);
            buf[start..end].copy_from_slice(&page[..end - start]);
        }
        buf
    }

    /// Pages backing a regular file
    pub fn resident_pages(&self, ino: Ino) -> usize {
        self.contents.lock().unwrap().get(&ino).map_or(0, |c| c.pages.len())
    }
}

impl Driver for MemDriver {
    fn read_at(&self, node: &NodeInfo, offset: u64, nbytes: usize) -> IoResult<ReadOutcome> {
        let mut contents = self.contents.lock().unwrap();
        let data = contents.entry(node.ino).or_default();
        if node.is_fifo() {
            if data.queue.is_empty() {
                return Ok(if node.writers == 0 {
                    ReadOutcome::Data(Vec::new())
                } else {
                    ReadOutcome::WouldBlock
                });
            }
            let n = nbytes.min(data.queue.len());
            return Ok(ReadOutcome::Data(data.queue.drain(..n).collect()));
        }
        data.read(offset, nbytes, node.size).map(ReadOutcome::Data)
    }

    fn write_at(&self, node: &NodeInfo, offset: u64, data: &[u8]) -> IoResult<usize> {
        let mut contents = self.contents.lock().unwrap();
        let buf = contents.entry(node.ino).or_default();
        if node.is_fifo() {
            buf.queue
                .try_reserve(data.len())
                .map_err(|_| IoFuncError::NoMemory)?;
            buf.queue.extend_from_slice(data);
            return Ok(data.len());
        }
        buf.write(offset, data)?;
        Ok(data.len())
    }

    fn resize(&self, node: &NodeInfo, size: u64) -> IoResult<()> {
        self.contents.lock().unwrap().entry(node.ino).or_default().truncate(size);
        Ok(())
    }

    fn zero_range(&self, node: &NodeInfo, offset: u64, len: u64) -> IoResult<()> {
        let end = offset.checked_add(len).ok_or(IoFuncError::InvalidArgument)?;
        self.contents.lock().unwrap().entry(node.ino).or_default().zero(offset, end);
        Ok(())
    }

    fn readiness(&self, node: &NodeInfo) -> NotifyCond {
        let writable = NotifyCond::OUTPUT | NotifyCond::WRNORM;
        if !node.is_fifo() {
            return NotifyCond::INPUT | NotifyCond::RDNORM | writable;
        }
        let buffered = self
            .contents
            .lock()
            .unwrap()
            .get(&node.ino)
            .is_some_and(|c| !c.queue.is_empty());
        if buffered {
            NotifyCond::INPUT | NotifyCond::RDNORM | writable
        } else {
            writable
        }
    }

    fn input_count(&self, node: &NodeInfo) -> u32 {
        let contents = self.contents.lock().unwrap();
        let len = contents.get(&node.ino).map_or(0, |c| c.queue.len());
        u32::try_from(len).unwrap_or(u32::MAX)
    }
}
