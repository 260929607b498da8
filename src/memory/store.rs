//! Persistent memory image: paged bytes, stack and heap regions, access log.
//!
//! The image is a page table of `Arc`-shared 256-byte pages, updated
//! copy-on-write, so cloning a store is a handful of pointer bumps and a
//! write never disturbs the clones that older machine states still hold.
//! Freed heap blocks are tombstoned rather than removed: the machine traps
//! on touching them, while inspection can still read what they held.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::log::{AccessKind, AccessSummary, MemoryLog};
use super::{decode_scalar, encode_scalar, Reference, Scalar};

/// Lowest mapped address; everything below it reads as a null access.
pub const STACK_BASE: u64 = 0x4;

const PAGE_SIZE: u64 = 256;

type Page = [u8; PAGE_SIZE as usize];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemError {
    #[error("null dereference at 0x{address:x}")]
    Null { address: u64 },
    #[error("invalid access at 0x{address:x} ({len} bytes)")]
    Unmapped { address: u64, len: u64 },
    #[error("use after free at 0x{address:x}")]
    UseAfterFree { address: u64 },
    #[error("double free at 0x{address:x}")]
    DoubleFree { address: u64 },
    #[error("free of non-block address 0x{address:x}")]
    InvalidFree { address: u64 },
    #[error("out of memory: requested {requested} bytes of a {limit} byte heap")]
    OutOfMemory { requested: u64, limit: u64 },
    #[error("stack overflow: requested {requested} bytes of a {limit} byte stack")]
    StackOverflow { requested: u64, limit: u64 },
    #[error("cannot read `{ty}` as a scalar")]
    NotScalar { ty: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Allocated,
    Tombstone,
}

#[derive(Debug, Clone, PartialEq)]
struct HeapBlock {
    size: u64,
    state: BlockState,
}

/// The flat memory image plus its access log. Methods taking `&mut self`
/// update this value in place; persistence comes from cloning the owning
/// machine state first, which shares all pages until one is written.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pages: FxHashMap<u64, Arc<Page>>,
    log: MemoryLog,
    blocks: Arc<FxHashMap<u64, HeapBlock>>,
    stack_limit: u64,
    stack_top: u64,
    heap_limit: u64,
    heap_next: u64,
    heap_used: u64,
}

impl MemoryStore {
    /// A fresh image: an empty stack region of `stack_bytes` starting at
    /// [`STACK_BASE`], and a heap beginning right after it, capped at
    /// `heap_limit` live bytes.
    pub fn new(stack_bytes: u64, heap_limit: u64) -> Self {
        let stack_limit = STACK_BASE + stack_bytes;
        MemoryStore {
            pages: FxHashMap::default(),
            log: MemoryLog::new(),
            blocks: Arc::new(FxHashMap::default()),
            stack_limit,
            stack_top: STACK_BASE,
            heap_limit,
            heap_next: stack_limit.next_multiple_of(8),
            heap_used: 0,
        }
    }

    // ---- raw bytes ----

    /// Strictly validated read: live stack bytes and live heap blocks only.
    pub fn read_bytes(&self, address: u64, len: u64) -> Result<Vec<u8>, MemError> {
        self.check_range(address, len, false)?;
        let mut buf = vec![0u8; len as usize];
        self.copy_out(address, &mut buf);
        Ok(buf)
    }

    /// Lenient read for inspection: tombstoned blocks and not-yet-live
    /// stack bytes are readable, wild addresses still are not.
    pub fn peek_bytes(&self, address: u64, len: u64) -> Result<Vec<u8>, MemError> {
        self.check_range(address, len, true)?;
        let mut buf = vec![0u8; len as usize];
        self.copy_out(address, &mut buf);
        Ok(buf)
    }

    /// Strictly validated write; returns the bytes that were overwritten,
    /// which the store log entry for this write should carry.
    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<Vec<u8>, MemError> {
        self.check_range(address, bytes.len() as u64, false)?;
        let mut prev = vec![0u8; bytes.len()];
        self.copy_out(address, &mut prev);
        self.copy_in(address, bytes);
        Ok(prev)
    }

    // ---- typed cells ----

    pub fn read_scalar(&self, reference: &Reference) -> Result<Scalar, MemError> {
        let size = self.scalar_size(reference)?;
        let bytes = self.read_bytes(reference.address, size)?;
        decode_scalar(&reference.ty, &bytes).ok_or_else(|| MemError::NotScalar {
            ty: reference.ty.to_string(),
        })
    }

    pub fn peek_scalar(&self, reference: &Reference) -> Result<Scalar, MemError> {
        let size = self.scalar_size(reference)?;
        let bytes = self.peek_bytes(reference.address, size)?;
        decode_scalar(&reference.ty, &bytes).ok_or_else(|| MemError::NotScalar {
            ty: reference.ty.to_string(),
        })
    }

    /// Encode `value` into the cell `reference` names; returns the
    /// overwritten bytes like [`MemoryStore::write_bytes`].
    pub fn write_scalar(
        &mut self,
        reference: &Reference,
        value: Scalar,
    ) -> Result<Vec<u8>, MemError> {
        let (buf, len) = encode_scalar(value);
        self.write_bytes(reference.address, &buf[..len])
    }

    fn scalar_size(&self, reference: &Reference) -> Result<u64, MemError> {
        reference.size_bytes().ok_or_else(|| MemError::NotScalar {
            ty: reference.ty.to_string(),
        })
    }

    // ---- access log ----

    pub fn log(&self) -> &MemoryLog {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn log_load(&mut self, reference: &Reference) -> u64 {
        self.log.append(AccessKind::Load, reference.clone(), None)
    }

    pub fn log_store(&mut self, reference: &Reference, overwritten: Vec<u8>) -> u64 {
        self.log
            .append(AccessKind::Store, reference.clone(), Some(overwritten))
    }

    pub fn query_log(&self, reference: &Reference) -> AccessSummary {
        self.log.query(reference)
    }

    /// The reference's bytes as of just before its most recent overlapping
    /// store, or `None` if it was never stored to.
    ///
    /// Every store later than that one misses the reference (otherwise it
    /// would itself be the most recent), so the current bytes with that
    /// store's overwritten range laid back over them are exact.
    pub fn read_previous(&self, reference: &Reference) -> Option<Vec<u8>> {
        let size = reference.size_bytes()?;
        if size == 0 {
            return None;
        }
        let entry = self.log.newest_store_over(reference)?;
        let overwritten = entry.overwritten.as_ref()?;
        let mut buf = self.peek_bytes(reference.address, size).ok()?;

        let store_base = entry.reference.address;
        let lo = store_base.max(reference.address);
        let hi = (store_base + overwritten.len() as u64).min(reference.address + size);
        if lo < hi {
            let dst = (lo - reference.address) as usize..(hi - reference.address) as usize;
            let src = (lo - store_base) as usize..(hi - store_base) as usize;
            buf[dst].copy_from_slice(&overwritten[src]);
        }
        Some(buf)
    }

    /// Decoded convenience over [`MemoryStore::read_previous`].
    pub fn previous_scalar(&self, reference: &Reference) -> Option<Scalar> {
        decode_scalar(&reference.ty, &self.read_previous(reference)?)
    }

    // ---- stack region ----

    pub fn stack_top(&self) -> u64 {
        self.stack_top
    }

    /// Claim `size` bytes of stack for a new cell, growing upward.
    pub fn stack_alloc(&mut self, size: u64) -> Result<u64, MemError> {
        let address = self.stack_top;
        let end = address.checked_add(size).unwrap_or(u64::MAX);
        if end > self.stack_limit {
            return Err(MemError::StackOverflow {
                requested: size,
                limit: self.stack_limit - STACK_BASE,
            });
        }
        self.stack_top = end;
        Ok(address)
    }

    /// Roll the stack cursor back to a previously observed top (on return).
    pub fn stack_restore(&mut self, top: u64) {
        self.stack_top = top;
    }

    // ---- heap region ----

    pub fn heap_base(&self) -> u64 {
        self.stack_limit
    }

    /// Bump-allocate a heap block, 8-byte aligned.
    pub fn allocate(&mut self, size: u64) -> Result<u64, MemError> {
        let size = size.max(1);
        if self.heap_used + size > self.heap_limit {
            return Err(MemError::OutOfMemory {
                requested: size,
                limit: self.heap_limit,
            });
        }
        let address = self.heap_next;
        self.heap_next = address + size.div_ceil(8) * 8;
        Arc::make_mut(&mut self.blocks).insert(
            address,
            HeapBlock {
                size,
                state: BlockState::Allocated,
            },
        );
        self.heap_used += size;
        Ok(address)
    }

    /// Tombstone the block starting exactly at `address`.
    pub fn release(&mut self, address: u64) -> Result<(), MemError> {
        let blocks = Arc::make_mut(&mut self.blocks);
        match blocks.get_mut(&address) {
            Some(block) if block.state == BlockState::Tombstone => {
                Err(MemError::DoubleFree { address })
            }
            Some(block) => {
                block.state = BlockState::Tombstone;
                self.heap_used -= block.size;
                Ok(())
            }
            None => Err(MemError::InvalidFree { address }),
        }
    }

    // ---- validity ----

    fn check_range(&self, address: u64, len: u64, lenient: bool) -> Result<(), MemError> {
        if len == 0 {
            return Ok(());
        }
        let end = address
            .checked_add(len)
            .ok_or(MemError::Unmapped { address, len })?;
        if address < STACK_BASE {
            return Err(MemError::Null { address });
        }
        if address < self.stack_limit {
            let bound = if lenient {
                self.stack_limit
            } else {
                self.stack_top
            };
            if end <= bound {
                Ok(())
            } else {
                Err(MemError::Unmapped { address, len })
            }
        } else {
            match self.find_block(address) {
                Some((base, block)) => {
                    if end > base + block.size {
                        return Err(MemError::Unmapped { address, len });
                    }
                    if block.state == BlockState::Tombstone && !lenient {
                        return Err(MemError::UseAfterFree { address });
                    }
                    Ok(())
                }
                None => Err(MemError::Unmapped { address, len }),
            }
        }
    }

    fn find_block(&self, address: u64) -> Option<(u64, &HeapBlock)> {
        self.blocks
            .iter()
            .find(|(base, block)| address >= **base && address < **base + block.size)
            .map(|(base, block)| (*base, block))
    }

    // ---- paging ----

    fn copy_out(&self, address: u64, buf: &mut [u8]) {
        let mut offset = 0usize;
        while offset < buf.len() {
            let at = address + offset as u64;
            let page_base = at - at % PAGE_SIZE;
            let page_off = (at % PAGE_SIZE) as usize;
            let take = (buf.len() - offset).min(PAGE_SIZE as usize - page_off);
            match self.pages.get(&page_base) {
                Some(page) => {
                    buf[offset..offset + take].copy_from_slice(&page[page_off..page_off + take]);
                }
                None => buf[offset..offset + take].fill(0),
            }
            offset += take;
        }
    }

    fn copy_in(&mut self, address: u64, bytes: &[u8]) {
        let mut offset = 0usize;
        while offset < bytes.len() {
            let at = address + offset as u64;
            let page_base = at - at % PAGE_SIZE;
            let page_off = (at % PAGE_SIZE) as usize;
            let take = (bytes.len() - offset).min(PAGE_SIZE as usize - page_off);
            let page = self
                .pages
                .entry(page_base)
                .or_insert_with(|| Arc::new([0u8; PAGE_SIZE as usize]));
            let page = Arc::make_mut(page);
            page[page_off..page_off + take].copy_from_slice(&bytes[offset..offset + take]);
            offset += take;
        }
    }
}
