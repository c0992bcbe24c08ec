//! Variable-length record store: bump-allocates byte runs inside buffer-pool
//! frames and hands back stable record ids. Append-only — there is no
//! reclamation of space freed by a logically-deleted record.

use crate::buffer_pool::{FrameGuardLike, PageSource};
use crate::pages::PageId;
use anyhow::Result;

/// `page_id * frame_size + intra_frame_offset`. A 32-bit quantity, matching
/// the info-page slots it is stored in; a database whose data segment grows
/// past roughly `i32::MAX / frame_size` pages will overflow this, the same
/// ceiling the B+ tree's page ids are already subject to.
pub type RecordId = i32;

/// Sentinel meaning "no record" / "store not yet initialized". This crate
/// uses `-1` rather than the `0` the byte-offset formula would naturally
/// start at, because `0` is also the legitimate address of the very first
/// byte of the very first page — indistinguishable from "nothing allocated
/// yet" under the allocation formula below. `-1` can never collide with a
/// real address.
pub const INVALID_RECORD_ID: RecordId = -1;

/// A live pin on the frame holding one record, plus that record's
/// intra-frame byte offset. Mirrors [`crate::buffer_pool::FrameGuardLike`]'s
/// closure-based byte access rather than returning borrowed slices directly,
/// for the same reason: no generic associated types are needed this way.
/// The store does not track each record's length — only its start — so
/// every access here takes the length as an explicit parameter, same as the
/// original's caller-supplied "fixed header plus n trailing entries" sizing.
pub struct Handle<G: FrameGuardLike> {
    guard: G,
    offset: usize,
}

impl<G: FrameGuardLike> Handle<G> {
    pub fn page_id(&self) -> PageId {
        self.guard.page_id()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn with_bytes<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        self.guard.with_bytes(|bytes| f(&bytes[self.offset..self.offset + len]))
    }

    pub fn with_bytes_mut<R>(&mut self, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.guard
            .with_bytes_mut(|bytes| f(&mut bytes[self.offset..self.offset + len]))
    }

    pub fn write(&mut self, data: &[u8]) {
        self.with_bytes_mut(data.len(), |slice| slice.copy_from_slice(data));
    }

    pub fn read(&self, len: usize) -> Vec<u8> {
        self.with_bytes(len, |slice| slice.to_vec())
    }
}

/// Bump-allocator over a [`PageSource`]'s frames. `top_pos`, persisted in one
/// info slot, is the record id of the next free byte; it only ever grows.
pub struct VariableLengthStore<P: PageSource> {
    pool: P,
    top_pos_slot: usize,
}

impl<P: PageSource> VariableLengthStore<P> {
    /// Initializes `top_pos_slot` to "nothing allocated yet". Call once per
    /// fresh database before constructing a store against that slot.
    pub fn bootstrap(pool: &P, top_pos_slot: usize) -> Result<()> {
        pool.set_info_slot(top_pos_slot, INVALID_RECORD_ID)
    }

    pub fn new(pool: P, top_pos_slot: usize) -> Self {
        Self { pool, top_pos_slot }
    }

    fn top_pos(&self) -> RecordId {
        self.pool.info_slot(self.top_pos_slot)
    }

    fn set_top_pos(&self, value: RecordId) -> Result<()> {
        self.pool.set_info_slot(self.top_pos_slot, value)
    }

    /// Bump-allocates `size` contiguous bytes and returns a handle to them.
    /// If the current frame doesn't have `size` bytes left, a fresh frame is
    /// allocated and becomes the new current one; a record never straddles a
    /// frame boundary.
    pub fn allocate(&mut self, size: usize) -> Result<Handle<P::Guard>> {
        let frame_size = self.pool.frame_size();
        assert!(
            size <= frame_size,
            "record of {size} bytes does not fit in a {frame_size}-byte frame"
        );

        let top = self.top_pos();

        let (guard, record_id) = if top == INVALID_RECORD_ID {
            let (page_id, guard) = self.pool.new_frame_guarded()?;
            (guard, page_id as RecordId * frame_size as RecordId)
        } else {
            let offset_in_frame = top as usize % frame_size;
            let remaining = frame_size - offset_in_frame;
            if size > remaining {
                let (page_id, guard) = self.pool.new_frame_guarded()?;
                (guard, page_id as RecordId * frame_size as RecordId)
            } else {
                let page_id = (top as usize / frame_size) as PageId;
                let guard = self.pool.fetch_frame_basic(page_id)?;
                (guard, top)
            }
        };

        self.set_top_pos(record_id + size as RecordId)?;
        let offset = record_id as usize % frame_size;
        Ok(Handle { guard, offset })
    }

    /// Fetches the frame holding `record_id` and returns a handle positioned
    /// at its byte offset. The caller supplies the record's length when it
    /// reads or writes through the handle.
    pub fn get(&self, record_id: RecordId) -> Result<Handle<P::Guard>> {
        assert_ne!(record_id, INVALID_RECORD_ID, "record id must not be invalid");
        let frame_size = self.pool.frame_size();
        let page_id = (record_id as usize / frame_size) as PageId;
        let offset = record_id as usize % frame_size;
        let guard = self.pool.fetch_frame_basic(page_id)?;
        Ok(Handle { guard, offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPoolManager;
    use tempfile::tempdir;

    fn test_pool(pool_size: usize) -> BufferPoolManager {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.db");
        Box::leak(Box::new(dir));
        BufferPoolManager::builder(path)
            .reset(true)
            .pool_size(pool_size)
            .pages_per_frame(1)
            .build()
            .unwrap()
    }

    #[test]
    fn round_trip_small_record() {
        let pool = test_pool(8);
        VariableLengthStore::bootstrap(&pool, 2).unwrap();
        let mut vls = VariableLengthStore::new(pool, 2);

        let mut handle = vls.allocate(11).unwrap();
        handle.write(b"hello world");
        let record_id = handle.page_id() as RecordId * 4096 + handle.offset() as RecordId;
        drop(handle);

        let back = vls.get(record_id).unwrap();
        assert_eq!(back.read(11), b"hello world");
    }

    #[test]
    fn large_allocation_forces_a_new_frame() {
        let pool = test_pool(8);
        VariableLengthStore::bootstrap(&pool, 2).unwrap();
        let mut vls = VariableLengthStore::new(pool, 2);

        let mut h1 = vls.allocate(100).unwrap();
        h1.write(&vec![1u8; 100]);
        let id1 = h1.page_id() as RecordId * 4096 + h1.offset() as RecordId;
        drop(h1);

        let mut h2 = vls.allocate(4000).unwrap();
        h2.write(&vec![2u8; 4000]);
        let id2 = h2.page_id() as RecordId * 4096 + h2.offset() as RecordId;
        drop(h2);

        let mut h3 = vls.allocate(50).unwrap();
        h3.write(&vec![3u8; 50]);
        let id3 = h3.page_id() as RecordId * 4096 + h3.offset() as RecordId;
        drop(h3);

        assert_ne!(
            id1 / 4096,
            id2 / 4096,
            "the 4000-byte record should not fit after the first 100-byte one"
        );
        assert_eq!(
            id2 / 4096,
            id3 / 4096,
            "the 50-byte record should land on the same fresh frame as the 4000-byte one"
        );

        assert_eq!(vls.get(id1).unwrap().read(100), vec![1u8; 100]);
        assert_eq!(vls.get(id2).unwrap().read(4000), vec![2u8; 4000]);
        assert_eq!(vls.get(id3).unwrap().read(50), vec![3u8; 50]);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.db");

        let ids;
        {
            let pool = BufferPoolManager::builder(&path)
                .reset(true)
                .pool_size(4)
                .pages_per_frame(1)
                .build()
                .unwrap();
            VariableLengthStore::bootstrap(&pool, 2).unwrap();
            let mut vls = VariableLengthStore::new(pool.clone(), 2);

            let mut h1 = vls.allocate(100).unwrap();
            h1.write(&vec![9u8; 100]);
            let id1 = h1.page_id() as RecordId * 4096 + h1.offset() as RecordId;
            drop(h1);

            let mut h2 = vls.allocate(4000).unwrap();
            h2.write(&vec![8u8; 4000]);
            let id2 = h2.page_id() as RecordId * 4096 + h2.offset() as RecordId;
            drop(h2);

            let mut h3 = vls.allocate(50).unwrap();
            h3.write(&vec![7u8; 50]);
            let id3 = h3.page_id() as RecordId * 4096 + h3.offset() as RecordId;
            drop(h3);

            ids = (id1, id2, id3);
            pool.shutdown().unwrap();
        }

        {
            let pool = BufferPoolManager::builder(&path)
                .reset(false)
                .pool_size(4)
                .pages_per_frame(1)
                .build()
                .unwrap();
            let vls = VariableLengthStore::new(pool, 2);

            assert_eq!(vls.get(ids.0).unwrap().read(100), vec![9u8; 100]);
            assert_eq!(vls.get(ids.1).unwrap().read(4000), vec![8u8; 4000]);
            assert_eq!(vls.get(ids.2).unwrap().read(50), vec![7u8; 50]);
        }
    }
}
