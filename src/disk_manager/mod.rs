use crate::errors::Error;
use crate::pages::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Number of `i32` slots in the info page. Slot 0 is the free-list head;
/// slots 1.. are opaque caller metadata (tree roots, VLS top-of-heap, ...).
const INFO_SLOTS: usize = PAGE_SIZE / 4;
const FREE_LIST_HEAD_SLOT: usize = 0;

/// Raw frame I/O against a single backing file, plus free-frame bookkeeping
/// and a side-band info page. Owns the backing file handle for its lifetime.
#[derive(Debug)]
pub struct DiskManager {
    file: File,
    pages_per_frame: usize,
    frame_size: usize,
    info: [i32; INFO_SLOTS],
    num_frames: usize,
}

impl DiskManager {
    /// Opens (or creates) the backing file at `path`. `pages_per_frame` fixes
    /// the frame size for the lifetime of this manager; it is a
    /// construction-time parameter rather than a compile-time one because a
    /// fixed-size array of `PAGE_SIZE * pages_per_frame` bytes would need
    /// const-generic arithmetic that isn't stable.
    pub fn open<P: AsRef<Path>>(path: P, reset: bool, pages_per_frame: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .context("opening backing file")?;

        let frame_size = PAGE_SIZE * pages_per_frame;
        let mut manager = DiskManager {
            file,
            pages_per_frame,
            frame_size,
            info: [0i32; INFO_SLOTS],
            num_frames: 0,
        };

        if reset {
            manager
                .file
                .set_len(PAGE_SIZE as u64)
                .context("truncating backing file on reset")?;
            manager.info = [0i32; INFO_SLOTS];
            manager.info[FREE_LIST_HEAD_SLOT] = INVALID_PAGE_ID;
            manager.flush_info()?;
        } else {
            manager.load_info()?;
            let len = manager
                .file
                .metadata()
                .context("statting backing file")?
                .len();
            let data_len = len.saturating_sub(PAGE_SIZE as u64);
            manager.num_frames = (data_len / manager.frame_size as u64) as usize;
        }

        Ok(manager)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn pages_per_frame(&self) -> usize {
        self.pages_per_frame
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    fn load_info(&mut self) -> Result<()> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file
            .seek(SeekFrom::Start(0))
            .context("seeking to info page")?;
        self.file
            .read_exact(&mut buf)
            .context("reading info page")?;
        for (slot, chunk) in buf.chunks_exact(4).enumerate() {
            self.info[slot] = i32::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(())
    }

    fn flush_info(&mut self) -> Result<()> {
        let mut buf = [0u8; PAGE_SIZE];
        for (slot, value) in self.info.iter().enumerate() {
            buf[slot * 4..slot * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        self.file
            .seek(SeekFrom::Start(0))
            .context("seeking to info page")?;
        self.file.write_all(&buf).context("writing info page")?;
        Ok(())
    }

    /// Reads a caller-owned metadata slot. Slot 0 is reserved.
    pub fn info_slot(&self, slot: usize) -> i32 {
        assert!(slot >= 1 && slot < INFO_SLOTS, "slot 0 is reserved");
        self.info[slot]
    }

    /// Writes and immediately flushes a caller-owned metadata slot. Slot 0
    /// is reserved.
    pub fn set_info_slot(&mut self, slot: usize, value: i32) -> Result<()> {
        assert!(slot >= 1 && slot < INFO_SLOTS, "slot 0 is reserved");
        self.info[slot] = value;
        self.flush_info()
    }

    fn offset(&self, page_id: PageId) -> Result<u64> {
        if page_id < 0 || page_id as usize >= self.num_frames {
            bail!(Error::InvalidPage(page_id));
        }
        Ok(PAGE_SIZE as u64 + page_id as u64 * self.frame_size as u64)
    }

    pub fn read_frame(&mut self, page_id: PageId, buffer: &mut [u8]) -> Result<()> {
        assert_eq!(buffer.len(), self.frame_size);
        let offset = self.offset(page_id)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .context("seeking to frame")?;
        self.file.read_exact(buffer).context("reading frame")?;
        Ok(())
    }

    pub fn write_frame(&mut self, page_id: PageId, buffer: &[u8]) -> Result<()> {
        assert_eq!(buffer.len(), self.frame_size);
        let offset = self.offset(page_id)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .context("seeking to frame")?;
        self.file.write_all(buffer).context("writing frame")?;
        Ok(())
    }

    /// Pops the free list if non-empty, else extends the file by one frame.
    pub fn allocate_frame(&mut self) -> Result<PageId> {
        let head = self.info[FREE_LIST_HEAD_SLOT];
        if head != INVALID_PAGE_ID {
            let offset = self.offset(head)?;
            let mut next_buf = [0u8; 4];
            self.file
                .seek(SeekFrom::Start(offset))
                .context("seeking to free frame head")?;
            self.file
                .read_exact(&mut next_buf)
                .context("reading free-list next pointer")?;
            self.info[FREE_LIST_HEAD_SLOT] = i32::from_le_bytes(next_buf);
            self.flush_info()?;
            return Ok(head);
        }

        let page_id = self.num_frames as PageId;
        let new_len = PAGE_SIZE as u64 + (self.num_frames as u64 + 1) * self.frame_size as u64;
        self.file
            .set_len(new_len)
            .context("extending backing file")?;
        self.num_frames += 1;
        Ok(page_id)
    }

    /// Overwrites the freed frame's first 4 bytes with the current free
    /// head, then makes the freed frame the new head. The rest of the
    /// frame's bytes are left untouched (undefined for callers).
    pub fn deallocate_frame(&mut self, page_id: PageId) -> Result<()> {
        let head = self.info[FREE_LIST_HEAD_SLOT];
        let offset = self.offset(page_id)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .context("seeking to freed frame")?;
        self.file
            .write_all(&head.to_le_bytes())
            .context("writing free-list next pointer")?;
        self.info[FREE_LIST_HEAD_SLOT] = page_id;
        self.flush_info()
    }

    /// Flushes the info page and syncs the file. Callers are expected to
    /// have already flushed every dirty buffer-pool frame.
    pub fn shutdown(&mut self) -> Result<()> {
        self.flush_info()?;
        self.file.sync_all().context("syncing backing file")?;
        Ok(())
    }
}
