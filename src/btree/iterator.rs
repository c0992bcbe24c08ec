use super::node::Node;
use crate::buffer_pool::{FrameGuardLike, PageSource};
use crate::pages::fixed_size::FixedSize;
use crate::pages::{PageId, INVALID_PAGE_ID};
use anyhow::{Error, Result};

/// A cursor over `(key, value)` pairs holding a pinned leaf frame; advancing
/// past the end of one leaf fetches the next one via its `next_leaf`
/// pointer and unpins the frame just left. Becomes empty at the terminal
/// leaf. Splits, merges, and deletions invalidate any iterator in flight —
/// callers must not mutate the tree while holding one, except through the
/// `partial_search` → `remove_all` pattern, which materializes keys first.
///
/// `Iterator::next` has no way to return `Result`, but a failed
/// `fetch_frame_basic` while crossing a leaf boundary (pool exhaustion, I/O
/// failure) is one of the fatal errors spec §7 requires to propagate, not a
/// legitimate end-of-chain. Such an error stops the iteration (as if the
/// chain had ended) but is latched in `error` rather than discarded, so
/// callers that need to distinguish the two call [`Self::error`] afterwards.
pub struct BTreeIterator<K, V, P: PageSource> {
    pool: P,
    guard: Option<P::Guard>,
    entries: Vec<(K, V)>,
    next: PageId,
    index: usize,
    error: Option<Error>,
}

impl<K: FixedSize, V: FixedSize, P: PageSource> BTreeIterator<K, V, P> {
    pub(crate) fn empty(pool: P) -> Self {
        Self {
            pool,
            guard: None,
            entries: Vec::new(),
            next: INVALID_PAGE_ID,
            index: 0,
            error: None,
        }
    }

    pub(crate) fn new(pool: P, guard: P::Guard, index: usize) -> Self {
        let (entries, next) = decode_leaf(&guard);
        Self {
            pool,
            guard: Some(guard),
            entries,
            next,
            index,
            error: None,
        }
    }

    /// The fatal error (pool exhaustion, I/O failure) that cut iteration
    /// short, if any. A `None` return after iteration is exhausted means the
    /// leaf chain genuinely ended; `Some` means a storage error masqueraded
    /// as end-of-iteration and the caller must not trust the results as
    /// complete.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    fn advance_to_leaf(&mut self, page_id: PageId) -> Result<()> {
        let guard = self.pool.fetch_frame_basic(page_id)?;
        let (entries, next) = decode_leaf(&guard);
        self.guard = Some(guard);
        self.entries = entries;
        self.next = next;
        self.index = 0;
        Ok(())
    }
}

fn decode_leaf<K: FixedSize, V: FixedSize, G: FrameGuardLike>(guard: &G) -> (Vec<(K, V)>, PageId) {
    guard.with_bytes(|bytes| match Node::<K, V>::decode(bytes) {
        Node::Leaf { next, entries } => (entries, next),
        Node::Internal { .. } => unreachable!("iterator must always be positioned at a leaf"),
    })
}

impl<K: FixedSize + Copy, V: FixedSize + Copy, P: PageSource> Iterator for BTreeIterator<K, V, P> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.index < self.entries.len() {
                let item = self.entries[self.index];
                self.index += 1;
                return Some(item);
            }

            if self.next == INVALID_PAGE_ID {
                self.guard = None;
                return None;
            }

            let next_leaf = self.next;
            self.guard = None;
            if let Err(err) = self.advance_to_leaf(next_leaf) {
                self.error = Some(err);
                self.next = INVALID_PAGE_ID;
                return None;
            }
        }
    }
}
