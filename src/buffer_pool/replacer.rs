use std::collections::{HashMap, HashSet, VecDeque};

use super::FrameId;

/// Backward k-distance eviction. A frame's distance is the gap between "now"
/// and its k-th most recent access; frames with fewer than k recorded
/// accesses have infinite backward distance and are evicted before any frame
/// with a full history, with ties among those broken by oldest most-recent
/// access.
///
/// Single-threaded: the buffer pool is never shared across threads, so this
/// carries no `Send`/`Sync` bound and needs no internal locking.
#[derive(Debug, Default)]
struct History {
    window: VecDeque<i64>,
}

#[derive(Debug)]
pub(super) struct LruKReplacer {
    k: usize,
    clock: i64,
    history: HashMap<FrameId, History>,
    evictable: HashSet<FrameId>,
}

impl LruKReplacer {
    pub fn new(k: usize) -> Self {
        assert!(k >= 1, "k must be at least 1");
        Self {
            k,
            clock: 0,
            history: HashMap::new(),
            evictable: HashSet::new(),
        }
    }

    /// Advances the global clock and appends it to `frame_id`'s access
    /// window, keeping only the most recent `k` timestamps.
    pub fn record_access(&mut self, frame_id: FrameId) {
        self.clock += 1;
        let entry = self.history.entry(frame_id).or_default();
        if entry.window.len() == self.k {
            entry.window.pop_front();
        }
        entry.window.push_back(self.clock);
    }

    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if evictable {
            self.evictable.insert(frame_id);
        } else {
            self.evictable.remove(&frame_id);
        }
    }

    /// Drops all bookkeeping for a frame outright, e.g. because its page was
    /// deleted rather than merely unpinned.
    pub fn remove(&mut self, frame_id: FrameId) {
        self.evictable.remove(&frame_id);
        self.history.remove(&frame_id);
    }

    pub fn can_evict(&self) -> bool {
        !self.evictable.is_empty()
    }

    /// `(oldest_in_window, most_recent)`, ordered so a frame with an
    /// incomplete window always compares smaller (more evictable) than one
    /// with a full window, and incomplete-window frames tie-break by most
    /// recent access ascending.
    fn k_distance(&self, frame_id: FrameId) -> (i64, i64) {
        let hist = self
            .history
            .get(&frame_id)
            .expect("evictable frame must have recorded history");
        let most_recent = *hist.window.back().expect("at least one access recorded");
        if hist.window.len() < self.k {
            (i64::MIN, most_recent)
        } else {
            (*hist.window.front().unwrap(), most_recent)
        }
    }

    /// Evicts the evictable frame with the smallest k-distance, erasing its
    /// history (the frame is about to be handed to a different page).
    pub fn evict(&mut self) -> Option<FrameId> {
        let victim = *self
            .evictable
            .iter()
            .min_by_key(|&&frame_id| self.k_distance(frame_id))?;
        self.evictable.remove(&victim);
        self.history.remove(&victim);
        Some(victim)
    }

    #[cfg(test)]
    pub fn peek(&self) -> Option<FrameId> {
        self.evictable
            .iter()
            .min_by_key(|&&frame_id| self.k_distance(frame_id))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_with_incomplete_history_are_preferred_for_eviction() {
        let mut replacer = LruKReplacer::new(2);
        replacer.record_access(1);
        replacer.record_access(1);
        replacer.record_access(2); // only one access: infinite backward distance
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn full_history_frames_evict_by_oldest_kth_access() {
        let mut replacer = LruKReplacer::new(2);
        replacer.record_access(1);
        replacer.record_access(1); // window [1,2]
        replacer.record_access(2);
        replacer.record_access(2); // window [3,4]
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);
        // frame 1's k-th-from-last access (1) is older than frame 2's (3).
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn non_evictable_frames_are_never_chosen() {
        let mut replacer = LruKReplacer::new(2);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.set_evictable(2, true);
        assert_eq!(replacer.evict(), Some(2));
        assert!(!replacer.can_evict());
    }

    #[test]
    fn removed_frame_is_not_evicted() {
        let mut replacer = LruKReplacer::new(2);
        replacer.record_access(1);
        replacer.set_evictable(1, true);
        replacer.remove(1);
        assert!(!replacer.can_evict());
        assert_eq!(replacer.evict(), None);
    }
}
