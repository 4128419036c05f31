use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Compact identity of one registered reader.
///
/// Handles come from a per-provider counter and are never reused, so two
/// readers with identical configuration stay distinguishable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionHandle(u32);

impl CollectionHandle {
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionHandle({})", self.0)
    }
}

impl fmt::Display for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic handle source owned by one provider
#[derive(Debug, Default)]
pub(crate) struct HandleAllocator {
    next: AtomicU32,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> CollectionHandle {
        CollectionHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Bit-vector membership set of handles.
///
/// `insert` and `contains` are O(1); `union_with` and `is_superset` walk
/// one word per 64 handles.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HandleSet {
    words: Vec<u64>,
}

impl HandleSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(handle: CollectionHandle) -> (usize, u64) {
        let id = handle.0 as usize;
        (id / 64, 1u64 << (id % 64))
    }

    /// Returns `true` if the handle was not already present
    pub fn insert(&mut self, handle: CollectionHandle) -> bool {
        let (word, bit) = Self::position(handle);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let fresh = self.words[word] & bit == 0;
        self.words[word] |= bit;
        fresh
    }

    pub fn remove(&mut self, handle: CollectionHandle) -> bool {
        let (word, bit) = Self::position(handle);
        match self.words.get_mut(word) {
            Some(w) if *w & bit != 0 => {
                *w &= !bit;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, handle: CollectionHandle) -> bool {
        let (word, bit) = Self::position(handle);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    pub fn union_with(&mut self, other: &HandleSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= theirs;
        }
    }

    /// Whether every handle in `other` is also in `self`
    pub fn is_superset(&self, other: &HandleSet) -> bool {
        other.words.iter().enumerate().all(|(i, theirs)| {
            let mine = self.words.get(i).copied().unwrap_or(0);
            theirs & !mine == 0
        })
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = CollectionHandle> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            (0..64u32)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| CollectionHandle(i as u32 * 64 + bit))
        })
    }
}

impl fmt::Debug for HandleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|h| h.0)).finish()
    }
}

impl FromIterator<CollectionHandle> for HandleSet {
    fn from_iter<I: IntoIterator<Item = CollectionHandle>>(iter: I) -> Self {
        let mut set = HandleSet::new();
        for handle in iter {
            set.insert(handle);
        }
        set
    }
}
