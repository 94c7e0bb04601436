//! The process-local hash index over slots of the entry table.
//!
//! Chains are doubly linked through slot indices, so unlinking any slot is constant time and the
//! whole structure is two flat vectors. Nothing here is shared with other processes.
use crate::Result;

const NONE: u64 = u64::MAX;

#[derive(Clone, Copy, Debug)]
struct Link {
    /// `NONE` while the slot is not indexed.
    bucket: u64,
    prev: u64,
    next: u64,
}

impl Link {
    const UNLINKED: Link = Link {
        bucket: NONE,
        prev: NONE,
        next: NONE,
    };
}

pub(crate) struct HashIndex {
    heads: Vec<u64>,
    links: Vec<Link>,
    len: usize,
}

impl HashIndex {
    pub(crate) fn new(buckets: usize) -> Self {
        HashIndex {
            heads: vec![NONE; buckets],
            links: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn buckets(&self) -> usize {
        self.heads.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn clear(&mut self) {
        self.heads.fill(NONE);
        self.links.clear();
        self.len = 0;
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, slot: u64) -> bool {
        self.link(slot).is_some_and(|link| link.bucket != NONE)
    }

    /// Prepend a slot to the chain of its bucket, moving it if it was indexed elsewhere.
    pub(crate) fn insert(&mut self, bucket: usize, slot: u64) {
        self.unlink(slot);

        let index = slot as usize;
        if self.links.len() <= index {
            self.links.resize(index + 1, Link::UNLINKED);
        }

        let head = self.heads[bucket];
        if head != NONE {
            self.links[head as usize].prev = slot;
        }

        self.links[index] = Link {
            bucket: bucket as u64,
            prev: NONE,
            next: head,
        };
        self.heads[bucket] = slot;
        self.len += 1;
    }

    /// Remove a slot from its chain. Returns whether it was indexed.
    pub(crate) fn unlink(&mut self, slot: u64) -> bool {
        let Some(link) = self.link(slot).copied().filter(|link| link.bucket != NONE) else {
            return false;
        };

        if link.prev == NONE {
            self.heads[link.bucket as usize] = link.next;
        } else {
            self.links[link.prev as usize].next = link.next;
        }

        if link.next != NONE {
            self.links[link.next as usize].prev = link.prev;
        }

        self.links[slot as usize] = Link::UNLINKED;
        self.len -= 1;
        true
    }

    /// Walk a chain, returning the first slot the predicate accepts.
    ///
    /// The predicate compares the stored key, a chain holds every colliding key of its bucket.
    pub(crate) fn find(
        &self,
        bucket: usize,
        mut matches: impl FnMut(u64) -> Result<bool>,
    ) -> Result<Option<u64>> {
        let mut next = self.heads[bucket];

        while next != NONE {
            if matches(next)? {
                return Ok(Some(next));
            }

            next = self.links[next as usize].next;
        }

        Ok(None)
    }

    fn link(&self, slot: u64) -> Option<&Link> {
        self.links.get(usize::try_from(slot).ok()?)
    }
}

#[test]
fn chains_link_and_unlink() {
    let mut index = HashIndex::new(4);
    index.insert(1, 10);
    index.insert(1, 3);
    index.insert(1, 7);
    index.insert(2, 0);
    assert_eq!(index.len(), 4);

    let mut walked = Vec::new();
    let found = index
        .find(1, |slot| {
            walked.push(slot);
            Ok(false)
        })
        .unwrap();
    assert_eq!(found, None);
    assert_eq!(walked, [7, 3, 10]);

    // The middle of a chain.
    assert!(index.unlink(3));
    assert!(!index.unlink(3));
    assert!(!index.contains(3));
    assert_eq!(index.find(1, |slot| Ok(slot == 10)).unwrap(), Some(10));

    // Moving a slot to another bucket.
    index.insert(2, 7);
    assert_eq!(index.find(1, |slot| Ok(slot == 7)).unwrap(), None);
    assert_eq!(index.find(2, |slot| Ok(slot == 7)).unwrap(), Some(7));
    assert_eq!(index.len(), 3);

    index.clear();
    assert_eq!(index.len(), 0);
    assert_eq!(index.find(2, |_| Ok(true)).unwrap(), None);
}

#[test]
fn unlinking_chain_ends() {
    let mut index = HashIndex::new(2);
    for slot in [4, 5, 6] {
        index.insert(0, slot);
    }

    // Head, then tail, then the only one left.
    assert!(index.unlink(6));
    assert!(index.unlink(4));
    assert_eq!(index.find(0, |_| Ok(true)).unwrap(), Some(5));
    assert!(index.unlink(5));
    assert_eq!(index.find(0, |_| Ok(true)).unwrap(), None);

    // Slots past anything ever indexed.
    assert!(!index.unlink(1 << 40));
    assert!(!index.unlink(u64::MAX));
    assert_eq!(index.len(), 0);
}

#[test]
fn predicate_errors_stop_the_walk() {
    let mut index = HashIndex::new(1);
    index.insert(0, 1);
    index.insert(0, 2);

    let result = index.find(0, |slot| Err(crate::Error::ReadConflict { slot }));
    assert!(matches!(result, Err(crate::Error::ReadConflict { slot: 2 })));
}
