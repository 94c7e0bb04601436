use hmm_state::{Entry, EntrySlot, ENTRY_SIZE};

use crate::header::HeaderPage;
use crate::segment::Section;
use crate::{Error, Result};

/// Initial capacity of the entry table, and the step it grows by.
pub const CAPACITY_INCREMENT: u64 = 16384;

/// Where the next inserted entry goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Vacancy {
    /// The head of the free list, `next` becomes the new head.
    Free { slot: u64, next: u64 },
    /// A never used slot at the occupancy high-water mark.
    Fresh { slot: u64 },
}

impl Vacancy {
    pub(crate) fn slot(self) -> u64 {
        match self {
            Vacancy::Free { slot, .. } | Vacancy::Fresh { slot } => slot,
        }
    }
}

pub(crate) struct Table {
    section: Section,
}

impl Table {
    pub(crate) fn new(section: Section) -> Self {
        Table { section }
    }

    pub(crate) fn section(&self) -> &Section {
        &self.section
    }

    pub(crate) fn slots(&self) -> &[EntrySlot] {
        EntrySlot::table(self.section.words())
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.slots().len() as u64
    }

    pub(crate) fn slot(&self, index: u64) -> Result<&EntrySlot> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.slots().get(index))
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "slot {index} outside of table capacity {}",
                    self.capacity()
                ))
            })
    }

    /// Map the capacity the header announces, after another process grew the table.
    pub(crate) fn sync(&mut self, max_entries: u64) -> Result<()> {
        if self.capacity() == max_entries {
            return Ok(());
        }

        let len = max_entries * ENTRY_SIZE as u64;
        if self.section.file_len()? < len {
            return Err(Error::corrupt(format!(
                "entries file smaller than the capacity of {max_entries} slots"
            )));
        }

        self.section.map(len)
    }

    /// Append one increment of slots. Needs the structural lock.
    ///
    /// The header only learns of the new capacity once the section is extended, a failure leaves
    /// the table as it was.
    pub(crate) fn grow(&mut self, header: &HeaderPage) -> Result<()> {
        let capacity = self.capacity() + CAPACITY_INCREMENT;
        tracing::info!(from = self.capacity(), to = capacity, "growing entry table");

        self.section.grow(capacity * ENTRY_SIZE as u64)?;
        header.set_max_entries(capacity);
        Ok(())
    }

    /// Find a slot for an insert, `None` if the table must grow first.
    pub(crate) fn vacancy(&self, header: &HeaderPage) -> Result<Option<Vacancy>> {
        let head = header.free_head();

        if head != Entry::NIL {
            let entry = self.slot(head)?.read().map_err(|_| Error::ReadConflict { slot: head })?;

            if !entry.is_vacant() {
                return Err(Error::corrupt(format!("free list head {head} is occupied")));
            }

            return Ok(Some(Vacancy::Free {
                slot: head,
                next: entry.val_offset,
            }));
        }

        let slot_end = header.slot_end();
        Ok((slot_end < self.capacity()).then_some(Vacancy::Fresh { slot: slot_end }))
    }

    /// Take a vacancy off the allocator state.
    pub(crate) fn claim(&self, header: &HeaderPage, vacancy: Vacancy) {
        match vacancy {
            Vacancy::Free { next, .. } => header.set_free_head(next),
            Vacancy::Fresh { slot } => header.set_slot_end(slot + 1),
        }
    }

    /// Vacate a slot and push it onto the free list, returning the new counter.
    pub(crate) fn release(&self, header: &HeaderPage, slot: u64) -> Result<u64> {
        let counter = self.slot(slot)?.write(&Entry::vacant(header.free_head()));
        header.set_free_head(slot);
        Ok(counter)
    }

    /// Walk the free list, `None` if it is not exactly the vacant slots below `slot_end`.
    pub(crate) fn free_list(&self, header: &HeaderPage) -> Option<Vec<u64>> {
        let slot_end = header.slot_end();
        let mut seen = vec![false; slot_end as usize];
        let mut list = Vec::new();
        let mut next = header.free_head();

        while next != Entry::NIL {
            let entry = self.slots().get(next as usize)?.read().ok()?;
            let mark = seen.get_mut(next as usize)?;

            if *mark || !entry.is_vacant() {
                return None;
            }

            *mark = true;
            list.push(next);
            next = entry.val_offset;
        }

        Some(list)
    }

    /// Thread a new free list through the given vacant slots. Needs the structural lock.
    pub(crate) fn rebuild_free_list(&self, header: &HeaderPage, vacant: &[u64]) -> Result<()> {
        let mut head = Entry::NIL;

        for &slot in vacant.iter().rev() {
            self.slot(slot)?.write(&Entry::vacant(head));
            head = slot;
        }

        header.set_free_head(head);
        Ok(())
    }
}
