//! Indexed transactional sequence.

use vellum_error::Result;
use vellum_stm::TCell;

/// An indexed sequence over transactional cells.
///
/// The index lives in a structure cell holding one slot cell per element.
/// `push`/`pop` mutate the structure; `get`/`set`/`update` touch only the
/// addressed slot, so writes to disjoint indices commit without
/// conflicting.
pub struct TList<T> {
    slots: TCell<Vec<TCell<T>>>,
}

impl<T> Clone for TList<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for TList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> TList<T> {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: TCell::new(Vec::new()),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> Result<usize> {
        Ok(self.slots.read()?.len())
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Append `value`.
    pub fn push(&self, value: T) -> Result<()> {
        self.slots.modify(|slots| slots.push(TCell::new(value)))
    }

    /// Remove and return the last element.
    pub fn pop(&self) -> Result<Option<T>> {
        let mut slots = self.slots.read()?;
        let Some(slot) = slots.pop() else {
            return Ok(None);
        };
        self.slots.write(slots)?;
        slot.read().map(Some)
    }

    /// The element at `index`, if in bounds.
    pub fn get(&self, index: usize) -> Result<Option<T>> {
        match self.slots.read()?.get(index) {
            Some(slot) => slot.read().map(Some),
            None => Ok(None),
        }
    }

    /// Replace the element at `index`. Returns `false` when out of bounds.
    pub fn set(&self, index: usize, value: T) -> Result<bool> {
        match self.slots.read()?.get(index) {
            Some(slot) => {
                slot.write(value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Update the element at `index` in place. Returns `false` when out of
    /// bounds.
    pub fn update(&self, index: usize, f: impl FnOnce(&mut T)) -> Result<bool> {
        match self.slots.read()?.get(index) {
            Some(slot) => {
                slot.modify(f)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Snapshot of all elements, in order.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let slots = self.slots.read()?;
        let mut items = Vec::with_capacity(slots.len());
        for slot in &slots {
            items.push(slot.read()?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    use vellum_error::StmError;
    use vellum_stm::atomically;

    #[test]
    fn push_get_set_pop_roundtrip() {
        let list: TList<u32> = TList::new();
        atomically(|| {
            list.push(1)?;
            list.push(2)?;
            list.push(3)?;
            assert_eq!(list.len()?, 3);
            assert_eq!(list.get(1)?, Some(2));
            assert!(list.set(1, 20)?);
            assert!(!list.set(9, 0)?);
            Ok::<_, StmError>(())
        })
        .unwrap();

        assert_eq!(atomically(|| list.to_vec()).unwrap(), vec![1, 20, 3]);
        assert_eq!(atomically(|| list.pop()).unwrap(), Some(3));
        assert_eq!(atomically(|| list.len()).unwrap(), 2);
    }

    #[test]
    fn pop_on_empty_is_none() {
        let list: TList<u32> = TList::new();
        assert_eq!(atomically(|| list.pop()).unwrap(), None);
    }

    #[test]
    fn update_mutates_in_place() {
        let list: TList<String> = TList::new();
        atomically(|| list.push("ab".to_owned())).unwrap();
        let updated = atomically(|| list.update(0, |s| s.push('c'))).unwrap();
        assert!(updated);
        assert_eq!(atomically(|| list.get(0)).unwrap(), Some("abc".to_owned()));
    }

    #[test]
    fn disjoint_index_writes_do_not_conflict() {
        let list: Arc<TList<u32>> = Arc::new(TList::new());
        atomically(|| {
            list.push(0)?;
            list.push(0)?;
            Ok::<_, StmError>(())
        })
        .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let attempts = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = [0usize, 1usize]
            .into_iter()
            .map(|index| {
                let list = Arc::clone(&list);
                let barrier = Arc::clone(&barrier);
                let attempts = Arc::clone(&attempts);
                std::thread::spawn(move || {
                    barrier.wait();
                    atomically(|| {
                        attempts.fetch_add(1, Ordering::Relaxed);
                        list.update(index, |n| *n += 1)?;
                        Ok::<_, StmError>(())
                    })
                    .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(atomically(|| list.to_vec()).unwrap(), vec![1, 1]);
        assert_eq!(attempts.load(Ordering::Relaxed), 2, "disjoint indices must not conflict");
    }

    #[test]
    fn structural_growth_is_transactional() {
        let list: Arc<TList<usize>> = Arc::new(TList::new());
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let list = Arc::clone(&list);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for i in 0..10 {
                        atomically(|| list.push(t * 10 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let items = atomically(|| list.to_vec()).unwrap();
        assert_eq!(items.len(), 40);
        // Every pushed element survived exactly once.
        let mut sorted = items;
        sorted.sort_unstable();
        let expected: Vec<usize> = (0..4).flat_map(|t| (0..10).map(move |i| t * 10 + i)).collect();
        assert_eq!(sorted, expected);
    }
}
