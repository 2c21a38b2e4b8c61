//! Ordered transactional dictionary.

use std::collections::BTreeMap;

use vellum_error::Result;
use vellum_stm::TCell;

/// An ordered keyed mapping over transactional cells.
///
/// The key directory lives in a structure cell; each key owns a slot cell
/// holding `Option<V>`. Slot cells are allocated lazily on first insert
/// and kept on removal as tombstones, so removing or rewriting a value
/// never mutates the directory; only inserts of previously-unseen keys
/// do, and only those conflict structurally. The length lives in its own
/// counter cell maintained by commutes, so transactions touching disjoint
/// keys never conflict on it.
pub struct TDict<K, V> {
    slots: TCell<BTreeMap<K, TCell<Option<V>>>>,
    len: TCell<usize>,
}

impl<K, V> Clone for TDict<K, V> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            len: self.len.clone(),
        }
    }
}

impl<K, V> Default for TDict<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TDict<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: TCell::new(BTreeMap::new()),
            len: TCell::new(0),
        }
    }

    /// Number of present entries.
    pub fn len(&self) -> Result<usize> {
        self.len.read()
    }

    /// Whether the dictionary holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Look up `key`.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        match self.slots.read()?.get(key) {
            Some(slot) => slot.read(),
            None => Ok(None),
        }
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert `value` at `key`, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        let slot = self.slot_for(key)?;
        let prev = slot.read()?;
        slot.write(Some(value))?;
        if prev.is_none() {
            self.len.commute(|n| *n += 1)?;
        }
        Ok(prev)
    }

    /// Remove `key`, returning the removed value.
    ///
    /// The slot cell is tombstoned rather than deleted, so removal does
    /// not conflict with readers and writers of other keys.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let Some(slot) = self.slots.read()?.get(key).cloned() else {
            return Ok(None);
        };
        let prev = slot.read()?;
        if prev.is_some() {
            slot.write(None)?;
            self.len.commute(|n| *n -= 1)?;
        }
        Ok(prev)
    }

    /// Present keys, in order.
    pub fn keys(&self) -> Result<Vec<K>> {
        let mut keys = Vec::new();
        for (key, slot) in &self.slots.read()? {
            if slot.read()?.is_some() {
                keys.push(key.clone());
            }
        }
        Ok(keys)
    }

    /// Present entries, in key order.
    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        let mut entries = Vec::new();
        for (key, slot) in &self.slots.read()? {
            if let Some(value) = slot.read()? {
                entries.push((key.clone(), value));
            }
        }
        Ok(entries)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<()> {
        for slot in self.slots.read()?.values() {
            if slot.read()?.is_some() {
                slot.write(None)?;
            }
        }
        self.len.write(0)
    }

    /// The slot cell for `key`, allocating it inside the caller's
    /// transaction if the key has never been seen.
    fn slot_for(&self, key: K) -> Result<TCell<Option<V>>> {
        let directory = self.slots.read()?;
        if let Some(slot) = directory.get(&key) {
            return Ok(slot.clone());
        }
        let mut directory = directory;
        let slot = TCell::new(None);
        directory.insert(key, slot.clone());
        self.slots.write(directory)?;
        Ok(slot)
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
    fn insert_get_remove_roundtrip() {
        let dict: TDict<String, u32> = TDict::new();
        atomically(|| {
            assert_eq!(dict.insert("a".to_owned(), 1)?, None);
            assert_eq!(dict.insert("b".to_owned(), 2)?, None);
            assert_eq!(dict.insert("a".to_owned(), 3)?, Some(1));
            Ok::<_, StmError>(())
        })
        .unwrap();

        atomically(|| {
            assert_eq!(dict.get(&"a".to_owned())?, Some(3));
            assert_eq!(dict.len()?, 2);
            assert_eq!(dict.remove(&"a".to_owned())?, Some(3));
            assert_eq!(dict.remove(&"a".to_owned())?, None);
            assert_eq!(dict.len()?, 1);
            Ok::<_, StmError>(())
        })
        .unwrap();
    }

    #[test]
    fn reads_observe_same_transaction_inserts() {
        let dict: TDict<u32, u32> = TDict::new();
        atomically(|| {
            dict.insert(1, 10)?;
            // Visible before the commit, within the same transaction.
            assert_eq!(dict.get(&1)?, Some(10));
            assert_eq!(dict.len()?, 1);
            Ok::<_, StmError>(())
        })
        .unwrap();
    }

    #[test]
    fn entries_skip_tombstones_and_stay_ordered() {
        let dict: TDict<u32, &'static str> = TDict::new();
        atomically(|| {
            for (k, v) in [(3, "c"), (1, "a"), (2, "b")] {
                dict.insert(k, v)?;
            }
            Ok::<_, StmError>(())
        })
        .unwrap();
        atomically(|| dict.remove(&2)).unwrap();

        let entries = atomically(|| dict.entries()).unwrap();
        assert_eq!(entries, vec![(1, "a"), (3, "c")]);
        let keys = atomically(|| dict.keys()).unwrap();
        assert_eq!(keys, vec![1, 3]);
    }

    #[test]
    fn clear_empties_and_resets_length() {
        let dict: TDict<u32, u32> = TDict::new();
        atomically(|| {
            dict.insert(1, 1)?;
            dict.insert(2, 2)?;
            Ok::<_, StmError>(())
        })
        .unwrap();
        atomically(|| dict.clear()).unwrap();
        assert_eq!(atomically(|| dict.len()).unwrap(), 0);
        assert_eq!(atomically(|| dict.get(&1)).unwrap(), None);
    }

    #[test]
    fn concurrent_inserts_of_distinct_keys_keep_exact_length() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;

        let dict: Arc<TDict<usize, usize>> = Arc::new(TDict::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let attempts = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let dict = Arc::clone(&dict);
                let barrier = Arc::clone(&barrier);
                let attempts = Arc::clone(&attempts);
                std::thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_THREAD {
                        let key = t * PER_THREAD + i;
                        atomically(|| {
                            attempts.fetch_add(1, Ordering::Relaxed);
                            dict.insert(key, key)?;
                            Ok::<_, StmError>(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(atomically(|| dict.len()).unwrap(), THREADS * PER_THREAD);
        assert_eq!(
            atomically(|| dict.entries()).unwrap().len(),
            THREADS * PER_THREAD
        );
        // Fresh keys mutate the directory, so retries are expected; the
        // commuted length counter must still be exact.
        assert!(attempts.load(Ordering::Relaxed) >= THREADS * PER_THREAD);
    }

    #[test]
    fn rewriting_an_existing_key_does_not_touch_the_directory() {
        let dict: Arc<TDict<u32, u32>> = Arc::new(TDict::new());
        atomically(|| {
            dict.insert(1, 0)?;
            dict.insert(2, 0)?;
            Ok::<_, StmError>(())
        })
        .unwrap();

        // Two threads rewriting different existing keys run without any
        // shared write target: neither touches the directory or the length.
        let barrier = Arc::new(Barrier::new(2));
        let attempts = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = [1u32, 2u32]
            .into_iter()
            .map(|key| {
                let dict = Arc::clone(&dict);
                let barrier = Arc::clone(&barrier);
                let attempts = Arc::clone(&attempts);
                std::thread::spawn(move || {
                    barrier.wait();
                    atomically(|| {
                        attempts.fetch_add(1, Ordering::Relaxed);
                        dict.insert(key, key * 10)?;
                        Ok::<_, StmError>(())
                    })
                    .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(atomically(|| dict.get(&1)).unwrap(), Some(10));
        assert_eq!(atomically(|| dict.get(&2)).unwrap(), Some(20));
        assert_eq!(atomically(|| dict.len()).unwrap(), 2);
        assert_eq!(attempts.load(Ordering::Relaxed), 2, "disjoint keys must not conflict");
    }
}
