use super::engine::{Engine, ScanIterator, Status};
use crate::error::Result;

use std::collections::BTreeMap;

/// An in-memory key/value storage engine using the Rust standard library's
/// B-tree implementation. Data is not durable across restarts. Used for
/// tests and ephemeral clusters; durable engines plug in behind the same
/// Engine trait.
pub struct Memory {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new Memory engine.
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl Engine for Memory {
    type ScanIterator<'a> = Iter<'a>;

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        Iter { inner: self.data.range(range) }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn ScanIterator + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: "memory".to_string(),
            keys: self.data.len() as u64,
            size: self.data.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum(),
        })
    }
}

/// An iterator over a range of keys in a Memory engine.
pub struct Iter<'a> {
    inner: std::collections::btree_map::Range<'a, Vec<u8>, Vec<u8>>,
}

impl Iterator for Iter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| Ok((k.clone(), v.clone())))
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|(k, v)| Ok((k.clone(), v.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ops() -> Result<()> {
        let mut engine = Memory::new();

        assert_eq!(engine.get(b"a")?, None);
        engine.set(b"a", vec![1])?;
        assert_eq!(engine.get(b"a")?, Some(vec![1]));
        engine.set(b"a", vec![2])?;
        assert_eq!(engine.get(b"a")?, Some(vec![2]));
        engine.delete(b"a")?;
        assert_eq!(engine.get(b"a")?, None);

        // Deleting a missing key is a noop.
        engine.delete(b"b")?;
        Ok(())
    }

    #[test]
    fn scan_ranges() -> Result<()> {
        let mut engine = Memory::new();
        for key in [b"a", b"b", b"c", b"d"] {
            engine.set(key, key.to_vec())?;
        }

        let scan = |engine: &mut Memory, range: std::ops::Range<Vec<u8>>| -> Result<Vec<Vec<u8>>> {
            engine.scan(range).map(|r| r.map(|(k, _)| k)).collect()
        };

        assert_eq!(
            scan(&mut engine, b"b".to_vec()..b"d".to_vec())?,
            vec![b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(scan(&mut engine, b"x".to_vec()..b"y".to_vec())?, Vec::<Vec<u8>>::new());

        let reverse: Vec<Vec<u8>> =
            engine.scan(..).rev().map(|r| r.map(|(k, _)| k)).collect::<Result<_>>()?;
        assert_eq!(reverse, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        Ok(())
    }
}
