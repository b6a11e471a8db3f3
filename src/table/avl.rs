use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::table::{Datum, Table, TableSnapshot, TableSpec};

/// 内存表：当前版本放在 `ArcSwap` 里，读者无锁取快照；写者串行化在 `write` 上，
/// 基于当前版本 copy-on-write 出新版本后一次性发布。
pub struct AvlTable<K, V> {
    name: String,
    duplicates: bool,
    current: ArcSwap<TableSnapshot<K, V>>,
    write: Mutex<()>,
    closed: AtomicBool,
}

impl<K: Datum, V: Datum + PartialEq> AvlTable<K, V> {
    pub fn new(spec: TableSpec<K, V>) -> Self {
        let snap = TableSnapshot::empty(&spec);
        Self::from_snapshot(&spec, snap)
    }

    pub(crate) fn from_snapshot(spec: &TableSpec<K, V>, snap: TableSnapshot<K, V>) -> Self {
        Self {
            name: spec.name().to_string(),
            duplicates: spec.is_dup_allowed(),
            current: ArcSwap::from_pointee(snap),
            write: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(self.name.clone()));
        }
        Ok(())
    }

    /// 在写锁内基于当前版本修改并发布；`f` 看到的是私有副本
    pub(crate) fn apply<R>(&self, f: impl FnOnce(&mut TableSnapshot<K, V>) -> R) -> Result<R> {
        self.check_open()?;
        let _w = self.write.lock();
        let current = self.current.load_full();
        let mut next = (*current).clone();
        let r = f(&mut next);
        self.current.store(Arc::new(next));
        Ok(r)
    }
}

impl<K: Datum, V: Datum + PartialEq> Table<K, V> for AvlTable<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_dup_allowed(&self) -> bool {
        self.duplicates
    }

    fn snapshot(&self) -> Result<Arc<TableSnapshot<K, V>>> {
        self.check_open()?;
        Ok(self.current.load_full())
    }

    fn put(&self, key: K, value: V) -> Result<bool> {
        self.apply(|s| s.put(key, value))
    }

    fn remove(&self, key: &K) -> Result<Vec<V>> {
        self.apply(|s| s.remove(key))
    }

    fn remove_value(&self, key: &K, value: &V) -> Result<bool> {
        self.apply(|s| s.remove_value(key, value))
    }

    fn sync(&self) -> Result<()> {
        self.check_open()
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("table `{}` closed", self.name);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::single_spec;

    #[test]
    fn concurrent_readers_see_whole_versions() {
        let t = Arc::new(AvlTable::new(single_spec("threads")));
        let writer = {
            let t = t.clone();
            std::thread::spawn(move || {
                for i in 0..500u64 {
                    t.put(i, i * 2).unwrap();
                }
            })
        };
        for _ in 0..50 {
            let snap = t.snapshot().unwrap();
            let n = snap.count();
            // 每个版本都是 0..n 的前缀
            for i in 0..n as u64 {
                assert_eq!(snap.get(&i), Some(i * 2));
            }
        }
        writer.join().unwrap();
        assert_eq!(t.count().unwrap(), 500);
    }
}
