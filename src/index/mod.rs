//! 正/反向索引对：forward（key → id）与 reverse（id → key）。
//!
//! ## 一致性
//! - 一次逻辑操作（add / drop / drop_id）只写一个日志帧，回放时整体生效或整体丢弃。
//! - 两张表在 `apply_gate` 写锁内依次发布；所有读路径先拿读锁再取快照，
//!   所以读者永远看不到“只有正向没有反向”的半对。
//! - 单值一侧被覆盖时，旧配对的另一半会在同一次 apply 里一起删除。

pub mod attribute;
pub mod rdn;

use std::cmp::Ordering as CmpOrdering;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::Id;
use crate::error::{Result, StoreError};
use crate::schema::{Comparator, NaturalOrder};
use crate::storage::{Backing, BackingOptions};
use crate::table::{AvlTable, Datum, Table, TableCursor, TableSnapshot, TableSpec, ValueCursor};

pub use attribute::AttributeIndex;
pub use rdn::RdnIndex;

/// 索引 key 的约束：可比较相等、可序列化进日志
pub trait IndexKey: Datum + PartialEq + Serialize + DeserializeOwned {}

impl<T: Datum + PartialEq + Serialize + DeserializeOwned> IndexKey for T {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IndexRecord<K> {
    Add { key: K, id: Id },
    Drop { key: K, id: Id },
    DropId { id: Id },
}

type ForwardRows<K> = Vec<(K, Vec<Id>)>;

/// 同一时刻的一对快照
pub struct IndexSnapshot<K> {
    pub forward: Arc<TableSnapshot<K, Id>>,
    pub reverse: Arc<TableSnapshot<Id, K>>,
}

pub struct Index<K> {
    name: String,
    key_cmp: Arc<dyn Comparator<K>>,
    forward: AvlTable<K, Id>,
    reverse: AvlTable<Id, K>,
    apply_gate: RwLock<()>,
    /// 写者互斥；持久化索引同时持有日志
    writer: Mutex<Option<Backing<IndexRecord<K>>>>,
    closed: AtomicBool,
}

impl<K: IndexKey> Index<K> {
    /// `multi_valued`：一个 key 可对应多个 id、一个 id 可对应多个 key（属性索引）；
    /// 否则两侧都是单值（RDN 索引）。
    pub fn in_memory(name: &str, key_cmp: Arc<dyn Comparator<K>>, multi_valued: bool) -> Self {
        let id_cmp: Arc<dyn Comparator<Id>> = Arc::new(NaturalOrder::<Id>::new());
        let fwd = TableSpec::new(name, key_cmp.clone());
        let rev = TableSpec::new(name, id_cmp.clone());
        let (fwd, rev) = if multi_valued {
            (fwd.with_duplicates(id_cmp), rev.with_duplicates(key_cmp.clone()))
        } else {
            (
                fwd.with_value_comparator(id_cmp),
                rev.with_value_comparator(key_cmp.clone()),
            )
        };
        Self {
            name: name.to_string(),
            key_cmp,
            forward: AvlTable::new(fwd),
            reverse: AvlTable::new(rev),
            apply_gate: RwLock::new(()),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// 打开 `<dir>/<name>.db|.wal`；checkpoint 只存正向行，反向表在恢复时重建
    pub fn open(
        dir: &Path,
        name: &str,
        key_cmp: Arc<dyn Comparator<K>>,
        multi_valued: bool,
        options: BackingOptions,
    ) -> Result<Self> {
        let index = Self::in_memory(name, key_cmp, multi_valued);
        let (backing, recovered) = Backing::open::<ForwardRows<K>>(dir, name, options)?;
        for (key, ids) in recovered.state.unwrap_or_default() {
            for id in ids {
                index.apply(&IndexRecord::Add {
                    key: key.clone(),
                    id,
                })?;
            }
        }
        let replayed = recovered.records.len();
        for rec in &recovered.records {
            index.apply(rec)?;
        }
        tracing::debug!(
            "index `{}` recovered: {} pair(s), {} replayed record(s)",
            name,
            index.forward.count()?,
            replayed
        );
        *index.writer.lock() = Some(backing);
        Ok(index)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_comparator(&self) -> &Arc<dyn Comparator<K>> {
        &self.key_cmp
    }

    pub fn is_persistent(&self) -> bool {
        self.writer.lock().is_some()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn keys_equal(&self, a: &K, b: &K) -> bool {
        self.key_cmp.compare(a, b) == CmpOrdering::Equal
    }

    /// 在 gate 写锁内把一条记录同时作用到两张表
    fn apply(&self, rec: &IndexRecord<K>) -> Result<()> {
        let _g = self.apply_gate.write();
        match rec {
            IndexRecord::Add { key, id } => {
                if !self.forward.is_dup_allowed() {
                    if let Some(old) = self.forward.get(key)? {
                        if old != *id {
                            self.reverse.remove_value(&old, key)?;
                        }
                    }
                }
                if !self.reverse.is_dup_allowed() {
                    if let Some(old) = self.reverse.get(id)? {
                        if !self.keys_equal(&old, key) {
                            self.forward.remove_value(&old, id)?;
                        }
                    }
                }
                self.forward.put(key.clone(), *id)?;
                self.reverse.put(*id, key.clone())?;
            }
            IndexRecord::Drop { key, id } => {
                self.forward.remove_value(key, id)?;
                self.reverse.remove_value(id, key)?;
            }
            IndexRecord::DropId { id } => {
                for key in self.reverse.remove(id)? {
                    self.forward.remove_value(&key, id)?;
                }
            }
        }
        Ok(())
    }

    /// 写路径：写者锁内先做 `check`（看到的是最新一对快照），再记日志，最后 apply。
    /// `check` 返回 `Ok(false)` 表示无事可做，不写日志。
    pub(crate) fn write_with(
        &self,
        rec: IndexRecord<K>,
        check: impl FnOnce(&IndexSnapshot<K>) -> Result<bool>,
    ) -> Result<bool> {
        self.check_open()?;
        let mut writer = self.writer.lock();
        let snap = self.snapshot()?;
        if !check(&snap)? {
            return Ok(false);
        }
        drop(snap);
        if let Some(backing) = writer.as_mut() {
            backing.append(std::slice::from_ref(&rec))?;
        }
        self.apply(&rec)?;
        if let Some(backing) = writer.as_mut() {
            backing.maybe_checkpoint(|| Ok(self.forward.snapshot()?.to_rows()));
        }
        Ok(true)
    }

    /// 返回 false 表示该配对已存在
    pub fn add(&self, key: K, id: Id) -> Result<bool> {
        let wanted = key.clone();
        self.write_with(IndexRecord::Add { key, id }, |s| {
            Ok(!(s.forward.has_value(&wanted, &id) && s.reverse.has_value(&id, &wanted)))
        })
    }

    /// 只删除这一对；返回是否存在
    pub fn drop(&self, key: &K, id: Id) -> Result<bool> {
        self.write_with(
            IndexRecord::Drop {
                key: key.clone(),
                id,
            },
            |s| Ok(s.forward.has_value(key, &id)),
        )
    }

    /// 删除 id 的全部配对；返回 id 是否在索引中
    pub fn drop_id(&self, id: Id) -> Result<bool> {
        self.write_with(IndexRecord::DropId { id }, |s| Ok(s.reverse.has(&id)))
    }

    /// 一对一致的快照
    pub fn snapshot(&self) -> Result<IndexSnapshot<K>> {
        self.check_open()?;
        let _g = self.apply_gate.read();
        Ok(IndexSnapshot {
            forward: self.forward.snapshot()?,
            reverse: self.reverse.snapshot()?,
        })
    }

    fn forward_snapshot(&self) -> Result<Arc<TableSnapshot<K, Id>>> {
        self.check_open()?;
        let _g = self.apply_gate.read();
        self.forward.snapshot()
    }

    fn reverse_snapshot(&self) -> Result<Arc<TableSnapshot<Id, K>>> {
        self.check_open()?;
        let _g = self.apply_gate.read();
        self.reverse.snapshot()
    }

    pub fn forward_lookup(&self, key: &K) -> Result<Option<Id>> {
        Ok(self.forward_snapshot()?.get(key))
    }

    pub fn reverse_lookup(&self, id: Id) -> Result<Option<K>> {
        Ok(self.reverse_snapshot()?.get(&id))
    }

    pub fn forward_values(&self, key: &K) -> Result<Vec<Id>> {
        Ok(self.forward_snapshot()?.values(key))
    }

    pub fn reverse_values(&self, id: Id) -> Result<Vec<K>> {
        Ok(self.reverse_snapshot()?.values(&id))
    }

    pub fn has(&self, key: &K, id: Id) -> Result<bool> {
        Ok(self.forward_snapshot()?.has_value(key, &id))
    }

    pub fn has_forward(&self, key: &K) -> Result<bool> {
        Ok(self.forward_snapshot()?.has(key))
    }

    pub fn has_reverse(&self, id: Id) -> Result<bool> {
        Ok(self.reverse_snapshot()?.has(&id))
    }

    pub fn forward_cursor(&self) -> Result<TableCursor<K, Id>> {
        Ok(TableCursor::new(self.forward_snapshot()?))
    }

    pub fn reverse_cursor(&self) -> Result<TableCursor<Id, K>> {
        Ok(TableCursor::new(self.reverse_snapshot()?))
    }

    /// key 下所有 id
    pub fn forward_cursor_at(&self, key: &K) -> Result<ValueCursor<Id>> {
        let snap = self.forward_snapshot()?;
        Ok(ValueCursor::new(&*snap, key))
    }

    /// id 的所有 key
    pub fn reverse_cursor_at(&self, id: Id) -> Result<ValueCursor<K>> {
        let snap = self.reverse_snapshot()?;
        Ok(ValueCursor::new(&*snap, &id))
    }

    /// 正向 tuple 数（= 配对数）
    pub fn count(&self) -> Result<usize> {
        Ok(self.forward_snapshot()?.count())
    }

    pub fn key_count(&self) -> Result<usize> {
        Ok(self.forward_snapshot()?.key_count())
    }

    pub fn count_key(&self, key: &K) -> Result<usize> {
        Ok(self.forward_snapshot()?.count_key(key))
    }

    pub fn greater_than_count(&self, key: &K) -> Result<usize> {
        Ok(self.forward_snapshot()?.greater_than_count(key))
    }

    pub fn less_than_count(&self, key: &K) -> Result<usize> {
        Ok(self.forward_snapshot()?.less_than_count(key))
    }

    pub fn journal_bytes(&self) -> u64 {
        self.writer.lock().as_ref().map_or(0, |b| b.journal_bytes())
    }

    /// 正反向逐对互查；返回发现的问题
    pub fn verify(&self) -> Result<Vec<String>>
    where
        K: std::fmt::Debug,
    {
        let snap = self.snapshot()?;
        let mut problems = Vec::new();
        for i in 0..snap.forward.count() {
            if let Some((key, id)) = snap.forward.entry_at(i) {
                if !snap.reverse.has_value(id, key) {
                    problems.push(format!(
                        "index `{}`: forward {:?} -> {} has no reverse pair",
                        self.name, key, id
                    ));
                }
            }
        }
        for i in 0..snap.reverse.count() {
            if let Some((id, key)) = snap.reverse.entry_at(i) {
                if !snap.forward.has_value(key, id) {
                    problems.push(format!(
                        "index `{}`: reverse {} -> {:?} has no forward pair",
                        self.name, id, key
                    ));
                }
            }
        }
        Ok(problems)
    }

    /// 持久化索引：写 checkpoint 并清空日志
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        let mut writer = self.writer.lock();
        if let Some(backing) = writer.as_mut() {
            let rows = self.forward.snapshot()?.to_rows();
            backing.checkpoint(&rows)?;
        }
        Ok(())
    }

    /// 幂等；即使某一步失败也会继续释放其余资源，返回第一个错误
    pub fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _g = self.apply_gate.write();
        let mut first_err = None;
        if let Some(backing) = writer.as_mut() {
            if let Err(e) = backing.sync() {
                first_err.get_or_insert(e);
            }
        }
        *writer = None;
        for r in [self.forward.close(), self.reverse.close()] {
            if let Err(e) = r {
                first_err.get_or_insert(e);
            }
        }
        tracing::debug!("index `{}` closed", self.name);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use crate::storage::tests::unique_tmp_dir;
    use crate::table::Tuple;

    fn multi(name: &str) -> Index<String> {
        Index::in_memory(name, Arc::new(NaturalOrder::<String>::new()), true)
    }

    fn single(name: &str) -> Index<String> {
        Index::in_memory(name, Arc::new(NaturalOrder::<String>::new()), false)
    }

    #[test]
    fn add_is_visible_both_ways_and_drop_id_clears() {
        let idx = multi("cn");
        idx.add("alice".into(), 1).unwrap();
        idx.add("alice".into(), 2).unwrap();
        idx.add("al".into(), 1).unwrap();

        let mut fwd = idx.forward_cursor().unwrap();
        fwd.before(&Tuple::new("alice".to_string(), 0)).unwrap();
        assert!(fwd.next().unwrap());
        assert_eq!(fwd.get().unwrap(), Tuple::new("alice".to_string(), 1));

        assert_eq!(idx.reverse_values(1).unwrap(), vec!["al", "alice"]);
        assert!(!idx.add("alice".into(), 1).unwrap());

        assert!(idx.drop_id(1).unwrap());
        assert!(!idx.has(&"alice".into(), 1).unwrap());
        assert!(!idx.has_reverse(1).unwrap());
        assert_eq!(idx.forward_values(&"alice".into()).unwrap(), vec![2]);
        assert!(!idx.has_forward(&"al".into()).unwrap());
        assert!(!idx.drop_id(1).unwrap());
    }

    #[test]
    fn drop_pair_leaves_other_pairs() {
        let idx = multi("mail");
        idx.add("a".into(), 1).unwrap();
        idx.add("b".into(), 1).unwrap();
        assert!(idx.drop(&"a".into(), 1).unwrap());
        assert!(!idx.drop(&"a".into(), 1).unwrap());
        assert_eq!(idx.reverse_values(1).unwrap(), vec!["b"]);
        assert!(idx.verify().unwrap().is_empty());
    }

    #[test]
    fn single_valued_overwrite_keeps_pairs_consistent() {
        let idx = single("loc");
        idx.add("x".into(), 1).unwrap();
        // 同一 key 换 id：旧 id 的反向项随之删除
        idx.add("x".into(), 2).unwrap();
        assert_eq!(idx.reverse_lookup(1).unwrap(), None);
        // 同一 id 换 key：旧 key 的正向项随之删除
        idx.add("y".into(), 2).unwrap();
        assert_eq!(idx.forward_lookup(&"x".into()).unwrap(), None);
        assert_eq!(idx.forward_lookup(&"y".into()).unwrap(), Some(2));
        assert!(idx.verify().unwrap().is_empty());
        assert_eq!(idx.count().unwrap(), 1);
    }

    #[test]
    fn counts_follow_forward_order() {
        let idx = multi("ord");
        for (k, id) in [("a", 1), ("b", 2), ("b", 3), ("c", 4)] {
            idx.add(k.into(), id).unwrap();
        }
        assert_eq!(idx.count().unwrap(), 4);
        assert_eq!(idx.key_count().unwrap(), 3);
        assert_eq!(idx.count_key(&"b".into()).unwrap(), 2);
        assert_eq!(idx.greater_than_count(&"a".into()).unwrap(), 3);
        assert_eq!(idx.less_than_count(&"c".into()).unwrap(), 3);
        let ids: Vec<Id> = idx
            .forward_cursor_at(&"b".into())
            .unwrap()
            .elements()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn persistent_index_recovers_pairs() {
        let dir = unique_tmp_dir("index-recover");
        let cmp: Arc<dyn Comparator<String>> = Arc::new(NaturalOrder::<String>::new());
        {
            let idx = Index::open(&dir, "ou", cmp.clone(), true, BackingOptions::default()).unwrap();
            idx.add("sales".into(), 5).unwrap();
            idx.add("eng".into(), 6).unwrap();
            idx.sync().unwrap();
            idx.add("ops".into(), 7).unwrap();
            idx.drop_id(6).unwrap();
            idx.close().unwrap();
        }
        let idx = Index::open(&dir, "ou", cmp, true, BackingOptions::default()).unwrap();
        assert_eq!(idx.forward_lookup(&"sales".into()).unwrap(), Some(5));
        assert_eq!(idx.reverse_lookup(7).unwrap(), Some("ops".to_string()));
        assert!(!idx.has_reverse(6).unwrap());
        assert!(idx.verify().unwrap().is_empty());
    }

    #[test]
    fn closed_index_rejects_and_close_is_idempotent() {
        let idx = multi("closed");
        idx.add("a".into(), 1).unwrap();
        idx.close().unwrap();
        idx.close().unwrap();
        assert!(matches!(idx.add("b".into(), 2), Err(StoreError::Closed(_))));
        assert!(matches!(idx.forward_cursor(), Err(StoreError::Closed(_))));
    }

    #[test]
    fn readers_never_see_half_pairs() {
        let idx = Arc::new(multi("race"));
        let writer = {
            let idx = idx.clone();
            std::thread::spawn(move || {
                for id in 0..300u64 {
                    idx.add(format!("k{}", id % 7), id).unwrap();
                    if id % 3 == 0 {
                        idx.drop_id(id / 2).unwrap();
                    }
                }
            })
        };
        for _ in 0..100 {
            let snap = idx.snapshot().unwrap();
            assert_eq!(snap.forward.count(), snap.reverse.count());
        }
        writer.join().unwrap();
        assert!(idx.verify().unwrap().is_empty());
    }
}
