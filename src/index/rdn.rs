use std::path::Path;
use std::sync::Arc;

use crate::core::{Id, ParentIdAndRdn, Rdn};
use crate::error::{Result, StoreError};
use crate::index::{Index, IndexRecord};
use crate::schema::{Comparator, NaturalOrder};
use crate::storage::BackingOptions;
use crate::table::{TableCursor, TableSnapshot};

pub const RDN_INDEX_NAME: &str = "rdn";

/// 目录树的结构编码：`(parentId, rdn) ↔ id`，两侧都是单值。
///
/// - 同一个 parent 下 RDN 唯一；一个 id 同一时刻只有一个位置。
///   两者都在写锁内检查，冲突返回 `AlreadyExists`。
/// - 移动/改名 = 先 `drop` 再 `add`，不做原地改 key。
/// - 因为 key 以 parent 打头，某个 parent 的孩子在正向表里是一段连续区间。
pub struct RdnIndex {
    index: Index<ParentIdAndRdn>,
}

fn key_comparator() -> Arc<dyn Comparator<ParentIdAndRdn>> {
    Arc::new(NaturalOrder::<ParentIdAndRdn>::new())
}

impl RdnIndex {
    pub fn in_memory() -> Self {
        Self {
            index: Index::in_memory(RDN_INDEX_NAME, key_comparator(), false),
        }
    }

    pub fn open(dir: &Path, options: BackingOptions) -> Result<Self> {
        Ok(Self {
            index: Index::open(dir, RDN_INDEX_NAME, key_comparator(), false, options)?,
        })
    }

    pub fn index(&self) -> &Index<ParentIdAndRdn> {
        &self.index
    }

    pub fn add(&self, key: ParentIdAndRdn, id: Id) -> Result<()> {
        let wanted = key.clone();
        self.index.write_with(IndexRecord::Add { key, id }, |s| {
            if let Some(&existing) = s.forward.get_ref(&wanted) {
                if existing == id {
                    return Ok(false);
                }
                return Err(StoreError::AlreadyExists(format!(
                    "{wanted} is taken by entry {existing}"
                )));
            }
            if let Some(at) = s.reverse.get_ref(&id) {
                return Err(StoreError::AlreadyExists(format!(
                    "entry {id} is already placed at {at}"
                )));
            }
            Ok(true)
        })?;
        Ok(())
    }

    /// 只有当前映射确实是 `key → id` 时才删除，防止过期调用方删掉已被重新分配的位置
    pub fn drop(&self, key: &ParentIdAndRdn, id: Id) -> Result<()> {
        self.index.write_with(
            IndexRecord::Drop {
                key: key.clone(),
                id,
            },
            |s| match s.forward.get_ref(key) {
                Some(&stored) if stored == id => Ok(true),
                Some(&stored) => Err(StoreError::not_found(format!(
                    "{key} maps to entry {stored}, not {id}"
                ))),
                None => Err(StoreError::not_found(key)),
            },
        )?;
        Ok(())
    }

    pub fn drop_id(&self, id: Id) -> Result<bool> {
        self.index.drop_id(id)
    }

    pub fn lookup(&self, parent_id: Id, rdn: &Rdn) -> Result<Option<Id>> {
        self.index
            .forward_lookup(&ParentIdAndRdn::new(parent_id, rdn.clone()))
    }

    /// id 在树里的位置
    pub fn location(&self, id: Id) -> Result<Option<ParentIdAndRdn>> {
        self.index.reverse_lookup(id)
    }

    /// 直接孩子（按 RDN 排序）；游标被限定在该 parent 的区间内
    pub fn children(&self, parent_id: Id) -> Result<TableCursor<ParentIdAndRdn, Id>> {
        let snap = self.index.snapshot()?;
        let (lo, hi) = child_range(&snap.forward, parent_id);
        Ok(TableCursor::bounded(snap.forward, lo, hi))
    }

    pub fn child_count(&self, parent_id: Id) -> Result<usize> {
        let snap = self.index.snapshot()?;
        let (lo, hi) = child_range(&snap.forward, parent_id);
        Ok(hi - lo)
    }

    pub fn has_children(&self, parent_id: Id) -> Result<bool> {
        Ok(self.child_count(parent_id)? > 0)
    }

    pub fn count(&self) -> Result<usize> {
        self.index.count()
    }

    pub fn verify(&self) -> Result<Vec<String>> {
        self.index.verify()
    }

    pub fn sync(&self) -> Result<()> {
        self.index.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.index.close()
    }
}

/// `[(parent, 空RDN), (parent + 1, 空RDN))` 对应的扁平下标区间
fn child_range(fwd: &TableSnapshot<ParentIdAndRdn, Id>, parent_id: Id) -> (usize, usize) {
    let lo = fwd.less_than_count(&ParentIdAndRdn::lowest_child_of(parent_id));
    let hi = match parent_id.checked_add(1) {
        Some(next) => fwd.less_than_count(&ParentIdAndRdn::lowest_child_of(next)),
        None => fwd.count(),
    };
    (lo, hi)
}
