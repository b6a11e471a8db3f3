//! 有序 key→value 表。
//!
//! ## 契约
//! - 迭代顺序永远是 key 比较器的顺序；允许重复时同一 key 下的值再按值比较器排序。
//! - 重复值按集合处理：同一个 (k, v) 插入两次只存一份。
//! - 不允许重复时每个 key 至多一个值，第二次 `put` 覆盖。
//! - 每次写入都基于当前快照做 copy-on-write 并原子发布；读者与游标只看已发布的快照。
//!
//! 两种实现共用同一份契约：[`AvlTable`]（纯内存）与 [`FileTable`]（内存 + 日志/checkpoint）。

pub mod avl;
pub mod cursor;
pub mod file;

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::Comparator;
use crate::tree::{AvlTree, Weigh};

pub use avl::AvlTable;
pub use cursor::{TableCursor, ValueCursor};
pub use file::{FileTable, TableRecord};

/// 表里 key / value 的公共约束
pub trait Datum: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Datum for T {}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> Tuple<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

/// 建表参数：名字（也是持久化文件名）、key 比较器、可选的值比较器、是否允许重复
pub struct TableSpec<K, V> {
    name: String,
    key_cmp: Arc<dyn Comparator<K>>,
    value_cmp: Option<Arc<dyn Comparator<V>>>,
    duplicates: bool,
}

impl<K, V> Clone for TableSpec<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            key_cmp: self.key_cmp.clone(),
            value_cmp: self.value_cmp.clone(),
            duplicates: self.duplicates,
        }
    }
}

impl<K, V> TableSpec<K, V> {
    pub fn new(name: &str, key_cmp: Arc<dyn Comparator<K>>) -> Self {
        Self {
            name: name.to_string(),
            key_cmp,
            value_cmp: None,
            duplicates: false,
        }
    }

    /// 允许重复值；重复值必须有序，所以必须同时给出值比较器
    pub fn with_duplicates(mut self, value_cmp: Arc<dyn Comparator<V>>) -> Self {
        self.value_cmp = Some(value_cmp);
        self.duplicates = true;
        self
    }

    /// 单值表也可以指定值比较器（`has_value` / 游标 seek 时使用）
    pub fn with_value_comparator(mut self, value_cmp: Arc<dyn Comparator<V>>) -> Self {
        self.value_cmp = Some(value_cmp);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dup_allowed(&self) -> bool {
        self.duplicates
    }

    pub fn key_comparator(&self) -> &Arc<dyn Comparator<K>> {
        &self.key_cmp
    }

    pub fn value_comparator(&self) -> Option<&Arc<dyn Comparator<V>>> {
        self.value_cmp.as_ref()
    }
}

/// 一个 key 下的值：大多数 key 只有一个值，用 One 省掉一棵子树；
/// 第二个值到来时升级为 Many，删到只剩一个时再退回 One。
#[derive(Clone)]
pub(crate) enum Values<V> {
    One(V),
    Many(AvlTree<V, ()>),
}

impl<V> Weigh for Values<V> {
    fn weight(&self) -> usize {
        match self {
            Values::One(_) => 1,
            Values::Many(t) => t.len(),
        }
    }
}

impl<V> Values<V> {
    pub(crate) fn first(&self) -> Option<&V> {
        match self {
            Values::One(v) => Some(v),
            Values::Many(t) => t.first().map(|(v, _)| v),
        }
    }

    pub(crate) fn nth(&self, i: usize) -> Option<&V> {
        match self {
            Values::One(v) if i == 0 => Some(v),
            Values::One(_) => None,
            Values::Many(t) => t.select(i).map(|(v, _)| v),
        }
    }

    pub(crate) fn to_vec(&self) -> Vec<V>
    where
        V: Clone,
    {
        match self {
            Values::One(v) => vec![v.clone()],
            Values::Many(t) => t.iter().map(|(v, _)| v.clone()).collect(),
        }
    }
}

/// 某一时刻表的不可变版本。克隆只复制根指针。
pub struct TableSnapshot<K, V> {
    tree: AvlTree<K, Values<V>>,
    value_cmp: Option<Arc<dyn Comparator<V>>>,
    duplicates: bool,
}

impl<K, V> Clone for TableSnapshot<K, V> {
    fn clone(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            value_cmp: self.value_cmp.clone(),
            duplicates: self.duplicates,
        }
    }
}

impl<K: Datum, V: Datum + PartialEq> TableSnapshot<K, V> {
    pub fn empty(spec: &TableSpec<K, V>) -> Self {
        Self {
            tree: AvlTree::new(spec.key_cmp.clone()),
            value_cmp: spec.value_cmp.clone(),
            duplicates: spec.duplicates,
        }
    }

    /// 从 checkpoint 行恢复
    pub fn from_rows(spec: &TableSpec<K, V>, rows: Vec<(K, Vec<V>)>) -> Self {
        let mut snap = Self::empty(spec);
        for (k, vs) in rows {
            for v in vs {
                snap.put(k.clone(), v);
            }
        }
        snap
    }

    pub fn to_rows(&self) -> Vec<(K, Vec<V>)> {
        self.tree
            .iter()
            .map(|(k, vals)| (k.clone(), vals.to_vec()))
            .collect()
    }

    pub fn is_dup_allowed(&self) -> bool {
        self.duplicates
    }

    pub fn key_comparator(&self) -> &Arc<dyn Comparator<K>> {
        self.tree.comparator()
    }

    fn value_order(&self, a: &V, b: &V) -> Ordering {
        match &self.value_cmp {
            Some(c) => c.compare(a, b),
            // 单值表且没有值比较器：值不参与排序
            None => Ordering::Equal,
        }
    }

    fn value_eq(&self, a: &V, b: &V) -> bool {
        match &self.value_cmp {
            Some(c) => c.compare(a, b) == Ordering::Equal,
            None => a == b,
        }
    }

    /// 单值，或重复模式下的第一个值
    pub fn get(&self, key: &K) -> Option<V> {
        self.tree.get(key).and_then(Values::first).cloned()
    }

    pub fn get_ref(&self, key: &K) -> Option<&V> {
        self.tree.get(key).and_then(Values::first)
    }

    pub fn values(&self, key: &K) -> Vec<V> {
        self.tree.get(key).map(Values::to_vec).unwrap_or_default()
    }

    pub fn has(&self, key: &K) -> bool {
        self.tree.contains_key(key)
    }

    pub fn has_value(&self, key: &K, value: &V) -> bool {
        match self.tree.get(key) {
            None => false,
            Some(Values::One(v)) => self.value_eq(v, value),
            Some(Values::Many(t)) => t.contains_key(value),
        }
    }

    pub fn has_greater_or_equal(&self, key: &K) -> bool {
        self.tree.rank(key, false).count < self.tree.len()
    }

    pub fn has_less_or_equal(&self, key: &K) -> bool {
        self.tree.rank(key, true).count > 0
    }

    /// tuple 总数（重复值逐个计数）
    pub fn count(&self) -> usize {
        self.tree.weight()
    }

    /// key 个数
    pub fn key_count(&self) -> usize {
        self.tree.len()
    }

    pub fn count_key(&self, key: &K) -> usize {
        self.tree.get(key).map_or(0, |vals| vals.weight())
    }

    /// key 严格大于 `key` 的 tuple 数
    pub fn greater_than_count(&self, key: &K) -> usize {
        self.count() - self.tree.rank(key, true).weight
    }

    /// key 严格小于 `key` 的 tuple 数
    pub fn less_than_count(&self, key: &K) -> usize {
        self.tree.rank(key, false).weight
    }

    /// key 在扁平 tuple 序列里占据的区间 `[lo, hi)`
    pub fn key_range(&self, key: &K) -> (usize, usize) {
        (
            self.tree.rank(key, false).weight,
            self.tree.rank(key, true).weight,
        )
    }

    /// `(key, value)` 在扁平 tuple 序列里的插入位置；`inclusive` 时越过相等的 tuple
    pub fn tuple_rank(&self, key: &K, value: &V, inclusive: bool) -> usize {
        let base = self.tree.rank(key, false).weight;
        let within = match self.tree.get(key) {
            None => 0,
            Some(Values::One(v)) => match self.value_order(v, value) {
                Ordering::Less => 1,
                Ordering::Equal => usize::from(inclusive),
                Ordering::Greater => 0,
            },
            Some(Values::Many(t)) => t.rank(value, inclusive).count,
        };
        base + within
    }

    /// 扁平序列里第 `index` 个 tuple（借用）
    pub fn entry_at(&self, index: usize) -> Option<(&K, &V)> {
        let (k, vals, off) = self.tree.select_weight(index)?;
        Some((k, vals.nth(off)?))
    }

    pub fn tuple_at(&self, index: usize) -> Option<Tuple<K, V>> {
        self.entry_at(index)
            .map(|(k, v)| Tuple::new(k.clone(), v.clone()))
    }

    pub(crate) fn values_of(&self, key: &K) -> Option<Values<V>> {
        self.tree.get(key).cloned()
    }

    pub(crate) fn value_comparator(&self) -> Option<&Arc<dyn Comparator<V>>> {
        self.value_cmp.as_ref()
    }

    /// 返回是否真的改变了内容
    pub fn put(&mut self, key: K, value: V) -> bool {
        if !self.duplicates {
            if self.tree.get(&key).is_some_and(|old| match old {
                Values::One(v) => *v == value,
                Values::Many(_) => false,
            }) {
                return false;
            }
            self.tree.insert(key, Values::One(value));
            return true;
        }

        let Some(cmp) = self.value_cmp.clone() else {
            // with_duplicates 保证了比较器存在
            self.tree.insert(key, Values::One(value));
            return true;
        };
        match self.tree.get(&key) {
            None => {
                self.tree.insert(key, Values::One(value));
                true
            }
            Some(Values::One(v)) if cmp.compare(v, &value) == Ordering::Equal => false,
            Some(Values::Many(t)) if t.contains_key(&value) => false,
            Some(_) => {
                self.tree
                    .update(&key, move |vals| match vals {
                        Values::One(v) => {
                            let mut t = AvlTree::new(cmp);
                            t.insert(v.clone(), ());
                            t.insert(value, ());
                            *vals = Values::Many(t);
                        }
                        Values::Many(t) => {
                            t.insert(value, ());
                        }
                    })
                    .is_some()
            }
        }
    }

    /// 删除 key 下所有值，返回被删除的值
    pub fn remove(&mut self, key: &K) -> Vec<V> {
        self.tree
            .remove(key)
            .map(|(_, vals)| vals.to_vec())
            .unwrap_or_default()
    }

    pub fn remove_value(&mut self, key: &K, value: &V) -> bool {
        match self.tree.get(key) {
            None => false,
            Some(Values::One(v)) => {
                if !self.value_eq(v, value) {
                    return false;
                }
                self.tree.remove(key);
                true
            }
            Some(Values::Many(t)) => {
                if !t.contains_key(value) {
                    return false;
                }
                self.tree
                    .update(key, |vals| {
                        if let Values::Many(t) = vals {
                            t.remove(value);
                            let single = if t.len() == 1 {
                                t.first().map(|(v, _)| v.clone())
                            } else {
                                None
                            };
                            if let Some(v) = single {
                                *vals = Values::One(v);
                            }
                        }
                    })
                    .is_some()
            }
        }
    }
}

/// 表的统一操作面。
///
/// 实现者只需提供快照和写入原语；读操作默认都在当前快照上完成。
/// 关闭后所有操作返回 `StoreError::Closed`。
pub trait Table<K: Datum, V: Datum + PartialEq>: Send + Sync {
    fn name(&self) -> &str;

    fn is_dup_allowed(&self) -> bool;

    /// 最近一次已提交的版本
    fn snapshot(&self) -> Result<Arc<TableSnapshot<K, V>>>;

    /// 返回是否改变了内容（重复插入同一 tuple 返回 false）
    fn put(&self, key: K, value: V) -> Result<bool>;

    fn remove(&self, key: &K) -> Result<Vec<V>>;

    fn remove_value(&self, key: &K, value: &V) -> Result<bool>;

    fn sync(&self) -> Result<()>;

    /// 幂等
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.snapshot()?.get(key))
    }

    fn has(&self, key: &K) -> Result<bool> {
        Ok(self.snapshot()?.has(key))
    }

    fn has_value(&self, key: &K, value: &V) -> Result<bool> {
        Ok(self.snapshot()?.has_value(key, value))
    }

    fn has_greater_or_equal(&self, key: &K) -> Result<bool> {
        Ok(self.snapshot()?.has_greater_or_equal(key))
    }

    fn has_less_or_equal(&self, key: &K) -> Result<bool> {
        Ok(self.snapshot()?.has_less_or_equal(key))
    }

    fn count(&self) -> Result<usize> {
        Ok(self.snapshot()?.count())
    }

    fn count_key(&self, key: &K) -> Result<usize> {
        Ok(self.snapshot()?.count_key(key))
    }

    fn greater_than_count(&self, key: &K) -> Result<usize> {
        Ok(self.snapshot()?.greater_than_count(key))
    }

    fn less_than_count(&self, key: &K) -> Result<usize> {
        Ok(self.snapshot()?.less_than_count(key))
    }

    /// 全表 tuple 游标
    fn cursor(&self) -> Result<TableCursor<K, V>> {
        Ok(TableCursor::new(self.snapshot()?))
    }

    /// 单个 key 下所有值的游标
    fn cursor_at(&self, key: &K) -> Result<ValueCursor<V>> {
        let snap = self.snapshot()?;
        Ok(ValueCursor::new(&*snap, key))
    }
}
