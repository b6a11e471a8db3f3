use std::cmp::Ordering;
use std::sync::Arc;

use crate::cursor::{ClosureMonitor, Cursor, RankWindow};
use crate::error::{Result, StoreError};
use crate::schema::Comparator;
use crate::table::{Datum, TableSnapshot, Tuple, Values};

/// 快照上的 tuple 游标。
///
/// 位置用扁平 tuple 下标表示（重复值逐个占位），定位与步进都是 O(log n)。
/// 可以限定在 `[lo, hi)` 下标窗口内（RDN 索引用它枚举某个 parent 的孩子）。
pub struct TableCursor<K, V> {
    snap: Arc<TableSnapshot<K, V>>,
    window: RankWindow,
    monitor: ClosureMonitor,
}

impl<K: Datum, V: Datum + PartialEq> TableCursor<K, V> {
    pub fn new(snap: Arc<TableSnapshot<K, V>>) -> Self {
        let hi = snap.count();
        Self::bounded(snap, 0, hi)
    }

    pub fn bounded(snap: Arc<TableSnapshot<K, V>>, lo: usize, hi: usize) -> Self {
        Self {
            snap,
            window: RankWindow::new(lo, hi),
            monitor: ClosureMonitor::new(),
        }
    }

    /// 游标窗口内的 tuple 数
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 只按 key 定位：随后的 `next()` 给出第一个 key >= `key` 的 tuple
    pub fn before_key(&mut self, key: &K) -> Result<()> {
        self.monitor.check_not_closed()?;
        let (lo, _) = self.snap.key_range(key);
        self.window.seek(lo);
        Ok(())
    }

    /// 随后的 `next()` 给出第一个 key > `key` 的 tuple
    pub fn after_key(&mut self, key: &K) -> Result<()> {
        self.monitor.check_not_closed()?;
        let (_, hi) = self.snap.key_range(key);
        self.window.seek(hi);
        Ok(())
    }

    /// 借用当前 tuple；借用在下一次移动游标前结束
    pub fn get_ref(&self) -> Result<(&K, &V)> {
        self.monitor.check_not_closed()?;
        let i = self.window.current().ok_or(StoreError::InvalidPosition)?;
        self.snap.entry_at(i).ok_or(StoreError::InvalidPosition)
    }
}

impl<K: Datum, V: Datum + PartialEq> Cursor for TableCursor<K, V> {
    type Element = Tuple<K, V>;

    fn before_first(&mut self) -> Result<()> {
        self.monitor.check_not_closed()?;
        self.window.before_first();
        Ok(())
    }

    fn after_last(&mut self) -> Result<()> {
        self.monitor.check_not_closed()?;
        self.window.after_last();
        Ok(())
    }

    fn before(&mut self, element: &Tuple<K, V>) -> Result<()> {
        self.monitor.check_not_closed()?;
        let r = self.snap.tuple_rank(&element.key, &element.value, false);
        self.window.seek(r);
        Ok(())
    }

    fn after(&mut self, element: &Tuple<K, V>) -> Result<()> {
        self.monitor.check_not_closed()?;
        let r = self.snap.tuple_rank(&element.key, &element.value, true);
        self.window.seek(r);
        Ok(())
    }

    fn next(&mut self) -> Result<bool> {
        self.monitor.check_not_closed()?;
        Ok(self.window.next())
    }

    fn previous(&mut self) -> Result<bool> {
        self.monitor.check_not_closed()?;
        Ok(self.window.previous())
    }

    fn get(&self) -> Result<Tuple<K, V>> {
        let (k, v) = self.get_ref()?;
        Ok(Tuple::new(k.clone(), v.clone()))
    }

    fn available(&self) -> bool {
        !self.monitor.is_closed() && self.window.current().is_some()
    }

    fn close(&mut self) -> Result<()> {
        self.monitor.close();
        Ok(())
    }

    fn close_with_cause(&mut self, cause: StoreError) -> Result<()> {
        self.monitor.close_with_cause(cause);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.monitor.is_closed()
    }
}

/// 单个 key 下所有值的游标（重复模式下按值比较器排序）
pub struct ValueCursor<V> {
    values: Option<Values<V>>,
    cmp: Option<Arc<dyn Comparator<V>>>,
    window: RankWindow,
    monitor: ClosureMonitor,
}

impl<V: Datum + PartialEq> ValueCursor<V> {
    pub fn new<K: Datum>(snap: &TableSnapshot<K, V>, key: &K) -> Self {
        let values = snap.values_of(key);
        let len = values.as_ref().map_or(0, |v| match v {
            Values::One(_) => 1,
            Values::Many(t) => t.len(),
        });
        Self {
            values,
            cmp: snap.value_comparator().cloned(),
            window: RankWindow::new(0, len),
            monitor: ClosureMonitor::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_ref(&self) -> Result<&V> {
        self.monitor.check_not_closed()?;
        let i = self.window.current().ok_or(StoreError::InvalidPosition)?;
        self.values
            .as_ref()
            .and_then(|vals| vals.nth(i))
            .ok_or(StoreError::InvalidPosition)
    }

    fn rank(&self, value: &V, inclusive: bool) -> usize {
        match &self.values {
            None => 0,
            Some(Values::Many(t)) => t.rank(value, inclusive).count,
            Some(Values::One(v)) => {
                let ord = self
                    .cmp
                    .as_ref()
                    .map_or(Ordering::Equal, |c| c.compare(v, value));
                match ord {
                    Ordering::Less => 1,
                    Ordering::Equal => usize::from(inclusive),
                    Ordering::Greater => 0,
                }
            }
        }
    }
}

impl<V: Datum + PartialEq> Cursor for ValueCursor<V> {
    type Element = V;

    fn before_first(&mut self) -> Result<()> {
        self.monitor.check_not_closed()?;
        self.window.before_first();
        Ok(())
    }

    fn after_last(&mut self) -> Result<()> {
        self.monitor.check_not_closed()?;
        self.window.after_last();
        Ok(())
    }

    fn before(&mut self, element: &V) -> Result<()> {
        self.monitor.check_not_closed()?;
        let r = self.rank(element, false);
        self.window.seek(r);
        Ok(())
    }

    fn after(&mut self, element: &V) -> Result<()> {
        self.monitor.check_not_closed()?;
        let r = self.rank(element, true);
        self.window.seek(r);
        Ok(())
    }

    fn next(&mut self) -> Result<bool> {
        self.monitor.check_not_closed()?;
        Ok(self.window.next())
    }

    fn previous(&mut self) -> Result<bool> {
        self.monitor.check_not_closed()?;
        Ok(self.window.previous())
    }

    fn get(&self) -> Result<V> {
        self.get_ref().cloned()
    }

    fn available(&self) -> bool {
        !self.monitor.is_closed() && self.window.current().is_some()
    }

    fn close(&mut self) -> Result<()> {
        // 关闭即释放快照引用
        self.values = None;
        self.monitor.close();
        Ok(())
    }

    fn close_with_cause(&mut self, cause: StoreError) -> Result<()> {
        self.values = None;
        self.monitor.close_with_cause(cause);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.monitor.is_closed()
    }
}
