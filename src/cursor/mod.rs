//! 双向可定位游标协议：所有 Table / Index 扫描都返回游标。
//!
//! ## 契约
//! - 状态：before-first / 位于某元素 / after-last / closed。
//! - `next()` / `previous()` 没有更多元素时返回 `false` 并停在对应哨兵位，
//!   这是“耗尽”信号，不是错误。
//! - 哨兵位上 `get()` 返回 `InvalidPosition`。
//! - 关闭后除 `close` 外的所有操作都返回 `CursorClosed`（带上关闭原因）；`close` 幂等。
//!
//! 本引擎所有游标都迭代创建时取得的不可变快照，并发写入不会使其失效，
//! `get()` 每次返回独立拥有的值（`is_element_reused() == false`）。

pub mod empty;
pub mod list;

use std::sync::Arc;

use crate::error::{Result, StoreError};

pub use empty::EmptyCursor;
pub use list::ListCursor;

/// 记录资源的开/关状态及关闭原因；每个游标持有一个。
#[derive(Debug, Default)]
pub struct ClosureMonitor {
    closed: bool,
    cause: Option<Arc<StoreError>>,
}

impl ClosureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 幂等：重复关闭不改变状态，也不覆盖第一次的原因
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn close_with_cause(&mut self, cause: StoreError) {
        if !self.closed {
            self.cause = Some(Arc::new(cause));
        }
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn cause(&self) -> Option<&Arc<StoreError>> {
        self.cause.as_ref()
    }

    pub fn check_not_closed(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::closed_cursor(self.cause.clone()));
        }
        Ok(())
    }
}

pub trait Cursor {
    type Element;

    fn before_first(&mut self) -> Result<()>;

    fn after_last(&mut self) -> Result<()>;

    /// 定位到 `element` 应处位置之前：随后的 `next()` 给出第一个 >= element 的元素
    fn before(&mut self, element: &Self::Element) -> Result<()>;

    /// 定位到 `element` 应处位置之后：随后的 `next()` 给出第一个 > element 的元素
    fn after(&mut self, element: &Self::Element) -> Result<()>;

    fn first(&mut self) -> Result<bool> {
        self.before_first()?;
        self.next()
    }

    fn last(&mut self) -> Result<bool> {
        self.after_last()?;
        self.previous()
    }

    fn next(&mut self) -> Result<bool>;

    fn previous(&mut self) -> Result<bool>;

    fn get(&self) -> Result<Self::Element>;

    /// 当前位置是否有元素（哨兵位或已关闭时为 false）
    fn available(&self) -> bool;

    fn is_element_reused(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()>;

    fn close_with_cause(&mut self, cause: StoreError) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// 转成 `Iterator<Item = Result<Element>>`；耗尽时自动关闭游标
    fn elements(self) -> CursorIter<Self>
    where
        Self: Sized,
    {
        CursorIter::new(self)
    }
}

impl<C: Cursor + ?Sized> Cursor for Box<C> {
    type Element = C::Element;

    fn before_first(&mut self) -> Result<()> {
        (**self).before_first()
    }

    fn after_last(&mut self) -> Result<()> {
        (**self).after_last()
    }

    fn before(&mut self, element: &Self::Element) -> Result<()> {
        (**self).before(element)
    }

    fn after(&mut self, element: &Self::Element) -> Result<()> {
        (**self).after(element)
    }

    fn first(&mut self) -> Result<bool> {
        (**self).first()
    }

    fn last(&mut self) -> Result<bool> {
        (**self).last()
    }

    fn next(&mut self) -> Result<bool> {
        (**self).next()
    }

    fn previous(&mut self) -> Result<bool> {
        (**self).previous()
    }

    fn get(&self) -> Result<Self::Element> {
        (**self).get()
    }

    fn available(&self) -> bool {
        (**self).available()
    }

    fn is_element_reused(&self) -> bool {
        (**self).is_element_reused()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn close_with_cause(&mut self, cause: StoreError) -> Result<()> {
        (**self).close_with_cause(cause)
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// 游标 → 迭代器适配
pub struct CursorIter<C: Cursor> {
    cursor: C,
    done: bool,
}

impl<C: Cursor> CursorIter<C> {
    pub fn new(cursor: C) -> Self {
        Self {
            cursor,
            done: false,
        }
    }
}

impl<C: Cursor> Iterator for CursorIter<C> {
    type Item = Result<C::Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.next() {
            Ok(true) => Some(self.cursor.get()),
            Ok(false) => {
                self.done = true;
                if let Err(e) = self.cursor.close() {
                    tracing::debug!("closing exhausted cursor failed: {}", e);
                }
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    /// 位于第 i 个元素之前的空隙（i == lo 即 before-first，i == hi 即 after-last）
    Before(usize),
    At(usize),
}

/// 在 `[lo, hi)` 下标区间上移动的位置状态机；快照游标共用。
#[derive(Clone, Copy, Debug)]
pub(crate) struct RankWindow {
    lo: usize,
    hi: usize,
    slot: Slot,
}

impl RankWindow {
    pub(crate) fn new(lo: usize, hi: usize) -> Self {
        let hi = hi.max(lo);
        Self {
            lo,
            hi,
            slot: Slot::Before(lo),
        }
    }

    pub(crate) fn before_first(&mut self) {
        self.slot = Slot::Before(self.lo);
    }

    pub(crate) fn after_last(&mut self) {
        self.slot = Slot::Before(self.hi);
    }

    /// 停在全局下标 `rank` 之前（越界时夹到窗口边缘）
    pub(crate) fn seek(&mut self, rank: usize) {
        self.slot = Slot::Before(rank.clamp(self.lo, self.hi));
    }

    pub(crate) fn next(&mut self) -> bool {
        let n = match self.slot {
            Slot::Before(i) => i,
            Slot::At(i) => i + 1,
        };
        if n < self.hi {
            self.slot = Slot::At(n);
            true
        } else {
            self.slot = Slot::Before(self.hi);
            false
        }
    }

    pub(crate) fn previous(&mut self) -> bool {
        let p = match self.slot {
            Slot::Before(i) | Slot::At(i) => i,
        };
        if p > self.lo {
            self.slot = Slot::At(p - 1);
            true
        } else {
            self.slot = Slot::Before(self.lo);
            false
        }
    }

    pub(crate) fn current(&self) -> Option<usize> {
        match self.slot {
            Slot::At(i) => Some(i),
            Slot::Before(_) => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.hi - self.lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_monitor_keeps_first_cause() {
        let mut m = ClosureMonitor::new();
        assert!(m.check_not_closed().is_ok());
        m.close_with_cause(StoreError::not_found("first"));
        m.close_with_cause(StoreError::not_found("second"));
        m.close();
        assert!(m.is_closed());
        match m.check_not_closed() {
            Err(StoreError::CursorClosed { cause: Some(c) }) => {
                assert_eq!(c.to_string(), "not found: first");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rank_window_walks_both_ways() {
        let mut w = RankWindow::new(2, 5);
        assert_eq!(w.len(), 3);
        assert!(w.next());
        assert_eq!(w.current(), Some(2));
        assert!(w.next());
        assert!(w.next());
        assert_eq!(w.current(), Some(4));
        assert!(!w.next());
        assert_eq!(w.current(), None);
        assert!(w.previous());
        assert_eq!(w.current(), Some(4));

        w.seek(0);
        assert!(!w.previous());
        assert!(w.next());
        assert_eq!(w.current(), Some(2));

        w.seek(3);
        assert!(w.previous());
        assert_eq!(w.current(), Some(2));
    }
}
