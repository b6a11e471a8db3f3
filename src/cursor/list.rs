use std::cmp::Ordering;
use std::sync::Arc;

use crate::cursor::{ClosureMonitor, Cursor, RankWindow};
use crate::error::{Result, StoreError};
use crate::schema::Comparator;

/// 已物化的小结果集上的游标（元素按比较器排序）。
pub struct ListCursor<T> {
    elements: Arc<[T]>,
    cmp: Arc<dyn Comparator<T>>,
    window: RankWindow,
    monitor: ClosureMonitor,
}

impl<T> ListCursor<T> {
    pub fn new(mut elements: Vec<T>, cmp: Arc<dyn Comparator<T>>) -> Self {
        elements.sort_by(|a, b| cmp.compare(a, b));
        let len = elements.len();
        Self {
            elements: elements.into(),
            cmp,
            window: RankWindow::new(0, len),
            monitor: ClosureMonitor::new(),
        }
    }

    pub fn singleton(element: T, cmp: Arc<dyn Comparator<T>>) -> Self {
        Self::new(vec![element], cmp)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 借用当前元素；借用期间游标不能前进
    pub fn get_ref(&self) -> Result<&T> {
        self.monitor.check_not_closed()?;
        let i = self.window.current().ok_or(StoreError::InvalidPosition)?;
        self.elements.get(i).ok_or(StoreError::InvalidPosition)
    }

    fn rank(&self, element: &T, inclusive: bool) -> usize {
        self.elements.partition_point(|x| match self.cmp.compare(x, element) {
            Ordering::Less => true,
            Ordering::Equal => inclusive,
            Ordering::Greater => false,
        })
    }
}

impl<T: Clone> Cursor for ListCursor<T> {
    type Element = T;

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

    fn before(&mut self, element: &T) -> Result<()> {
        self.monitor.check_not_closed()?;
        let r = self.rank(element, false);
        self.window.seek(r);
        Ok(())
    }

    fn after(&mut self, element: &T) -> Result<()> {
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

    fn get(&self) -> Result<T> {
        self.get_ref().cloned()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NaturalOrder;

    fn cursor(items: Vec<u32>) -> ListCursor<u32> {
        ListCursor::new(items, Arc::new(NaturalOrder::<u32>::new()))
    }

    #[test]
    fn sorts_and_walks() {
        let c = cursor(vec![5, 1, 3]);
        let all: Vec<u32> = c.elements().collect::<Result<_>>().unwrap();
        assert_eq!(all, vec![1, 3, 5]);
    }

    #[test]
    fn before_and_after_seek() {
        let mut c = cursor(vec![10, 20, 30]);
        c.before(&20).unwrap();
        assert!(c.next().unwrap());
        assert_eq!(c.get().unwrap(), 20);

        c.after(&20).unwrap();
        assert!(c.next().unwrap());
        assert_eq!(c.get().unwrap(), 30);

        c.before(&25).unwrap();
        assert!(c.previous().unwrap());
        assert_eq!(c.get().unwrap(), 20);

        c.after(&99).unwrap();
        assert!(!c.next().unwrap());
        assert!(matches!(c.get(), Err(StoreError::InvalidPosition)));
    }

    #[test]
    fn last_then_previous_to_before_first() {
        let mut c = cursor(vec![1, 2]);
        assert!(c.last().unwrap());
        assert_eq!(*c.get_ref().unwrap(), 2);
        assert!(c.previous().unwrap());
        assert!(!c.previous().unwrap());
        assert!(!c.available());
        assert!(c.next().unwrap());
        assert_eq!(c.get().unwrap(), 1);
    }

    #[test]
    fn closed_cursor_reports_cause() {
        let mut c = ListCursor::singleton(1u32, Arc::new(NaturalOrder::<u32>::new()));
        c.close_with_cause(StoreError::Closed("index".into())).unwrap();
        match c.first() {
            Err(StoreError::CursorClosed { cause: Some(cause) }) => {
                assert!(matches!(*cause, StoreError::Closed(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
