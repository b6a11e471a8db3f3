use std::marker::PhantomData;

use crate::cursor::{ClosureMonitor, Cursor};
use crate::error::{Result, StoreError};

/// 永远耗尽的游标：所有定位调用成功但没有元素，`get()` 恒为 `InvalidPosition`
pub struct EmptyCursor<T> {
    monitor: ClosureMonitor,
    _marker: PhantomData<fn() -> T>,
}

impl<T> EmptyCursor<T> {
    pub fn new() -> Self {
        Self {
            monitor: ClosureMonitor::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for EmptyCursor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Cursor for EmptyCursor<T> {
    type Element = T;

    fn before_first(&mut self) -> Result<()> {
        self.monitor.check_not_closed()
    }

    fn after_last(&mut self) -> Result<()> {
        self.monitor.check_not_closed()
    }

    fn before(&mut self, _element: &T) -> Result<()> {
        self.monitor.check_not_closed()
    }

    fn after(&mut self, _element: &T) -> Result<()> {
        self.monitor.check_not_closed()
    }

    fn next(&mut self) -> Result<bool> {
        self.monitor.check_not_closed()?;
        Ok(false)
    }

    fn previous(&mut self) -> Result<bool> {
        self.monitor.check_not_closed()?;
        Ok(false)
    }

    fn get(&self) -> Result<T> {
        self.monitor.check_not_closed()?;
        Err(StoreError::InvalidPosition)
    }

    fn available(&self) -> bool {
        false
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

    #[test]
    fn fresh_empty_cursor_has_nothing() {
        let mut c = EmptyCursor::<u64>::new();
        assert!(!c.first().unwrap());
        assert!(!c.last().unwrap());
        assert!(matches!(c.get(), Err(StoreError::InvalidPosition)));
        c.before(&7).unwrap();
        c.after(&7).unwrap();
        assert!(!c.next().unwrap());
        assert!(!c.previous().unwrap());
        assert!(!c.available());
    }

    #[test]
    fn close_is_idempotent() {
        let mut c = EmptyCursor::<u64>::new();
        c.close().unwrap();
        c.close().unwrap();
        assert!(c.is_closed());
        assert!(matches!(
            c.next(),
            Err(StoreError::CursorClosed { cause: None })
        ));
        assert!(matches!(c.get(), Err(StoreError::CursorClosed { .. })));
    }

    #[test]
    fn iterating_yields_nothing() {
        let c = EmptyCursor::<u64>::new();
        assert_eq!(c.elements().count(), 0);
    }
}
