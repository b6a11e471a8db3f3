use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::{Backing, BackingOptions};
use crate::table::{AvlTable, Datum, Table, TableSnapshot, TableSpec};

/// 文件表的日志记录：一次写操作一条
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TableRecord<K, V> {
    Put { key: K, value: V },
    Remove { key: K },
    RemoveValue { key: K, value: V },
}

type Rows<K, V> = Vec<(K, Vec<V>)>;

/// 文件表 = 内存表 + `<name>.wal` / `<name>.db`。
///
/// 写入顺序：先追加日志帧，成功后才发布新版本；日志写失败时内存不变，错误原样上抛。
/// 日志超过阈值后自动 checkpoint。
pub struct FileTable<K, V> {
    inner: AvlTable<K, V>,
    backing: Mutex<Backing<TableRecord<K, V>>>,
}

impl<K, V> FileTable<K, V>
where
    K: Datum + Serialize + DeserializeOwned,
    V: Datum + PartialEq + Serialize + DeserializeOwned,
{
    pub fn open(dir: &Path, spec: TableSpec<K, V>, options: BackingOptions) -> Result<Self> {
        let (backing, recovered) = Backing::open::<Rows<K, V>>(dir, spec.name(), options)?;
        let mut snap = match recovered.state {
            Some(rows) => TableSnapshot::from_rows(&spec, rows),
            None => TableSnapshot::empty(&spec),
        };
        let replayed = recovered.records.len();
        for rec in recovered.records {
            apply_record(&mut snap, rec);
        }
        tracing::debug!(
            "table `{}` recovered: {} tuple(s), {} replayed record(s)",
            spec.name(),
            snap.count(),
            replayed
        );
        Ok(Self {
            inner: AvlTable::from_snapshot(&spec, snap),
            backing: Mutex::new(backing),
        })
    }

    fn write<R>(
        &self,
        record: TableRecord<K, V>,
        f: impl FnOnce(&mut TableSnapshot<K, V>) -> R,
    ) -> Result<R> {
        self.inner.check_open()?;
        let mut backing = self.backing.lock();
        backing.append(std::slice::from_ref(&record))?;
        let r = self.inner.apply(f)?;
        backing.maybe_checkpoint(|| Ok(self.inner.snapshot()?.to_rows()));
        Ok(r)
    }

    /// 立即把当前版本写成 checkpoint 并清空日志
    pub fn checkpoint(&self) -> Result<()> {
        let mut backing = self.backing.lock();
        let rows = self.inner.snapshot()?.to_rows();
        backing.checkpoint(&rows)
    }

    pub fn journal_bytes(&self) -> u64 {
        self.backing.lock().journal_bytes()
    }
}

fn apply_record<K: Datum, V: Datum + PartialEq>(
    snap: &mut TableSnapshot<K, V>,
    rec: TableRecord<K, V>,
) {
    match rec {
        TableRecord::Put { key, value } => {
            snap.put(key, value);
        }
        TableRecord::Remove { key } => {
            snap.remove(&key);
        }
        TableRecord::RemoveValue { key, value } => {
            snap.remove_value(&key, &value);
        }
    }
}

impl<K, V> Table<K, V> for FileTable<K, V>
where
    K: Datum + Serialize + DeserializeOwned,
    V: Datum + PartialEq + Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_dup_allowed(&self) -> bool {
        self.inner.is_dup_allowed()
    }

    fn snapshot(&self) -> Result<Arc<TableSnapshot<K, V>>> {
        self.inner.snapshot()
    }

    fn put(&self, key: K, value: V) -> Result<bool> {
        let record = TableRecord::Put {
            key: key.clone(),
            value: value.clone(),
        };
        self.write(record, |s| s.put(key, value))
    }

    fn remove(&self, key: &K) -> Result<Vec<V>> {
        let record = TableRecord::Remove { key: key.clone() };
        self.write(record, |s| s.remove(key))
    }

    fn remove_value(&self, key: &K, value: &V) -> Result<bool> {
        let record = TableRecord::RemoveValue {
            key: key.clone(),
            value: value.clone(),
        };
        self.write(record, |s| s.remove_value(key, value))
    }

    fn sync(&self) -> Result<()> {
        self.checkpoint()
    }

    fn close(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        // 先关内存表：之后的写入都会被拒绝，再把日志刷盘
        self.inner.close()?;
        self.backing.lock().sync()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
