//! 主表：id → entry，外加 id 序列与少量持久属性。
//!
//! 条目行与属性行落在同一个名为 `master` 的持久化结构里（`master.db` / `master.wal`），
//! 序列的当前值就是属性 `__sequence__` 的十进制字符串。

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{Entry, Id};
use crate::error::{Result, StoreError};
use crate::schema::NaturalOrder;
use crate::storage::{Backing, BackingOptions};
use crate::table::{AvlTable, Table, TableCursor, TableSnapshot, TableSpec};

pub const MASTER_TABLE_NAME: &str = "master";

/// 序列的保留属性名
pub const SEQUENCE_PROPERTY: &str = "__sequence__";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MasterRecord {
    Put { id: Id, entry: Entry },
    Delete { id: Id },
    Property { key: String, value: String },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MasterImage {
    entries: Vec<(Id, Entry)>,
    properties: Vec<(String, String)>,
}

pub struct MasterTable {
    entries: AvlTable<Id, Entry>,
    properties: AvlTable<String, String>,
    /// 写者互斥；持久化时同时持有日志
    writer: Mutex<Option<Backing<MasterRecord>>>,
}

fn entries_spec() -> TableSpec<Id, Entry> {
    TableSpec::new(MASTER_TABLE_NAME, Arc::new(NaturalOrder::<Id>::new()))
}

fn properties_spec() -> TableSpec<String, String> {
    TableSpec::new(MASTER_TABLE_NAME, Arc::new(NaturalOrder::<String>::new()))
}

impl MasterTable {
    pub fn in_memory() -> Self {
        Self {
            entries: AvlTable::new(entries_spec()),
            properties: AvlTable::new(properties_spec()),
            writer: Mutex::new(None),
        }
    }

    pub fn open(dir: &Path, options: BackingOptions) -> Result<Self> {
        let master = Self::in_memory();
        let (backing, recovered) =
            Backing::<MasterRecord>::open::<MasterImage>(dir, MASTER_TABLE_NAME, options)?;
        let image = recovered.state.unwrap_or_default();
        for (id, entry) in image.entries {
            master.apply(MasterRecord::Put { id, entry })?;
        }
        for (key, value) in image.properties {
            master.apply(MasterRecord::Property { key, value })?;
        }
        for rec in recovered.records {
            master.apply(rec)?;
        }
        tracing::info!(
            "master table opened: {} entries, current id {}",
            master.entries.count()?,
            master.current_id()?
        );
        *master.writer.lock() = Some(backing);
        Ok(master)
    }

    fn apply(&self, rec: MasterRecord) -> Result<()> {
        match rec {
            MasterRecord::Put { id, entry } => {
                self.entries.put(id, entry)?;
            }
            MasterRecord::Delete { id } => {
                self.entries.remove(&id)?;
            }
            MasterRecord::Property { key, value } => {
                self.properties.put(key, value)?;
            }
        }
        Ok(())
    }

    /// 写者锁内：记日志 → 生效 → 视日志大小 checkpoint
    fn commit(&self, writer: &mut Option<Backing<MasterRecord>>, rec: MasterRecord) -> Result<()> {
        self.entries.check_open()?;
        if let Some(backing) = writer.as_mut() {
            backing.append(std::slice::from_ref(&rec))?;
        }
        self.apply(rec)?;
        if let Some(backing) = writer.as_mut() {
            backing.maybe_checkpoint(|| self.image());
        }
        Ok(())
    }

    fn image(&self) -> Result<MasterImage> {
        let entries = self
            .entries
            .snapshot()?
            .to_rows()
            .into_iter()
            .filter_map(|(id, mut vs)| vs.pop().map(|e| (id, e)))
            .collect();
        let properties = self
            .properties
            .snapshot()?
            .to_rows()
            .into_iter()
            .filter_map(|(k, mut vs)| vs.pop().map(|v| (k, v)))
            .collect();
        Ok(MasterImage {
            entries,
            properties,
        })
    }

    pub fn get(&self, id: Id) -> Result<Entry> {
        self.entries
            .get(&id)?
            .ok_or_else(|| StoreError::not_found(format!("entry {id}")))
    }

    pub fn contains(&self, id: Id) -> Result<bool> {
        self.entries.has(&id)
    }

    /// 插入或整体替换；由 id 是否已存在决定是哪一种
    pub fn put(&self, entry: Entry, id: Id) -> Result<()> {
        let mut writer = self.writer.lock();
        self.commit(&mut writer, MasterRecord::Put { id, entry })
    }

    /// 删除并返回旧条目；不存在时 `NotFound`（本层的 delete 不是幂等的）
    pub fn delete(&self, id: Id) -> Result<Entry> {
        let mut writer = self.writer.lock();
        let prior = self.get(id)?;
        self.commit(&mut writer, MasterRecord::Delete { id })?;
        Ok(prior)
    }

    /// 最近一次发出的 id；从未发过时为 0
    pub fn current_id(&self) -> Result<Id> {
        match self.properties.get(&SEQUENCE_PROPERTY.to_string())? {
            Some(s) => parse_sequence(&s),
            None => Ok(0),
        }
    }

    /// 先把新值写进日志，再交给调用方，所以同一个 store 不会两次发出同一个 id
    pub fn next_id(&self) -> Result<Id> {
        let mut writer = self.writer.lock();
        let next = self
            .current_id()?
            .checked_add(1)
            .ok_or_else(|| StoreError::InvalidValue {
                attribute: SEQUENCE_PROPERTY.to_string(),
                reason: "sequence exhausted".to_string(),
            })?;
        self.commit(
            &mut writer,
            MasterRecord::Property {
                key: SEQUENCE_PROPERTY.to_string(),
                value: next.to_string(),
            },
        )?;
        tracing::debug!("issued id {}", next);
        Ok(next)
    }

    pub fn get_property(&self, key: &str) -> Result<Option<String>> {
        self.properties.get(&key.to_string())
    }

    /// 序列只能前移：已发出的 id 不能再次发出
    pub fn set_property(&self, key: &str, value: &str) -> Result<()> {
        let mut writer = self.writer.lock();
        if key == SEQUENCE_PROPERTY {
            let requested = parse_sequence(value)?;
            let current = self.current_id()?;
            if requested < current {
                return Err(StoreError::InvalidValue {
                    attribute: SEQUENCE_PROPERTY.to_string(),
                    reason: format!("cannot move the sequence back from {current} to {requested}"),
                });
            }
        }
        self.commit(
            &mut writer,
            MasterRecord::Property {
                key: key.to_string(),
                value: value.to_string(),
            },
        )
    }

    pub fn properties(&self) -> Result<Vec<(String, String)>> {
        Ok(self.image()?.properties)
    }

    pub fn count(&self) -> Result<usize> {
        self.entries.count()
    }

    pub fn snapshot(&self) -> Result<Arc<TableSnapshot<Id, Entry>>> {
        self.entries.snapshot()
    }

    /// 按 id 升序的全部条目
    pub fn cursor(&self) -> Result<TableCursor<Id, Entry>> {
        self.entries.cursor()
    }

    pub fn journal_bytes(&self) -> u64 {
        self.writer.lock().as_ref().map_or(0, |b| b.journal_bytes())
    }

    /// 强制 checkpoint
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.entries.check_open()?;
        if let Some(backing) = writer.as_mut() {
            backing.checkpoint(&self.image()?)?;
        }
        Ok(())
    }

    /// 幂等；即使刷日志失败也会关闭两张表
    pub fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if self.entries.is_closed() {
            return Ok(());
        }
        let synced = match writer.as_mut() {
            Some(backing) => backing.sync(),
            None => Ok(()),
        };
        *writer = None;
        let entries = self.entries.close();
        let properties = self.properties.close();
        tracing::info!("master table closed");
        synced.and(entries).and(properties)
    }

    pub fn is_closed(&self) -> bool {
        self.entries.is_closed()
    }
}

fn parse_sequence(s: &str) -> Result<Id> {
    s.parse::<Id>().map_err(|e| StoreError::InvalidValue {
        attribute: SEQUENCE_PROPERTY.to_string(),
        reason: format!("{s:?}: {e}"),
    })
}
