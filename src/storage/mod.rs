//! 持久化底座：每个命名结构（`master`、各属性索引、独立的文件表）对应
//! `<name>.db`（checkpoint）+ `<name>.wal`（写前日志）一对文件。
//!
//! 恢复：加载 checkpoint（generation = g），仅当日志 generation 也等于 g 时回放日志。
//! checkpoint 会把 generation 加一并清空日志；两步之间崩溃时日志 generation 落后，
//! 回放时被识别为陈旧并丢弃（其内容已全部包含在新 checkpoint 里）。

pub mod checkpoint;
pub mod journal;

use std::cmp::Ordering;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

pub use checkpoint::Checkpoint;
pub use journal::{Journal, JournalReplay};

const DEFAULT_CHECKPOINT_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingOptions {
    /// 每次追加后 `sync_data`；关闭时只 flush 到 OS（进程崩溃安全，掉电不保证）
    pub fsync: bool,
    /// 日志超过该字节数后自动 checkpoint
    pub checkpoint_bytes: u64,
}

impl Default for BackingOptions {
    fn default() -> Self {
        Self {
            fsync: false,
            checkpoint_bytes: DEFAULT_CHECKPOINT_BYTES,
        }
    }
}

/// 打开时恢复出来的内容：最近的 checkpoint 状态 + 之后的日志记录
pub struct Recovered<S, R> {
    pub state: Option<S>,
    pub records: Vec<R>,
}

pub struct Backing<R> {
    name: String,
    journal: Journal<R>,
    checkpoint: Checkpoint,
    options: BackingOptions,
    /// checkpoint 已提交但日志没能清空：下次追加前必须先重置到这个 generation，
    /// 否则新帧会写进恢复时被丢弃的旧日志
    pending_reset: Option<u64>,
}

impl<R: Serialize + DeserializeOwned> Backing<R> {
    pub fn open<S: DeserializeOwned>(
        dir: &Path,
        name: &str,
        options: BackingOptions,
    ) -> Result<(Self, Recovered<S, R>)> {
        std::fs::create_dir_all(dir)?;
        let checkpoint = Checkpoint::new(dir.join(format!("{name}.db")));
        let loaded = checkpoint.load::<S>()?;
        let ckpt_gen = loaded.as_ref().map_or(0, |(g, _)| *g);

        let wal_path = dir.join(format!("{name}.wal"));
        let mut journal = Journal::open(wal_path.clone(), ckpt_gen, options.fsync)?;
        let records = match journal.generation().cmp(&ckpt_gen) {
            Ordering::Equal => {
                let replay = journal.replay()?;
                replay.records
            }
            Ordering::Less => {
                tracing::warn!(
                    "`{}`: journal generation {} older than checkpoint {}, discarding",
                    name,
                    journal.generation(),
                    ckpt_gen
                );
                journal.reset(ckpt_gen)?;
                Vec::new()
            }
            Ordering::Greater => {
                return Err(StoreError::Corrupted {
                    path: wal_path,
                    reason: format!(
                        "journal generation {} is newer than checkpoint {}",
                        journal.generation(),
                        ckpt_gen
                    ),
                });
            }
        };

        tracing::info!(
            "opened `{}` in {:?}: checkpoint generation {}, {} journal record(s)",
            name,
            dir,
            ckpt_gen,
            records.len()
        );

        let backing = Self {
            name: name.to_string(),
            journal,
            checkpoint,
            options,
            pending_reset: None,
        };
        Ok((
            backing,
            Recovered {
                state: loaded.map(|(_, s)| s),
                records,
            },
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn journal_bytes(&self) -> u64 {
        self.journal.len()
    }

    pub fn generation(&self) -> u64 {
        self.journal.generation()
    }

    /// 一次逻辑操作 = 一帧
    pub fn append(&mut self, records: &[R]) -> Result<()> {
        if let Some(generation) = self.pending_reset {
            self.journal.reset(generation)?;
            self.pending_reset = None;
            tracing::info!("`{}`: journal reset to generation {}", self.name, generation);
        }
        self.journal.append(records)
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.journal.len() >= self.options.checkpoint_bytes
    }

    pub fn checkpoint<S: Serialize>(&mut self, state: &S) -> Result<()> {
        let next = self.next_generation();
        self.checkpoint.write_atomic(state, next)?;
        self.commit_generation(next)
    }

    /// 写入生效之后按日志大小触发的 checkpoint。
    ///
    /// 失败不向调用方报告：这次写入已经在日志里，旧 checkpoint + 日志仍能完整恢复，
    /// 下一次写入会再尝试。
    pub fn maybe_checkpoint<S: Serialize>(&mut self, state: impl FnOnce() -> Result<S>) {
        if !self.needs_checkpoint() {
            return;
        }
        let next = self.next_generation();
        let written = state().and_then(|s| self.checkpoint.write_atomic(&s, next));
        if let Err(e) = written.and_then(|()| self.commit_generation(next)) {
            tracing::warn!("`{}`: automatic checkpoint failed, journal kept: {}", self.name, e);
        }
    }

    fn next_generation(&self) -> u64 {
        self.pending_reset.unwrap_or(self.journal.generation()) + 1
    }

    /// checkpoint 文件已落盘；清空日志失败时记下待重置的 generation
    fn commit_generation(&mut self, generation: u64) -> Result<()> {
        self.pending_reset = Some(generation);
        self.journal.reset(generation)?;
        self.pending_reset = None;
        tracing::info!("`{}`: checkpoint generation {} committed", self.name, generation);
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.journal.sync()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    pub(crate) fn unique_tmp_dir(tag: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("dirstore-{}-{}-{}", tag, nanos, seq));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn checkpoint_then_journal_recovers_both() {
        let dir = unique_tmp_dir("backing");
        {
            let (mut b, rec) =
                Backing::<u64>::open::<Vec<u64>>(&dir, "t", BackingOptions::default()).unwrap();
            assert!(rec.state.is_none());
            b.append(&[1]).unwrap();
            b.checkpoint(&vec![1u64]).unwrap();
            b.append(&[2]).unwrap();
        }
        let (b, rec) = Backing::<u64>::open::<Vec<u64>>(&dir, "t", BackingOptions::default()).unwrap();
        assert_eq!(rec.state, Some(vec![1]));
        assert_eq!(rec.records, vec![2]);
        assert_eq!(b.generation(), 1);
    }

    #[test]
    fn stale_journal_after_checkpoint_is_discarded() {
        let dir = unique_tmp_dir("backing-stale");
        {
            let (mut b, _) =
                Backing::<u64>::open::<Vec<u64>>(&dir, "t", BackingOptions::default()).unwrap();
            b.append(&[1, 2]).unwrap();
        }
        // 模拟：checkpoint 已提交、日志尚未清空时崩溃
        Checkpoint::new(dir.join("t.db"))
            .write_atomic(&vec![1u64, 2], 1)
            .unwrap();

        let (_, rec) = Backing::<u64>::open::<Vec<u64>>(&dir, "t", BackingOptions::default()).unwrap();
        assert_eq!(rec.state, Some(vec![1, 2]));
        assert!(rec.records.is_empty());
    }

    #[test]
    fn failed_journal_reset_is_retried_before_next_append() {
        let dir = unique_tmp_dir("backing-reset-retry");
        let wal = dir.join("t.wal");
        {
            let (mut b, _) =
                Backing::<u64>::open::<Vec<u64>>(&dir, "t", BackingOptions::default()).unwrap();
            b.append(&[1]).unwrap();
            // 日志路径被目录占住：checkpoint 能提交，日志清空失败
            std::fs::remove_file(&wal).unwrap();
            std::fs::create_dir(&wal).unwrap();
            assert!(b.checkpoint(&vec![1u64]).is_err());

            std::fs::remove_dir(&wal).unwrap();
            b.append(&[2]).unwrap();
            assert_eq!(b.generation(), 1);
        }
        let (_, rec) = Backing::<u64>::open::<Vec<u64>>(&dir, "t", BackingOptions::default()).unwrap();
        assert_eq!(rec.state, Some(vec![1]));
        assert_eq!(rec.records, vec![2]);
    }

    #[test]
    fn small_threshold_requests_checkpoint() {
        let dir = unique_tmp_dir("backing-threshold");
        let opts = BackingOptions {
            fsync: false,
            checkpoint_bytes: 1,
        };
        let (mut b, _) = Backing::<u64>::open::<Vec<u64>>(&dir, "t", opts).unwrap();
        b.append(&[1]).unwrap();
        assert!(b.needs_checkpoint());
    }
}
