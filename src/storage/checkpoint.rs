use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use memmap2::Mmap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::error::{Result, StoreError};

/// checkpoint 文件 Header
const MAGIC: u32 = 0xD15C_0001;
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8 + 8; // magic + version + state + generation + data_len + xxh3

/// 原子 checkpoint 文件（atomic replacement）
///
/// 落盘流程：
/// 1) 写 `<name>.db.tmp` 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into` 流式写 body，边写边算 xxh3 / 长度
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)：原子替换
/// 6) fsync(dir)：目录项落盘
///
/// 任一步骤前崩溃，target 仍是上一个完整 checkpoint。
pub struct Checkpoint {
    path: PathBuf,
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn header(state: u32, generation: u64, data_len: u64, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    h[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    h[8..12].copy_from_slice(&state.to_le_bytes());
    h[12..20].copy_from_slice(&generation.to_le_bytes());
    h[20..28].copy_from_slice(&data_len.to_le_bytes());
    h[28..36].copy_from_slice(&checksum.to_le_bytes());
    h
}

impl Checkpoint {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// 读取并校验；文件不存在返回 `None`，任何不一致都是 `Corrupted`。
    pub fn load<S: DeserializeOwned>(&self) -> Result<Option<(u64, S)>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < HEADER_SIZE {
            return Err(self.corrupted("file shorter than header"));
        }
        // SAFETY: checkpoint 只通过 rename 原子替换，映射期间不会被原地改写
        let data = unsafe { Mmap::map(&file)? };

        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap_or([0; 4]));
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap_or([0; 4]));
        let state = u32::from_le_bytes(data[8..12].try_into().unwrap_or([0; 4]));
        let generation = u64::from_le_bytes(data[12..20].try_into().unwrap_or([0; 8]));
        let data_len = u64::from_le_bytes(data[20..28].try_into().unwrap_or([0; 8])) as usize;
        let stored_checksum = u64::from_le_bytes(data[28..36].try_into().unwrap_or([0; 8]));

        if magic != MAGIC {
            return Err(self.corrupted(&format!("magic mismatch: {magic:#x} != {MAGIC:#x}")));
        }
        if version != VERSION_CURRENT {
            return Err(self.corrupted(&format!("unsupported version {version}")));
        }
        if state != STATE_COMMITTED {
            return Err(self.corrupted("checkpoint state INCOMPLETE"));
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != data_len {
            return Err(self.corrupted(&format!(
                "data length mismatch: {} != {}",
                body.len(),
                data_len
            )));
        }
        let computed = xxh3_64(body);
        if computed != stored_checksum {
            return Err(self.corrupted(&format!(
                "checksum mismatch: {computed:#x} != {stored_checksum:#x}"
            )));
        }

        let state = bincode::deserialize::<S>(body)?;
        tracing::debug!(
            "checkpoint {:?} loaded: generation {}, {} bytes",
            self.path,
            generation,
            file_len
        );
        Ok(Some((generation, state)))
    }

    pub fn write_atomic<S: Serialize>(&self, state: &S, generation: u64) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("db.tmp");

        // 1) INCOMPLETE header，然后流式写 body，避免整个 body 先序列化进一个大 Vec
        let mut file = File::create(&tmp_path)?;
        file.write_all(&header(STATE_INCOMPLETE, generation, 0, 0))?;

        // 2) 流式写 body 并计算长度/校验
        let (data_len, checksum) = {
            let mut cw = ChecksumWriter::new(&mut file);
            bincode::serialize_into(&mut cw, state)?;
            cw.finish()
        };

        // 3) 覆盖 COMMITTED header
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header(STATE_COMMITTED, generation, data_len, checksum))?;

        // 4) fsync
        file.sync_all()?;
        drop(file);

        // 5) rename 原子替换
        std::fs::rename(&tmp_path, &self.path)?;

        // 6) fsync(dir)
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::debug!(
            "checkpoint {:?} written: generation {}, {} bytes",
            self.path,
            generation,
            HEADER_SIZE as u64 + data_len
        );
        Ok(())
    }

    fn corrupted(&self, reason: &str) -> StoreError {
        StoreError::Corrupted {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::unique_tmp_dir;

    #[test]
    fn write_then_load() {
        let dir = unique_tmp_dir("ckpt-basic");
        let c = Checkpoint::new(dir.join("t.db"));
        assert!(c.load::<Vec<u64>>().unwrap().is_none());

        c.write_atomic(&vec![1u64, 2, 3], 4).unwrap();
        let (gen, state) = c.load::<Vec<u64>>().unwrap().unwrap();
        assert_eq!(gen, 4);
        assert_eq!(state, vec![1, 2, 3]);
        assert!(!dir.join("t.db.tmp").exists());
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let dir = unique_tmp_dir("ckpt-flip");
        let path = dir.join("t.db");
        let c = Checkpoint::new(path.clone());
        c.write_atomic(&"hello directory".to_string(), 1).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            c.load::<String>(),
            Err(StoreError::Corrupted { .. })
        ));
    }
}
