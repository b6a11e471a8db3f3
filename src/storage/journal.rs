use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;

const JOURNAL_MAGIC: u32 = 0x4C4E_524A; // "JRNL"
const JOURNAL_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 4 + 4 + 8; // magic + version + generation
const FRAME_HEADER_SIZE: usize = 4 + 8; // len + xxh3

#[derive(Clone, Debug)]
pub struct JournalReplay<R> {
    pub records: Vec<R>,
    pub frames: usize,
    /// 尾部被截断/校验失败而丢弃的帧数（崩溃时写了一半）
    pub truncated_tail_frames: usize,
}

/// Append-only 写前日志。
///
/// 文件布局：header(magic, version, generation) + 若干帧 `[len u32][xxh3 u64][bincode(Vec<R>)]`。
/// 一次逻辑操作写成一帧：帧要么完整可校验，要么在回放时整体丢弃。
pub struct Journal<R> {
    path: PathBuf,
    file: File,
    len: u64,
    generation: u64,
    fsync: bool,
    _marker: PhantomData<fn(R) -> R>,
}

impl<R: Serialize + DeserializeOwned> Journal<R> {
    /// 打开已有日志；不存在或 header 损坏时以 `generation` 新建。
    pub fn open(path: PathBuf, generation: u64, fsync: bool) -> Result<Self> {
        let (file, generation) = open_or_init(&path, generation)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            len,
            generation,
            fsync,
            _marker: PhantomData,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 当前文件字节数（含 header）
    pub fn len(&self) -> u64 {
        self.len
    }

    /// 除 header 外没有任何帧
    pub fn is_empty(&self) -> bool {
        self.len <= HEADER_SIZE
    }

    pub fn append(&mut self, records: &[R]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let payload = bincode::serialize(records)?;
        let len: u32 = payload.len().try_into().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "journal frame too large")
        })?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&xxh3_64(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        // 单次 write_all：帧不会和别的写入交错
        self.file.write_all(&frame)?;
        self.file.flush()?;
        if self.fsync {
            self.file.sync_data()?;
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    /// 读出全部完整帧；遇到截断/校验失败的尾帧时停止，并把文件截回最后一个完整帧，
    /// 保证之后追加的帧仍可被回放。
    pub fn replay(&mut self) -> Result<JournalReplay<R>> {
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(HEADER_SIZE))?;

        let mut records = Vec::new();
        let mut frames = 0usize;
        let mut truncated = 0usize;
        let mut good_len = HEADER_SIZE;
        let file_len = f.metadata()?.len();
        loop {
            let mut hdr = [0u8; FRAME_HEADER_SIZE];
            match f.read_exact(&mut hdr) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // 连帧头都不完整：只有存在残余字节时才算截断
                    if file_len > good_len {
                        truncated += 1;
                    }
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(hdr[0..4].try_into().unwrap_or([0; 4])) as usize;
            let crc = u64::from_le_bytes(hdr[4..12].try_into().unwrap_or([0; 8]));
            // 长度字段本身可能是写了一半的垃圾：超出文件剩余字节就按截断处理，不按它分配
            let remaining = file_len.saturating_sub(good_len + FRAME_HEADER_SIZE as u64);
            if len as u64 > remaining {
                truncated += 1;
                break;
            }
            let mut buf = vec![0u8; len];
            if f.read_exact(&mut buf).is_err() {
                truncated += 1;
                break;
            }
            if xxh3_64(&buf) != crc {
                truncated += 1;
                break;
            }
            match bincode::deserialize::<Vec<R>>(&buf) {
                Ok(mut batch) => records.append(&mut batch),
                Err(e) => {
                    tracing::warn!("journal {:?}: undecodable frame, stopping replay: {}", self.path, e);
                    truncated += 1;
                    break;
                }
            }
            frames += 1;
            good_len += (FRAME_HEADER_SIZE + len) as u64;
        }

        if truncated > 0 {
            tracing::warn!(
                "journal {:?}: dropping {} torn tail frame(s), truncating to {} bytes",
                self.path,
                truncated,
                good_len
            );
            self.file.set_len(good_len)?;
            self.len = good_len;
        }

        Ok(JournalReplay {
            records,
            frames,
            truncated_tail_frames: truncated,
        })
    }

    /// checkpoint 之后清空日志并推进 generation
    pub fn reset(&mut self, generation: u64) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        write_header(&mut f, generation)?;
        f.sync_all()?;
        drop(f);

        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.generation = generation;
        self.len = HEADER_SIZE;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn write_header(f: &mut File, generation: u64) -> std::io::Result<()> {
    let mut hdr = [0u8; HEADER_SIZE as usize];
    hdr[0..4].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
    hdr[4..8].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
    hdr[8..16].copy_from_slice(&generation.to_le_bytes());
    f.write_all(&hdr)?;
    f.flush()
}

fn open_or_init(path: &Path, generation: u64) -> Result<(File, u64)> {
    if path.exists() {
        let mut f = OpenOptions::new().read(true).append(true).open(path)?;
        let mut hdr = [0u8; HEADER_SIZE as usize];
        f.seek(SeekFrom::Start(0))?;
        if f.read_exact(&mut hdr).is_ok() {
            let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap_or([0; 4]));
            let ver = u32::from_le_bytes(hdr[4..8].try_into().unwrap_or([0; 4]));
            if magic == JOURNAL_MAGIC && ver == JOURNAL_VERSION {
                let gen = u64::from_le_bytes(hdr[8..16].try_into().unwrap_or([0; 8]));
                return Ok((f, gen));
            }
        }
        // header 不完整或不兼容：只可能是建文件时崩溃，重建
        tracing::warn!("journal {:?}: bad header, reinitializing", path);
    }

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    write_header(&mut f, generation)?;
    f.sync_all()?;
    drop(f);
    let f = OpenOptions::new().read(true).append(true).open(path)?;
    Ok((f, generation))
}
