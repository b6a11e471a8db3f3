use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::core::Id;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// 引擎对上暴露的全部错误种类。
///
/// 约定：引擎内部不做任何重试；`StorageIo` / `ConcurrentModification` 原样上抛，
/// 由调用方决定重试还是放弃。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("cursor is not positioned on an element")]
    InvalidPosition,

    #[error("cursor is closed")]
    CursorClosed {
        #[source]
        cause: Option<Arc<StoreError>>,
    },

    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("no usable normalizer for attribute `{0}`")]
    NoNormalizerAvailable(String),

    /// 本引擎的游标都基于快照，不会产生该错误；保留给 fail-fast 的 Cursor 实现。
    #[error("concurrent modification of `{0}`")]
    ConcurrentModification(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("corrupted backing file {path:?}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("`{0}` is closed")]
    Closed(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid value for `{attribute}`: {reason}")]
    InvalidValue { attribute: String, reason: String },

    #[error("entry {0} has children")]
    HasChildren(Id),
}

impl StoreError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        StoreError::NotFound(what.to_string())
    }

    pub fn closed_cursor(cause: Option<Arc<StoreError>>) -> Self {
        StoreError::CursorClosed { cause }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
