pub mod entry;
pub mod rdn;

pub use entry::*;
pub use rdn::*;

/// 条目的合成主键：每个 store 内严格递增、永不复用。
pub type Id = u64;

/// 顶层条目的 parent id（RDN 索引里 `(ROOT_ID, rdn)` 表示挂在根下）。
pub const ROOT_ID: Id = 0;
