#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod core;
pub mod cursor;
pub mod error;
pub mod index;
pub mod master;
pub mod schema;
pub mod stats;
pub mod storage;
pub mod store;
pub mod table;
pub mod tree;

pub use config::StoreConfig;
pub use core::{AttrValue, Entry, Id, ParentIdAndRdn, Rdn, ROOT_ID};
pub use error::{Result, StoreError};
pub use store::{SearchScope, Store};
