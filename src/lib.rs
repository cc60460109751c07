// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Three tightly coupled storage cores for HerdDB:
//!
//! - [`brin`]: a Block Range Index mapping keys to on-disk pages, with concurrent
//!   split and lazy loading.
//! - [`key_to_page_index`]: the primary-key access path, a concurrent map from key
//!   bytes to page id with compare-and-set updates.
//! - [`aligned_writer`]: an append-only, sector-aligned writer used for `O_DIRECT`
//!   page I/O.
//!
//! ##### NOTE
//!
//! > This crate does not implement a query planner, a transaction coordinator, or
//! > network RPC. It only provides the on-disk index structures those layers sit on
//! > top of.
//!
//! # Example usage
//!
//! ```
//! use herddb_index_core::{brin::BlockRangeIndex, page_store::FilePageStore, Config};
//! use std::sync::Arc;
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let config = Config::new(folder.path()).max_block_size(10_000);
//! let storage = Arc::new(FilePageStore::open(&config)?);
//! let brin = BlockRangeIndex::new(&config, storage);
//!
//! brin.put("my_key", "my_value")?;
//! assert_eq!(vec!["my_value".as_bytes().into()], brin.search(b"my_key")?);
//! #
//! # Ok::<(), herddb_index_core::Error>(())
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fjall-rs/lsm-tree/main/logo.png")]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

pub mod aligned_writer;
mod binary_search;
pub mod brin;
mod checksum;
pub mod config;

#[doc(hidden)]
pub mod descriptor_table;

mod error;

#[doc(hidden)]
pub mod file;

pub mod fs;
pub mod key_to_page_index;
pub mod page_store;
mod seqno;

#[doc(hidden)]
pub mod serde;

mod slice;
pub mod table_schema;

/// A `HashMap` keyed by a fast, non-cryptographic hash, used for the page store's
/// descriptor table.
pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, xxhash_rust::xxh3::Xxh3Builder>;

pub use {
    aligned_writer::AlignedBlockWriter,
    checksum::Checksum,
    config::Config,
    error::{Error, Result},
    key_to_page_index::KeyToPageIndex,
    page_store::{FilePageStore, IndexDataStorage, PageId},
    seqno::{SeqNo, SequenceNumberCounter},
    serde::{Deserializable, DeserializeError, Serializable, SerializeError},
    slice::Slice,
};
