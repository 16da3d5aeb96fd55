//! # Stratum Memory
//!
//! Native memory management for the Stratum runtime layer.
//!
//! This crate provides:
//! - [`NativeHeap`], a malloc/realloc/free facade that never panics on
//!   exhaustion and routes every block through the [`MallocLedger`]
//! - Block integrity checks (header and footer canaries, double-free and
//!   foreign-pointer detection) with per-category and per-site accounting
//! - [`VirtualMemory`], reservation, commit and file mapping over
//!   [`stratum_system::Platform`] with its own region accounting
//! - [`PageSizes`] and the page size selection for regions
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use stratum_memory::{LibcAllocator, MallocLedger, MemFlags, MemoryConfig, NativeHeap, TrackingLevel};
//!
//! let config = MemoryConfig {
//!     tracking: TrackingLevel::Summary,
//!     ..MemoryConfig::default()
//! };
//! let heap = NativeHeap::with_ledger(LibcAllocator, Arc::new(MallocLedger::new(config)));
//!
//! let block = heap.malloc(64, MemFlags::Internal).expect("native heap exhausted");
//! assert_eq!(heap.ledger().unwrap().summary().category(MemFlags::Internal).bytes, 64);
//! // SAFETY: `block` came from this heap and is freed once.
//! unsafe { heap.free(Some(block)) };
//! ```
//!
//! ## Features
//!
//! - `stack-capture` (default): call stacks for detail-level tracking
//! - `serde`: serialization of configuration and usage types
//! - `test-util`: failing allocator and recording corruption handler
//!
//! ## Configuration
//!
//! [`MemoryConfig`] is plain data; [`MemoryConfig::from_env`] reads
//! `STRATUM_NMT`, `STRATUM_MALLOC_LIMIT` and `STRATUM_LARGE_PAGES`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![allow(unsafe_code)] // raw blocks, headers and mappings

pub mod callsite;
pub mod config;
pub mod error;
pub mod flags;
pub mod heap;
pub mod ledger;
pub mod page_sizes;
pub mod virtual_memory;

pub use callsite::{CallSite, CallStack};
pub use config::{MallocLimit, MemoryConfig, TrackingLevel};
pub use error::{MemoryError, MemoryResult};
pub use flags::MemFlags;
pub use heap::{LibcAllocator, NativeHeap, SystemAllocator};
pub use ledger::MallocLedger;
pub use page_sizes::{PageSizeSelector, PageSizes};
pub use virtual_memory::{VirtualMemory, VirtualMemoryTracker};
