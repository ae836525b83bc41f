//! # devfifo - device firmware ring FIFO
//!
//! A fixed-capacity circular buffer for USB/embedded device firmware, shared
//! between interrupt service routines and foreground task code.
//!
//! ## Design
//!
//! - Byte- or fixed-size-item granularity, chosen at construction
//! - Optional overwrite-on-full mode, switchable at runtime
//! - Two block-copy strategies: increasing-address, and constant-address for
//!   memory-mapped hardware FIFO registers (word-at-a-time with remainder
//!   handling)
//! - Zero-copy linear regions plus unchecked cursor moves for DMA engines
//! - Cursors live in an extended `2 * depth` index space out of the 16-bit
//!   range, so wrap handling is a branch and an add instead of a modulo
//! - A single index overflow caused by an unsupervised DMA writer is
//!   detected on the read side and corrected by snapping the read cursor
//! - Synchronization is an injected capability: an optional external mutex
//!   pair, or none when the caller guarantees exclusion by construction
//!
//! ## Example
//!
//! ```
//! use devfifo::Fifo;
//!
//! // 8 items of 1 byte each, not overwritable
//! let fifo = Fifo::new(8, 1, false).unwrap();
//!
//! assert_eq!(fifo.write_n(&[1, 2, 3]), 3);
//! assert_eq!(fifo.count(), 3);
//!
//! let mut out = [0u8; 3];
//! assert_eq!(fifo.read_n(&mut out), 3);
//! assert_eq!(out, [1, 2, 3]);
//! assert!(fifo.is_empty());
//! ```

#![warn(missing_docs)]

mod fifo;

pub use fifo::{
    ConfigError, DmaCursors, Fifo, FifoMutex, ReadRegion, WriteRegion, MAX_DEPTH,
};
