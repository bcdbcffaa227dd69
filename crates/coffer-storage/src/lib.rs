// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Storage plumbing shared by the backup and restore pipelines: a thin
//! retry-classifying layer over [`object_store`], streaming compression,
//! and the transfer admission governor.

pub mod compress;
pub mod object_store;
pub mod throttle;

pub use compress::{CompressError, CompressedFile, CompressionCodec, DecompressedFile};
pub use throttle::{ByteBucket, GovernorTicket, ThrottleError, TransferGovernor};

pub use self::object_store::{RetryPolicy, StoreError, StoreResult};

/// Chunk size for every streaming copy in this crate. Transfers never
/// buffer more than one chunk per in-flight file.
pub const COPY_BUFFER_SIZE: usize = 128 * 1024;
