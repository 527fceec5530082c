// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - action execution backends.

pub mod mock;
pub mod process_pool;
mod traits;
mod worker;

pub use mock::MockExecutor;
pub use process_pool::{ProcessPool, ProcessPoolConfig};
pub use traits::*;
pub use worker::MAX_CAPTURED_BYTES;
