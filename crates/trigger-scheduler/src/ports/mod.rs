// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborator ports for record, field and table lookups.

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::InMemoryCatalog;
pub use postgres::PgCatalog;
pub use traits::*;
