// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

pub mod backoff_state;
pub mod cache_entry;
pub mod correlation_id;
pub mod memory_block_header;
pub mod parsed_row;
pub mod retry_context;
pub mod schema;
pub mod state_snapshot;
pub mod token_bucket;

pub use backoff_state::{BackoffConfig, BackoffState};
pub use cache_entry::CacheEntry;
pub use correlation_id::CorrelationId;
pub use memory_block_header::{BlockHandle, BlockMagic, MemoryBlockHeader};
pub use parsed_row::ParsedRow;
pub use retry_context::{AttemptRecord, RetryConfig, RetryContext};
pub use schema::{FieldConstraints, FieldType, Schema, SchemaField, SchemaVersion};
pub use state_snapshot::StateSnapshot;
pub use token_bucket::TokenBucket;
