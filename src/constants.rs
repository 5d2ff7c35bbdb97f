//! Crate-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable and configurable.

/// Number of messages fetched, stored, and indexed as one unit.
/// Keeps peak memory at one window of parsed messages.
pub const FETCH_BATCH_SIZE: usize = 50;

/// Re-select the folder after this many fetch batches (~1000 messages).
/// Forces the IMAP client library to drop cached message content.
pub const FOLDER_REOPEN_BATCHES: u32 = 20;

/// Batch size for flag-only fetches.
/// Prevents IMAP command line length limits (~8KB).
pub const FLAG_FETCH_BATCH_SIZE: usize = 500;

/// Maximum number of connection attempts before a sync call gives up.
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Maximum delay in seconds between connection attempts.
pub const MAX_RETRY_DELAY_SECS: u64 = 30;

/// Default result limit for search queries.
pub const SEARCH_DEFAULT_LIMIT: usize = 50;

/// Default result limit for message listings.
pub const LIST_DEFAULT_LIMIT: usize = 100;
