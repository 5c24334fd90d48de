//! Context management constants.

/// Approximate characters per token for estimation.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimator cache entries kept before the cache is flushed.
pub const TOKEN_CACHE_CAPACITY: usize = 1024;

/// Non-system messages kept verbatim by the smart-compression strategy.
pub const SMART_COMPRESSION_RECENT: usize = 20;

/// Non-system messages kept verbatim by the summary strategy.
pub const SUMMARY_RECENT: usize = 10;

/// Per-message cap for light compression.
pub const LIGHT_EXCERPT_CHARS: usize = 200;

/// Per-message cap for medium compression digests.
pub const MEDIUM_EXCERPT_CHARS: usize = 80;

/// Words taken from each message for heavy compression.
pub const HEAVY_FRAGMENT_WORDS: usize = 4;

/// Fragments listed in a heavy compression sentence.
pub const HEAVY_MAX_FRAGMENTS: usize = 6;

/// Words taken from each user message when naming summary topics.
pub const SUMMARY_TOPIC_WORDS: usize = 6;

/// Topics named in a summary message.
pub const SUMMARY_MAX_TOPICS: usize = 5;
