//! Cache-control policy. One table, used everywhere a response is built.

/// Fully canonical target-segment URLs and raw files at exact versions.
pub const IMMUTABLE: &str = "public, max-age=31536000, immutable";
/// Wrappers for pinned-but-unprefixed versions, redirects, caret wrappers.
pub const TEN_MINUTES: &str = "public, max-age=600";
/// Errors and status endpoints.
pub const REVALIDATE: &str = "public, max-age=0, must-revalidate";
/// Build failures.
pub const NO_STORE: &str = "no-store";
