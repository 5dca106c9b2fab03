//! Process-wide tracing setup shared by every binary and test harness that
//! embeds the sync engine.

/// Initialize process-wide tracing with the `info` default directive.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

pub use self::tracing::init_with_default;

/// Tracing configuration (filters, layers).
pub mod tracing;
