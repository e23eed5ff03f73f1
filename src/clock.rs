use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds on a process-local monotonic clock. Activity timestamps are
/// stored in atomics shared between a connection and its pool slot, so they
/// need a representation cheaper than `Instant`.
pub(crate) fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
