//! Per-process configurable limits, read once from the environment.

fn env_clamped(key: &str, default: u64, min: u64, max: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok()).unwrap_or(default).clamp(min, max)
}

/// Resource limits for the File AIO worker pool and the event bus.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// `ZI_FILE_AIO_QUEUE_CAP`.
    pub file_aio_queue_cap: usize,
    /// `ZI_FILE_AIO_WORKERS`.
    pub file_aio_workers: usize,
    /// Max bytes for an `event/bus` topic name.
    pub max_topic_bytes: usize,
    /// Max bytes for an `event/bus` publish payload.
    pub max_event_payload_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Limits {
    /// Read all limits from the environment, clamping to their documented
    /// ranges and falling back to the documented defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            file_aio_queue_cap: env_clamped("ZI_FILE_AIO_QUEUE_CAP", 64, 1, 4096) as usize,
            file_aio_workers: env_clamped("ZI_FILE_AIO_WORKERS", 4, 1, 64) as usize,
            max_topic_bytes: 60_000,
            max_event_payload_bytes: 60_000,
        }
    }
}
