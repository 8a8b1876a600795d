//! Tunable knobs for the download coordination core, exposed through a
//! builder the way bip_disk's `DiskManagerBuilder` exposes its own: chained
//! setters over an immutable config produced by `build()`.

/// Default accumulated-progress threshold before `FileInfo::update` is
/// considered worth flushing to disk; keeps a trailer write from firing on
/// every single chunk update.
pub const DEFAULT_TRAILER_FLUSH_THRESHOLD_BYTES: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SwarmConfig {
    pub trailer_flush_threshold_bytes: u64,
    pub max_concurrent_flushes: usize,
    pub completed_buffer_size: usize,
}

impl Default for SwarmConfig {
    fn default() -> SwarmConfig {
        SwarmConfig {
            trailer_flush_threshold_bytes: DEFAULT_TRAILER_FLUSH_THRESHOLD_BYTES,
            max_concurrent_flushes: crate::disk::DEFAULT_MAX_CONCURRENT,
            completed_buffer_size: crate::disk::DEFAULT_COMPLETED_BUFFER,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SwarmConfigBuilder {
    config: SwarmConfig,
}

impl SwarmConfigBuilder {
    pub fn new() -> SwarmConfigBuilder {
        SwarmConfigBuilder::default()
    }

    pub fn trailer_flush_threshold_bytes(mut self, bytes: u64) -> Self {
        self.config.trailer_flush_threshold_bytes = bytes;
        self
    }

    pub fn max_concurrent_flushes(mut self, max_concurrent_flushes: usize) -> Self {
        self.config.max_concurrent_flushes = max_concurrent_flushes;
        self
    }

    pub fn completed_buffer_size(mut self, completed_buffer_size: usize) -> Self {
        self.config.completed_buffer_size = completed_buffer_size;
        self
    }

    pub fn build(self) -> SwarmConfig {
        self.config
    }
}
