use std::time::Duration;

/// Tuning knobs for a running relay.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Lines that may wait in one session's outbound queue before new
    /// broadcast or direct lines to that session are dropped.
    pub outbound_capacity: usize,
    /// Time a new connection gets to answer both login prompts.
    pub handshake_timeout: Duration,
    /// Longest wait for a recipient's writer to reach a queued file transfer.
    pub transfer_queue_timeout: Duration,
    /// Longest wait for a recipient to accept the next file chunk.
    pub transfer_stall_timeout: Duration,
    /// How long teardown waits for a session's queued output to flush.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            handshake_timeout: Duration::from_secs(60),
            transfer_queue_timeout: Duration::from_secs(300),
            transfer_stall_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn transfer_limits(&self) -> TransferLimits {
        TransferLimits {
            queue_wait: self.transfer_queue_timeout,
            stall: self.transfer_stall_timeout,
        }
    }
}

/// Time limits for relaying one file.
///
/// The stall clock only runs once the recipient's writer has started on the
/// transfer; time spent behind other items in its queue counts against
/// `queue_wait` instead.
#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    pub queue_wait: Duration,
    pub stall: Duration,
}
