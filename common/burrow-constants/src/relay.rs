//! Constants for the relay host's per-connection TCP manager.

use core::time::Duration;

/// Time allowed for opening the real outbound TCP connection.
pub const HOST_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Queued inbound bytes at or above this threshold flush immediately.
pub const FLUSH_THRESHOLD: usize = 4096;

/// Queued inbound bytes below the threshold flush after this delay.
pub const FLUSH_DELAY: Duration = Duration::from_millis(10);

/// Read buffer size for one chunk from a real outbound socket.
pub const SOCKET_READ_BUF: usize = 32 * 1024;
