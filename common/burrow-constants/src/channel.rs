//! Constants for the relay channel (tunnel side).

use core::time::Duration;

/// How long a `Connect` request may wait for its `Connected`/`Error` reply
/// before the waiter is dropped.
pub const CONNECT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle keepalive ping interval issued by the channel client.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// URL path of the relay channel websocket endpoint.
pub const CHANNEL_PATH: &str = "/channel";
