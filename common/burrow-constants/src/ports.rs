/// Default TCP port the relay host listens on. Overridden by the `PORT`
/// environment variable.
pub const DEFAULT_RELAY_PORT: u16 = 3000;
