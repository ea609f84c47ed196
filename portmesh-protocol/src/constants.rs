//! Protocol constants

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Minimum supported protocol version (for backward compatibility)
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Maximum supported protocol version (for forward compatibility)
pub const MAX_PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Connection timeout in seconds
pub const CONNECTION_TIMEOUT_SECS: u64 = 90;

/// RFC 4254 §7.1 global request asking the peer to listen on our behalf
pub const TCPIP_FORWARD: &str = "tcpip-forward";

/// RFC 4254 §7.1 global request cancelling a previous `tcpip-forward`
pub const CANCEL_TCPIP_FORWARD: &str = "cancel-tcpip-forward";

/// RFC 4254 §7.2 channel type opened for each connection accepted on a forward
pub const FORWARDED_TCPIP: &str = "forwarded-tcpip";
