/// Default adb executable, resolved through `PATH`
pub const DEFAULT_ADB_PATH: &str = "adb";

/// Environment variable overriding the adb executable
pub const ADB_PATH_ENV: &str = "SNAPO_ADB";

/// Abstract socket name prefix identifying debug channels
pub const DEFAULT_SOCKET_PREFIX: &str = "snapo_server_";

/// Interval between socket polls per device (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Newest handshake schema this host understands
pub const DEFAULT_SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// Dispatch limit per (request, body kind)
pub const DEFAULT_MAX_BODY_FETCH_ATTEMPTS: u32 = 3;

/// Timeout for opening a connection through a tunnel (milliseconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Upper bound on a single device bridge call (milliseconds)
pub const DEFAULT_BRIDGE_TIMEOUT_MS: u64 = 10_000;

/// Config file name under `<config_dir>/snapo/`
pub const CONFIG_FILE_NAME: &str = "config.json";
