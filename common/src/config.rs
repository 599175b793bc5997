use std::{env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::IpcError;

/// Protocol version exchanged in the first handshake message
pub const PROTOCOL_VERSION: u8 = 2;

/// Smallest maximum message size a server may configure
pub const MIN_MSG_SIZE: usize = 1024;
/// Maximum payload bytes per message unless configured otherwise (3 MiB)
pub const DEFAULT_MAX_MSG_SIZE: usize = 3 * 1024 * 1024;
/// Largest maximum message size that still fits a 32-bit length prefix with
/// room for the type tag and AEAD overhead
pub const MAX_MSG_SIZE_CEILING: usize = u32::MAX as usize - 64;

/// Directory holding Unix domain socket files
pub const DEFAULT_SOCKET_BASE_PATH: &str = "/tmp";
/// Pause between client dial attempts
pub const DEFAULT_RETRY_TIMER: Duration = Duration::from_millis(200);

const SOCKET_DIR_ENV: &str = "LOCALWIRE_SOCKET_DIR";
const TIMEOUT_ENV: &str = "LOCALWIRE_TIMEOUT_MS";
const ENCRYPTION_ENV: &str = "LOCALWIRE_ENCRYPTION";
const ENCRYPTION_REQUIRED_ENV: &str = "LOCALWIRE_ENCRYPTION_REQUIRED";

/// Server endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// How long to wait for a client to connect or reconnect; zero waits
    /// forever
    #[serde(with = "duration_ms")]
    pub timeout:            Duration,
    /// Largest payload, in bytes, either side may send
    pub max_msg_size:       usize,
    /// Whether to negotiate an encrypted channel
    pub encryption:         bool,
    /// Create the socket with a zero umask so any local user can connect
    pub unmask_permissions: bool,
    /// Directory for the socket file (ignored for Windows named pipes)
    pub socket_base_path:   PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout:            Duration::ZERO,
            max_msg_size:       DEFAULT_MAX_MSG_SIZE,
            encryption:         true,
            unmask_permissions: false,
            socket_base_path:   PathBuf::from(DEFAULT_SOCKET_BASE_PATH),
        }
    }
}

impl ServerConfig {
    /// Creates a server configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `LOCALWIRE_SOCKET_DIR`, `LOCALWIRE_TIMEOUT_MS`
    /// and `LOCALWIRE_ENCRYPTION`
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(dir) = socket_dir_from_env() {
            config.socket_base_path = dir;
        }
        if let Some(timeout) = timeout_from_env() {
            config.timeout = timeout;
        }
        if let Some(encryption) = flag_from_env(ENCRYPTION_ENV) {
            config.encryption = encryption;
        }
        config
    }

    /// Set the connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum message size
    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Enable or disable encryption
    pub fn with_encryption(mut self, encryption: bool) -> Self {
        self.encryption = encryption;
        self
    }

    /// Create the socket file world-accessible
    pub fn with_unmask_permissions(mut self, unmask: bool) -> Self {
        self.unmask_permissions = unmask;
        self
    }

    /// Set the socket directory
    pub fn with_socket_base_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.socket_base_path = path.into();
        self
    }

    /// Applies the documented floors and defaults to out-of-range values
    pub fn normalized(mut self) -> Self {
        if self.max_msg_size < MIN_MSG_SIZE {
            self.max_msg_size = DEFAULT_MAX_MSG_SIZE;
        }
        self.max_msg_size = self.max_msg_size.min(MAX_MSG_SIZE_CEILING);
        if self.socket_base_path.as_os_str().is_empty() {
            self.socket_base_path = PathBuf::from(DEFAULT_SOCKET_BASE_PATH);
        }
        self
    }
}

/// Client endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long to keep dialing before giving up; zero dials forever
    #[serde(with = "duration_ms")]
    pub timeout:             Duration,
    /// Pause between dial attempts
    #[serde(with = "duration_ms")]
    pub retry_timer:         Duration,
    /// Refuse servers that do not offer encryption
    pub encryption_required: bool,
    /// Directory holding the server's socket file (ignored for Windows named
    /// pipes)
    pub socket_base_path:    PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout:             Duration::ZERO,
            retry_timer:         DEFAULT_RETRY_TIMER,
            encryption_required: false,
            socket_base_path:    PathBuf::from(DEFAULT_SOCKET_BASE_PATH),
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `LOCALWIRE_SOCKET_DIR`, `LOCALWIRE_TIMEOUT_MS`
    /// and `LOCALWIRE_ENCRYPTION_REQUIRED`
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(dir) = socket_dir_from_env() {
            config.socket_base_path = dir;
        }
        if let Some(timeout) = timeout_from_env() {
            config.timeout = timeout;
        }
        if let Some(required) = flag_from_env(ENCRYPTION_REQUIRED_ENV) {
            config.encryption_required = required;
        }
        config
    }

    /// Set the dial timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the pause between dial attempts
    pub fn with_retry_timer(mut self, retry_timer: Duration) -> Self {
        self.retry_timer = retry_timer;
        self
    }

    /// Refuse plaintext servers
    pub fn with_encryption_required(mut self, required: bool) -> Self {
        self.encryption_required = required;
        self
    }

    /// Set the socket directory
    pub fn with_socket_base_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.socket_base_path = path.into();
        self
    }

    /// Applies the documented defaults to unset values
    pub fn normalized(mut self) -> Self {
        if self.retry_timer.is_zero() {
            self.retry_timer = DEFAULT_RETRY_TIMER;
        }
        if self.socket_base_path.as_os_str().is_empty() {
            self.socket_base_path = PathBuf::from(DEFAULT_SOCKET_BASE_PATH);
        }
        self
    }
}

/// Checks that `name` can be used as a socket file or pipe name
pub fn validate_endpoint_name(name: &str) -> Result<(), IpcError> {
    let reason = if name.is_empty() {
        "name cannot be empty"
    } else if name.contains(['/', '\\']) {
        "name must not contain path separators"
    } else if name.contains('\0') {
        "name must not contain NUL bytes"
    } else {
        return Ok(());
    };

    Err(IpcError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

fn socket_dir_from_env() -> Option<PathBuf> {
    env::var_os(SOCKET_DIR_ENV)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
}

fn timeout_from_env() -> Option<Duration> {
    let raw = env::var(TIMEOUT_ENV).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", TIMEOUT_ENV, raw, e);
            None
        }
    }
}

fn flag_from_env(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("Ignoring {}={:?}: expected true or false", key, raw);
            None
        }
    }
}

/// Serializes a `Duration` as whole milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.timeout, Duration::ZERO);
        assert_eq!(config.max_msg_size, 3_145_728);
        assert!(config.encryption);
        assert_eq!(config.socket_base_path, PathBuf::from("/tmp"));
    }

    #[test]
    fn small_max_msg_size_falls_back_to_default() {
        let config = ServerConfig::new().with_max_msg_size(10).normalized();
        assert_eq!(config.max_msg_size, DEFAULT_MAX_MSG_SIZE);

        let config = ServerConfig::new().with_max_msg_size(MIN_MSG_SIZE).normalized();
        assert_eq!(config.max_msg_size, MIN_MSG_SIZE);

        let config = ServerConfig::new().with_max_msg_size(usize::MAX).normalized();
        assert_eq!(config.max_msg_size, MAX_MSG_SIZE_CEILING);
    }

    #[test]
    fn client_zero_retry_timer_uses_default() {
        let config = ClientConfig::new()
            .with_retry_timer(Duration::ZERO)
            .with_socket_base_path("")
            .normalized();
        assert_eq!(config.retry_timer, DEFAULT_RETRY_TIMER);
        assert_eq!(config.socket_base_path, PathBuf::from(DEFAULT_SOCKET_BASE_PATH));
    }

    #[test]
    fn config_deserializes_with_missing_fields() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"timeout": 2500, "encryption": false}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert!(!config.encryption);
        assert_eq!(config.max_msg_size, DEFAULT_MAX_MSG_SIZE);

        let client: ClientConfig = serde_json::from_str(r#"{"retry_timer": 50}"#).unwrap();
        assert_eq!(client.retry_timer, Duration::from_millis(50));
        assert_eq!(client.timeout, Duration::ZERO);
    }

    #[test]
    fn config_serializes_durations_as_millis() {
        let config = ClientConfig::new().with_timeout(Duration::from_secs(3));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout"], 3000);
        assert_eq!(json["retry_timer"], 200);
    }

    #[test]
    fn endpoint_names() {
        assert!(validate_endpoint_name("example-app").is_ok());
        assert!(matches!(
            validate_endpoint_name(""),
            Err(IpcError::InvalidName { .. })
        ));
        assert!(validate_endpoint_name("../etc/passwd").is_err());
        assert!(validate_endpoint_name(r"pipe\name").is_err());
        assert!(validate_endpoint_name("nul\0byte").is_err());
    }
}
