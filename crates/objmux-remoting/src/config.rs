use std::path::Path;
use std::time::Duration;

use objmux_channel::{ChannellerConfig, HandshakeConfig};
use serde::{Deserialize, Serialize};

use crate::error::{RemotingError, Result};

/// Handshake settings as they appear in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandshakeSettings {
    pub protocol_name: String,
    pub protocol_version: String,
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    pub max_handshake_payload: usize,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        HandshakeConfig::default().into()
    }
}

impl From<HandshakeConfig> for HandshakeSettings {
    fn from(config: HandshakeConfig) -> Self {
        Self {
            protocol_name: config.protocol_name,
            protocol_version: config.protocol_version,
            timeout: config.timeout,
            max_handshake_payload: config.max_handshake_payload,
        }
    }
}

impl From<&HandshakeSettings> for HandshakeConfig {
    fn from(settings: &HandshakeSettings) -> Self {
        HandshakeConfig {
            timeout: settings.timeout,
            protocol_name: settings.protocol_name.clone(),
            protocol_version: settings.protocol_version.clone(),
            max_handshake_payload: settings.max_handshake_payload,
        }
    }
}

/// Multiplexer settings as they appear in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannellerSettings {
    pub send_buffer_size: usize,
    #[serde(rename = "association_timeout_ms", with = "millis")]
    pub association_timeout: Duration,
    pub max_payload_size: usize,
}

impl Default for ChannellerSettings {
    fn default() -> Self {
        let config = ChannellerConfig::default();
        Self {
            send_buffer_size: config.send_buffer_size,
            association_timeout: config.association_timeout,
            max_payload_size: config.max_payload_size,
        }
    }
}

impl From<&ChannellerSettings> for ChannellerConfig {
    fn from(settings: &ChannellerSettings) -> Self {
        ChannellerConfig {
            send_buffer_size: settings.send_buffer_size,
            association_timeout: settings.association_timeout,
            max_payload_size: settings.max_payload_size,
        }
    }
}

/// Configuration shared by [`RemotingClient`](crate::RemotingClient) and
/// [`RemotingServer`](crate::RemotingServer).
///
/// Durations are milliseconds in JSON:
///
/// ```json
/// { "reconnect": true, "call_timeout_ms": 10000, "handshake": { "protocol_version": "1.0" } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    pub handshake: HandshakeSettings,
    pub channeller: ChannellerSettings,
    /// How long a call waits for its result; `None` waits forever.
    #[serde(rename = "call_timeout_ms", with = "millis::option")]
    pub call_timeout: Option<Duration>,
    /// Period of the background reachability sweep.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
    /// Whether a client reconnects lazily after losing its connection.
    pub reconnect: bool,
    /// How long a client keeps retrying a refused connection.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeSettings::default(),
            channeller: ChannellerSettings::default(),
            call_timeout: Some(Duration::from_secs(30)),
            sweep_interval: Duration::from_secs(2),
            reconnect: false,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl EndpointConfig {
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_protocol(mut self, name: &str, version: &str) -> Self {
        self.handshake.protocol_name = name.to_string();
        self.handshake.protocol_version = version.to_string();
        self
    }

    pub fn handshake_config(&self) -> HandshakeConfig {
        (&self.handshake).into()
    }

    pub fn channeller_config(&self) -> ChannellerConfig {
        (&self.channeller).into()
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: EndpointConfig =
            serde_json::from_str(text).map_err(|e| RemotingError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RemotingError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handshake.protocol_name.is_empty() {
            return Err(RemotingError::Config("protocol_name must not be empty".into()));
        }
        if self.channeller.send_buffer_size == 0 {
            return Err(RemotingError::Config("send_buffer_size must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(RemotingError::Config("sweep_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
