use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the server, the broker core and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Address the websocket server binds to, and that the CLI connects to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr())
    }
}

/// Configuration settings for the broker core.
///
/// `prefetch` is the default per-consumer limit on unacknowledged deliveries
/// (`0` = unlimited). Without a `data_dir` the broker keeps everything in
/// memory and durable queues do not survive a restart.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub prefetch: u16,
    pub data_dir: Option<String>,
    pub sync_writes: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Settings as read from the file and environment layers. Every field may
/// be absent; missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub prefetch: Option<u16>,
    pub data_dir: Option<String>,
    pub sync_writes: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            prefetch: 1,
            data_dir: None,
            sync_writes: true,
        }
    }
}

impl PartialSettings {
    /// Overlays whatever was provided on top of the defaults.
    pub fn merge(self) -> Settings {
        let default = Settings::default();
        let server = self.server;
        let broker = self.broker;
        let logging = self.logging;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
            },
            broker: BrokerSettings {
                prefetch: broker
                    .as_ref()
                    .and_then(|b| b.prefetch)
                    .unwrap_or(default.broker.prefetch),
                data_dir: broker
                    .as_ref()
                    .and_then(|b| b.data_dir.clone())
                    .or(default.broker.data_dir),
                sync_writes: broker
                    .as_ref()
                    .and_then(|b| b.sync_writes)
                    .unwrap_or(default.broker.sync_writes),
            },
            logging: LoggingSettings {
                level: logging
                    .and_then(|l| l.level)
                    .unwrap_or(default.logging.level),
            },
        }
    }
}
