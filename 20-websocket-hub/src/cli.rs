use std::{net::SocketAddr, num::{NonZeroU64, NonZeroUsize}, path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    connection::ConnectionConfig,
    hub::HubConfig,
    server::{DEFAULT_MAX_UPLOAD_BYTES, ServerConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the HTTP server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "HUB_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Path that accepts WebSocket upgrades.
    #[arg(long, env = "HUB_WS_PATH", default_value = "/wss")]
    pub ws_path: String,

    /// Directory served for every path not handled elsewhere.
    #[arg(long, env = "HUB_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// Directory uploaded images are stored in and served from under /media.
    #[arg(long, env = "HUB_MEDIA_DIR", default_value = "media")]
    pub media_dir: PathBuf,

    /// Messages buffered per client before the client counts as too slow and is dropped.
    #[arg(long, env = "HUB_MAILBOX_CAPACITY", default_value = "256")]
    pub mailbox_capacity: NonZeroUsize,

    /// Commands that may wait for the hub before submitters are suspended.
    #[arg(long, env = "HUB_QUEUE_CAPACITY", default_value = "1024")]
    pub queue_capacity: NonZeroUsize,

    /// Origin allowed to open a WebSocket. Repeat or comma-separate; none means any origin.
    #[arg(
        long = "allowed-origin",
        env = "HUB_ALLOWED_ORIGINS",
        value_delimiter = ','
    )]
    pub allowed_origins: Vec<String>,

    /// Seconds of silence after which a client is disconnected. Unset disables the check.
    #[arg(long, env = "HUB_IDLE_TIMEOUT")]
    pub idle_timeout: Option<NonZeroU64>,

    /// Largest accepted upload request body, in bytes.
    #[arg(long, env = "HUB_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,
}

impl Cli {
    pub fn into_server_config(self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            ws_path: self.ws_path,
            static_dir: self.static_dir,
            media_dir: self.media_dir,
            allowed_origins: self.allowed_origins,
            max_upload_bytes: self.max_upload_bytes,
            hub: HubConfig {
                queue_capacity: self.queue_capacity.get(),
            },
            connection: ConnectionConfig {
                mailbox_capacity: self.mailbox_capacity.get(),
                idle_timeout: self
                    .idle_timeout
                    .map(|secs| Duration::from_secs(secs.get())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_defaults() {
        let config = Cli::try_parse_from(["websocket-hub"])
            .expect("parse defaults")
            .into_server_config();
        let defaults = ServerConfig::default();

        assert_eq!(config.listen, defaults.listen);
        assert_eq!(config.ws_path, defaults.ws_path);
        assert_eq!(config.connection.mailbox_capacity, 256);
        assert_eq!(config.hub.queue_capacity, defaults.hub.queue_capacity);
        assert_eq!(config.connection.idle_timeout, None);
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn flags_override_defaults() {
        let config = Cli::try_parse_from([
            "websocket-hub",
            "--listen",
            "0.0.0.0:9000",
            "--mailbox-capacity",
            "2",
            "--allowed-origin",
            "http://a.example,http://b.example",
            "--idle-timeout",
            "30",
        ])
        .expect("parse flags")
        .into_server_config();

        assert_eq!(config.listen, "0.0.0.0:9000".parse().expect("addr"));
        assert_eq!(config.connection.mailbox_capacity, 2);
        assert_eq!(
            config.allowed_origins,
            vec!["http://a.example".to_string(), "http://b.example".to_string()]
        );
        assert_eq!(config.connection.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result = Cli::try_parse_from(["websocket-hub", "--mailbox-capacity", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_idle_timeout_is_rejected() {
        let result = Cli::try_parse_from(["websocket-hub", "--idle-timeout", "0"]);
        assert!(result.is_err());
    }
}
