use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use axum::{
    Router,
    extract::{ConnectInfo, DefaultBodyLimit, FromRef, State, WebSocketUpgrade, ws::WebSocket},
    http::{HeaderMap, StatusCode, header::ORIGIN},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionConfig},
    hub::{Hub, HubConfig, HubHandle, RunningHub},
    upload::{MediaDir, upload_image},
};

/// Body limit applied to the upload route when not configured otherwise.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 << 20;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Path the WebSocket upgrade is served on.
    pub ws_path: String,
    pub static_dir: PathBuf,
    pub media_dir: PathBuf,
    /// Origins allowed to open a WebSocket. Empty means any origin.
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
    pub hub: HubConfig,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            ws_path: "/wss".to_string(),
            static_dir: PathBuf::from("static"),
            media_dir: PathBuf::from("media"),
            allowed_origins: Vec::new(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            hub: HubConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// HTTP front door: the WebSocket upgrade endpoint, image uploads, uploaded
/// media and the static chat page, all sharing one hub.
pub struct Server {
    listener: TcpListener,
    router: Router,
    hub: RunningHub,
}

impl Server {
    /// Binds the listener and starts the hub. Nothing is served until
    /// [`Server::run_until`] is awaited.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        if !config.ws_path.starts_with('/') {
            bail!("websocket path must start with '/', got {:?}", config.ws_path);
        }

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;

        if config.allowed_origins.is_empty() {
            warn!(
                "accepting WebSocket upgrades from any origin; \
                 configure allowed origins before exposing this server"
            );
        }

        let hub = Hub::spawn(config.hub.clone());
        let router = router(&config, hub.handle());

        Ok(Self {
            listener,
            router,
            hub,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> HubHandle {
        self.hub.handle()
    }

    /// Serves until `shutdown` resolves, then stops the hub. Stopping the hub
    /// closes every mailbox, which sends a close frame to each connected peer.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            router,
            hub,
        } = self;

        let served = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed");

        info!("server shutting down");
        hub.stop().await;
        served
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    connection: ConnectionConfig,
    origins: Arc<OriginPolicy>,
    media: MediaDir,
}

impl FromRef<AppState> for MediaDir {
    fn from_ref(state: &AppState) -> Self {
        state.media.clone()
    }
}

/// Builds the application router around an already running hub.
pub fn router(config: &ServerConfig, hub: HubHandle) -> Router {
    let state = AppState {
        hub,
        connection: config.connection.clone(),
        origins: Arc::new(OriginPolicy::new(config.allowed_origins.clone())),
        media: MediaDir(Arc::new(config.media_dir.clone())),
    };

    Router::new()
        .route(&config.ws_path, get(upgrade))
        .route(
            "/upload",
            post(upload_image).layer(DefaultBodyLimit::max(config.max_upload_bytes)),
        )
        .nest_service("/media", ServeDir::new(&config.media_dir))
        .fallback_service(ServeDir::new(&config.static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if !state.origins.permits(&headers) {
        debug!(%peer, origin = ?headers.get(ORIGIN), "rejecting upgrade from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    let AppState {
        hub, connection, ..
    } = state;
    ws.on_upgrade(move |socket: WebSocket| async move {
        Connection::new(socket, connection)
            .with_peer(peer)
            .run(hub)
            .await;
    })
}

/// Which browser origins may open a WebSocket.
#[derive(Debug, Default)]
struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    fn permits(&self, headers: &HeaderMap) -> bool {
        if self.allowed.is_empty() {
            return true;
        }

        headers
            .get(ORIGIN)
            .and_then(|origin| origin.to_str().ok())
            .is_some_and(|origin| {
                self.allowed
                    .iter()
                    .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(origin))
            })
    }
}
