pub mod deployments;
pub mod event_utils;
pub mod events;
pub mod metrics;
pub mod notes;
pub mod pois;
pub mod provision;
pub mod system;

use crate::{conf, storage};
use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use dropshot::{
    ApiDescription, ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServerStarter,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::{error, info};
use tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};

const BUILD_SEMVER: &str = env!("BUILD_SEMVER");
const BUILD_COMMIT: &str = env!("BUILD_COMMIT");

/// Current epoch time in milliseconds.
pub fn epoch_milli() -> u64 {
    let current_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis();

    u64::try_from(current_epoch).unwrap()
}

/// Formats a duration for log fields.
pub fn format_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

/// Logs the error alongside the request id and hands the caller an opaque 500. The request id
/// lets operators line the user-visible failure up with the full error in the service logs.
#[macro_export]
macro_rules! http_error {
    ($message:expr, $request_id:expr, $err:expr) => {{
        tracing::error!(message = $message, request_id = %$request_id, error = ?$err);
        dropshot::HttpError::for_internal_error(format!(
            "{}; request_id: {}",
            $message, $request_id
        ))
    }};
}

/// Websocket equivalent of [`http_error!`]; logs, closes the stream with the given close code,
/// and returns the external message for the handler to propagate.
pub async fn websocket_error<S>(
    message: &str,
    code: CloseCode,
    request_id: String,
    mut ws: WebSocketStream<S>,
    err: Option<String>,
) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    error!(message = message, request_id = %request_id, error = ?err);

    let _ = ws
        .close(Some(CloseFrame {
            code,
            reason: message.to_string().into(),
        }))
        .await;

    message.to_string()
}

/// Resolves once the process receives SIGINT or SIGTERM.
pub async fn listen_for_terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).expect("could not register SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("could not register SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

/// Shared state for all request handlers and background tasks.
#[derive(Debug)]
pub struct ApiState {
    /// Various configurations needed across the api.
    pub config: conf::api::Config,

    /// The main backend storage implementation. Most of waypost's state lives here.
    pub storage: storage::Db,

    /// Allows handlers and background tasks to wait on and emit state changes across waypost.
    pub event_bus: event_utils::EventBus,

    /// Deployment ids that currently have a provisioner task attached. Guards the invariant
    /// that only one provisioner may mutate a deployment's status and progress at a time.
    pub active_deployments: DashMap<u64, ()>,
}

impl ApiState {
    pub fn new(config: conf::api::Config, storage: storage::Db) -> Self {
        let event_bus = event_utils::EventBus::new(
            storage.clone(),
            config.general.event_retention,
            config.general.event_prune_interval,
        );

        Self {
            config,
            storage,
            event_bus,
            active_deployments: DashMap::new(),
        }
    }
}

fn register_routes(api: &mut ApiDescription<Arc<ApiState>>) -> Result<()> {
    let routes: Vec<std::result::Result<(), _>> = vec![
        api.register(deployments::list_deployments),
        api.register(deployments::get_deployment),
        api.register(deployments::create_deployment),
        api.register(deployments::delete_deployment),
        api.register(notes::list_notes),
        api.register(notes::get_note),
        api.register(notes::create_note),
        api.register(notes::update_note),
        api.register(notes::delete_note),
        api.register(pois::list_pois),
        api.register(pois::get_poi),
        api.register(pois::create_poi),
        api.register(pois::update_poi),
        api.register(pois::delete_poi),
        api.register(metrics::record_metrics),
        api.register(metrics::list_metrics),
        api.register(metrics::get_latest_metrics),
        api.register(events::stream_events),
        api.register(events::get_event),
        api.register(events::delete_event),
        api.register(system::get_system_metadata),
        api.register(system::get_health),
    ];

    for route in routes {
        route.map_err(|e| anyhow!("could not register endpoint; {e}"))?;
    }

    Ok(())
}

/// Create a new instance of the waypost api service and block until it shuts down.
pub async fn start_service(config: conf::api::Config) -> Result<()> {
    let storage = storage::Db::new(&config.server.storage_path)
        .await
        .context("could not initialize storage")?;

    let api_state = Arc::new(ApiState::new(config.clone(), storage));

    let mut api = ApiDescription::new();
    register_routes(&mut api)?;

    let dropshot_config = ConfigDropshot {
        bind_address: config
            .server
            .bind_address
            .parse()
            .context("could not parse server.bind_address")?,
        default_request_body_max_bytes: 1024 * 1024,
        ..Default::default()
    };

    // Dropshot logs through slog while the rest of waypost logs through tracing; the dropshot
    // logger stays at error level so per-request noise does not drown the service logs.
    let log = ConfigLogging::StderrTerminal {
        level: ConfigLoggingLevel::Error,
    }
    .to_logger("waypost")
    .context("could not build server logger")?;

    let server = HttpServerStarter::new(&dropshot_config, api, api_state, &log)
        .map_err(|e| anyhow!("could not start api server; {e}"))?
        .start();

    info!(
        url = %config.server.bind_address,
        semver = BUILD_SEMVER,
        commit = BUILD_COMMIT,
        "Started waypost api service"
    );

    tokio::select! {
        _ = listen_for_terminate_signal() => {
            info!("Received terminate signal; shutting down");
            Ok(())
        }
        result = server => result.map_err(|e| anyhow!("server exited unexpectedly; {e}")),
    }
}
