//! # Module Server
//!
//! Wires one module's event log, gateway, aggregator and routes into an
//! axum server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::errors::ServerError;
use super::routes::module_routes;
use super::state::AppState;
use crate::aggregator::{ContextAggregator, HttpModuleClient, ModuleClient};
use crate::auth::{JwtConfig, JwtManager};
use crate::cache::{Cache, CacheConfig};
use crate::config::AppConfig;
use crate::event_log::{EventLog, StartOffset, StreamConsumer};
use crate::observability::MetricsRegistry;
use crate::realtime::{EventRelay, Gateway, GatewayDirectory};

/// Consumer group the relay reads module events with
pub const RELAY_GROUP: &str = "realtime-relay";

/// A configured module server, ready to bind
pub struct ModuleServer {
    config: AppConfig,
    state: AppState,
}

impl ModuleServer {
    /// Build a server that calls other modules over HTTP
    pub fn new(config: AppConfig) -> Result<Self, ServerError> {
        let client = HttpModuleClient::new(config.aggregation_timeout())?;
        Self::with_client(config, Arc::new(client))
    }

    /// Build a server with a custom module transport
    pub fn with_client(config: AppConfig, client: Arc<dyn ModuleClient>) -> Result<Self, ServerError> {
        config.validate()?;

        let module = config.server.module.clone();
        let metrics = Arc::new(MetricsRegistry::new());

        let mut jwt_config = JwtConfig::new(config.auth.jwt_secret.clone());
        jwt_config.issuer = config.auth.issuer.clone();
        jwt_config.token_ttl = chrono::Duration::minutes(config.auth.token_ttl_minutes);
        let jwt = Arc::new(JwtManager::new(jwt_config));

        let log = Arc::new(EventLog::open(config.event_log.to_log_config())?);
        let cache = Arc::new(Cache::new(CacheConfig::default()));

        let gateway = Arc::new(Gateway::new(
            module.clone(),
            config.realtime.to_gateway_config(),
            Arc::clone(&jwt),
            Arc::clone(&metrics),
        ));
        let mut gateways = GatewayDirectory::new();
        gateways.insert(Arc::clone(&gateway));

        let aggregator = ContextAggregator::new(
            Arc::new(config.module_directory()),
            client,
            Arc::clone(&cache),
            Arc::clone(&metrics),
        )
        .with_timeout(config.aggregation_timeout())
        .with_cache_ttl(config.aggregation_cache_ttl());

        let state = AppState {
            module,
            jwt,
            gateway,
            gateways: Arc::new(gateways),
            aggregator: Arc::new(aggregator),
            log,
            cache,
            metrics,
            started_at: Instant::now(),
        };
        Ok(Self { config, state })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn socket_addr(&self) -> String {
        self.config.server.socket_addr()
    }

    /// Full router: module routes under `/{module}` plus tracing and CORS
    pub fn router(&self) -> Router {
        let cors = if self.config.server.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = self
                .config
                .server
                .cors_origins
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        };

        Router::new()
            .nest(
                &format!("/{}", self.state.module),
                module_routes(self.state.clone()),
            )
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    /// Consumer pushing `{module}.events` to real-time subscribers
    fn relay_consumer(&self) -> StreamConsumer {
        let module = &self.state.module;
        let mut config = self.config.consumer.to_consumer_config(
            &self.state.events_stream(),
            RELAY_GROUP,
            &format!("{}-relay", module),
        );
        config.start = StartOffset::Latest;

        StreamConsumer::new(
            Arc::clone(&self.state.log),
            config,
            Arc::new(EventRelay::new(
                Arc::clone(&self.state.gateways),
                module.clone(),
            )),
        )
        .with_metrics(Arc::clone(&self.state.metrics))
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = self
            .socket_addr()
            .parse()
            .map_err(|_| ServerError::InvalidAddress(self.socket_addr()))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    ///
    /// On shutdown every WebSocket is closed with "going away" and the relay
    /// consumer is stopped before this returns.
    pub async fn serve_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let relay = Arc::new(self.relay_consumer()).spawn(stop_rx);

        let router = self.router();
        let gateways = Arc::clone(&self.state.gateways);
        let module = self.state.module.clone();

        info!(
            module = %module,
            addr = %listener.local_addr()?,
            "module server listening"
        );

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!(module = %module, "shutting down");
                gateways.close_all("server shutting down");
            })
            .await;

        let _ = stop_tx.send(true);
        let _ = relay.await;
        result.map_err(ServerError::from)
    }
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::StaticModuleClient;

    fn server(module: &str) -> ModuleServer {
        let mut config = AppConfig::default();
        config.server.module = module.into();
        ModuleServer::with_client(config, Arc::new(StaticModuleClient::new())).unwrap()
    }

    #[test]
    fn test_default_address_uses_module_port() {
        assert_eq!(server("mubot").socket_addr(), "0.0.0.0:5556");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = AppConfig::default();
        config.auth.jwt_secret.clear();
        assert!(matches!(
            ModuleServer::with_client(config, Arc::new(StaticModuleClient::new())),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_router_builds() {
        let server = server("finbot");
        let _router = server.router();
        assert_eq!(server.state().events_stream(), "finbot.events");
    }

    #[test]
    fn test_gateway_registered_in_directory() {
        let server = server("dese");
        let gateways = &server.state().gateways;
        assert_eq!(gateways.modules(), vec!["dese"]);
        assert!(Arc::ptr_eq(&gateways.get("dese").unwrap(), &server.state().gateway));
    }
}
