use patronpay_backend::api::admin::{flag_fines_updated, resolve_transaction};
use patronpay_backend::api::callbacks::{handle_notify, handle_return};
use patronpay_backend::api::payments::{preview_fines, start_payment, PaymentApiState};
use patronpay_backend::config::AppConfig;
use patronpay_backend::database::store::TransactionStore;
use patronpay_backend::database::transaction_repository::TransactionRepository;
use patronpay_backend::database;
use patronpay_backend::health::HealthChecker;
use patronpay_backend::ils::{IlsConnector, IlsHttpClient};
use patronpay_backend::logging::init_tracing;
use patronpay_backend::middleware::logging::{request_logging_middleware, UuidRequestId};
use patronpay_backend::payments::factory::GatewayFactory;
use patronpay_backend::payments::gateway::GatewayAdapter;
use patronpay_backend::services::notification::NotificationService;
use patronpay_backend::services::orchestrator::{OrchestratorConfig, PaymentOrchestrator};
use patronpay_backend::services::payment_guard::PaymentGuard;
use patronpay_backend::workers::registration_reconciler::{
    ReconcilerConfig, RegistrationReconcilerWorker,
};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn health_handler(State(checker): State<HealthChecker>) -> Json<serde_json::Value> {
    let status = checker.check_health().await;
    Json(serde_json::json!({
        "healthy": status.is_healthy(),
        "status": status,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    config.validate()?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        "🚀 Starting patronpay backend service"
    );

    // Database pool
    info!("📊 Initializing database connection pool...");
    let db_pool = database::init_pool_from_config(&config.database)
        .await
        .map_err(|e| {
            error!("Failed to initialize database pool: {}", e);
            anyhow::anyhow!(e)
        })?;
    info!("✅ Database connection pool initialized");

    let store: Arc<dyn TransactionStore> = Arc::new(TransactionRepository::new(db_pool.clone()));

    // Gateway adapters. Missing provider configuration is fatal here, not
    // at first payment.
    info!("💳 Initializing payment gateways...");
    let factory = GatewayFactory::from_env().map_err(|e| {
        error!("Failed to initialize payment gateway factory: {}", e);
        anyhow::anyhow!(e.to_string())
    })?;
    let mut gateways: Vec<Arc<dyn GatewayAdapter>> = Vec::new();
    for name in factory.list_enabled_gateways() {
        let adapter = factory.get_gateway(name).map_err(|e| {
            error!(gateway = %name, "Failed to initialize gateway: {}", e);
            anyhow::anyhow!(e.to_string())
        })?;
        gateways.push(Arc::from(adapter));
    }
    let default_gateway = factory.default_gateway();
    let driver_gateways: HashMap<String, patronpay_backend::payments::types::GatewayName> =
        factory.driver_overrides().clone();
    info!(gateways = gateways.len(), "✅ Payment gateways initialized");

    // ILS connector
    info!("📚 Initializing ILS connector...");
    let ils: Arc<dyn IlsConnector> = Arc::new(IlsHttpClient::from_env().map_err(|e| {
        error!("Failed to initialize ILS connector: {}", e);
        anyhow::anyhow!(e.to_string())
    })?);
    info!("✅ ILS connector initialized");

    // Orchestrator
    let guard = Arc::new(PaymentGuard::new(Arc::clone(&store)));
    let base = config.server.public_base_url.trim_end_matches('/');
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        gateways,
        driver_gateways,
        default_gateway,
        Arc::clone(&store),
        guard,
        Arc::clone(&ils),
        OrchestratorConfig {
            stale_after: Duration::from_secs(config.payment.stale_after_secs),
            transaction_fee: config.payment.transaction_fee,
            minimum_payment: config.payment.minimum_payment,
            currency: config.payment.currency.clone(),
            return_base_url: format!(
                "{}/api/payments/callback/{}/return",
                base, default_gateway
            ),
            notify_base_url: format!(
                "{}/api/payments/callback/{}/notify",
                base, default_gateway
            ),
        },
    ));

    // Registration reconciler worker
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let reconciler_enabled = std::env::var("RECONCILER_ENABLED")
        .unwrap_or_else(|_| "true".to_string())
        .to_lowercase()
        != "false";
    let mut reconciler_handle = None;
    if reconciler_enabled {
        let reconciler_config = ReconcilerConfig::from_env();
        info!(
            poll_interval_secs = reconciler_config.poll_interval.as_secs(),
            minimum_paid_age_secs = reconciler_config.minimum_paid_age.as_secs(),
            "Starting registration reconciler worker"
        );
        let worker = RegistrationReconcilerWorker::new(
            Arc::clone(&store),
            Arc::clone(&ils),
            Arc::new(NotificationService::new()),
            reconciler_config,
        );
        reconciler_handle = Some(tokio::spawn(worker.run(worker_shutdown_rx)));
    } else {
        info!("Registration reconciler worker disabled (RECONCILER_ENABLED=false)");
    }

    // Routes
    let api_state = Arc::new(PaymentApiState {
        orchestrator: Arc::clone(&orchestrator),
    });
    let payment_routes = Router::new()
        .route("/api/fines/preview", post(preview_fines))
        .route("/api/payments", post(start_payment))
        .route(
            "/api/payments/callback/{gateway}/return",
            get(handle_return).post(handle_return),
        )
        .route(
            "/api/payments/callback/{gateway}/notify",
            get(handle_notify).post(handle_notify),
        )
        .route(
            "/api/admin/transactions/{transaction_id}/resolve",
            post(resolve_transaction),
        )
        .route(
            "/api/admin/transactions/{transaction_id}/flag-fines-updated",
            post(flag_fines_updated),
        )
        .with_state(api_state);

    let health_checker = HealthChecker::new(db_pool.clone());
    let health_routes = Router::new()
        .route("/health", get(health_handler))
        .with_state(health_checker);

    let app = Router::new()
        .merge(payment_routes)
        .merge(health_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(axum::middleware::from_fn(request_logging_middleware)),
        );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!(addr = %addr, "🌐 Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the worker after the HTTP server drained.
    let _ = worker_shutdown_tx.send(true);
    if let Some(handle) = reconciler_handle {
        let _ = handle.await;
    }
    info!("👋 patronpay backend stopped");

    Ok(())
}
