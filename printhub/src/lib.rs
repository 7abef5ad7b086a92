//! # printhub: backend for a 3D printing shop
//!
//! `printhub` takes a customer from an uploaded model to a finished print. Customers upload STL
//! (or other) model files, get an instant quote in a chosen material, place an order, and pay
//! with BLIK, a card, or prepaid shop credits. Staff move orders through production, run the
//! printer fleet, answer custom design requests and manage the appointment calendar.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum); everything is stored in PostgreSQL.
//! All endpoints live under `/api`, with interactive documentation at `/api/docs`.
//!
//! The **API layer** ([`api`]) holds the request handlers and their wire types. Handlers check
//! permissions through [`auth::permissions`] and talk to the database through the repositories in
//! [`db::handlers`], which each wrap a single `&mut PgConnection` so that several of them can share
//! one transaction.
//!
//! **Payments** go through a [`PaymentProvider`](payment_providers::PaymentProvider): PayU in
//! production, a dummy provider in development. Provider outcomes, whether they arrive as a signed
//! notification or are found by the reconciliation sweep, are applied by a single settlement
//! routine so that retries and duplicates are harmless.
//!
//! **Pricing** ([`pricing`]) turns a measured volume, an infill percentage and a material into a
//! price, using the cheapest printer that can take the job.
//!
//! **Background services** run alongside the server; today that is the payment reconciliation
//! sweep in [`reconciliation`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use printhub::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = printhub::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     printhub::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod email;
pub mod errors;
mod openapi;
pub mod payment_providers;
pub mod pricing;
mod reconciliation;
pub mod telemetry;
mod types;

#[cfg(test)]
pub mod test_utils;

use crate::{
    api::{handlers, models::users::Role},
    auth::password::{self, Argon2Params},
    config::{CatalogConfig, CorsOrigin},
    db::{
        handlers::{Materials, Printers, Repository, Settings, Users},
        models::{
            materials::MaterialCreateDBRequest,
            printers::{PrinterCreateDBRequest, PrinterStatus},
            settings::CATALOG_SEEDED_KEY,
            users::UserCreateDBRequest,
        },
    },
    email::EmailService,
    openapi::ApiDoc,
    payment_providers::PaymentProvider,
};
use axum::{
    Json, Router, ServiceExt,
    extract::{DefaultBodyLimit, Request},
    http::{self, HeaderValue},
    routing::{get, patch, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower::Layer;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    normalize_path::{NormalizePath, NormalizePathLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use types::{MaterialId, OrderId, PaymentId, PrinterId, UserId};

/// Multipart framing allowance on top of `uploads.max_file_size`
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .db(pool)
///     .config(config)
///     .maybe_payment_provider(provider)
///     .email(Arc::new(email))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    /// Unset when no payment provider is configured; only credits payments work then
    pub payment_provider: Option<Arc<dyn PaymentProvider>>,
    pub email: Arc<EmailService>,
}

/// Get the printhub database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Create the bootstrap admin user if it doesn't exist.
///
/// Idempotent: an existing account keeps its data, but its password is reset when one is given.
/// Returns the admin's user id.
#[instrument(skip_all)]
pub async fn create_initial_admin_user(
    email: &str,
    password: Option<&str>,
    params: Argon2Params,
    db: &PgPool,
) -> Result<UserId, sqlx::Error> {
    let password_hash = match password {
        Some(pwd) => Some(
            password::hash_string_with_params(pwd, Some(params))
                .map_err(|e| sqlx::Error::Encode(format!("Failed to hash admin password: {e}").into()))?,
        ),
        None => None,
    };

    let mut tx = db.begin().await?;
    let mut user_repo = Users::new(&mut tx);

    if let Some(existing_user) = user_repo
        .get_user_by_email(email)
        .await
        .map_err(|e| sqlx::Error::Protocol(format!("Failed to check existing user: {e}")))?
    {
        if let Some(password_hash) = password_hash {
            sqlx::query("UPDATE users SET password_hash = $1, updated_at = NOW() WHERE id = $2")
                .bind(password_hash)
                .bind(existing_user.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        return Ok(existing_user.id);
    }

    let created_user = user_repo
        .create(&UserCreateDBRequest {
            email: email.to_string(),
            display_name: None,
            phone: None,
            is_admin: true,
            roles: vec![Role::Customer, Role::ShopAdmin],
            auth_source: "system".to_string(),
            password_hash,
        })
        .await
        .map_err(|e| sqlx::Error::Protocol(format!("Failed to create admin user: {e}")))?;

    tx.commit().await?;
    info!("Created bootstrap admin user {}", email);
    Ok(created_user.id)
}

/// Seed the catalog with the configured materials and printers (run only once).
///
/// The `catalog_seeded` settings key is set in the same transaction, so later edits to the
/// catalog are never overwritten by a restart.
#[instrument(skip_all)]
pub async fn seed_database(catalog: &CatalogConfig, db: &PgPool) -> Result<(), anyhow::Error> {
    let mut tx = db.begin().await?;

    if !Settings::new(&mut tx).put_if_absent(CATALOG_SEEDED_KEY, &true).await? {
        info!("Catalog already seeded, skipping seeding operations");
        tx.commit().await?;
        return Ok(());
    }

    info!(
        "Seeding catalog with {} materials and {} printers",
        catalog.materials.len(),
        catalog.printers.len()
    );

    let mut materials = Materials::new(&mut tx);
    for material in &catalog.materials {
        materials
            .create(&MaterialCreateDBRequest {
                name: material.name.clone(),
                kind: material.kind,
                description: material.description.clone(),
                density_g_cm3: material.density_g_cm3,
                price_per_gram: material.price_per_gram,
                colors: material.colors.clone(),
                available: true,
            })
            .await?;
    }

    let mut printers = Printers::new(&mut tx);
    for printer in &catalog.printers {
        printers
            .create(&PrinterCreateDBRequest {
                name: printer.name.clone(),
                model: printer.model.clone(),
                status: PrinterStatus::Idle,
                hourly_rate: printer.hourly_rate,
                throughput_g_per_hour: printer.throughput_g_per_hour,
                build_x_mm: printer.build_x_mm,
                build_y_mm: printer.build_y_mm,
                build_z_mm: printer.build_z_mm,
                supported_kinds: printer.supported_kinds.clone(),
                notes: None,
            })
            .await?;
    }

    tx.commit().await?;
    debug!("Catalog seeded successfully");
    Ok(())
}

/// Connect to the database, run migrations, and bootstrap the admin user and catalog
async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    let pool_settings = &config.database.pool;
    let pool = PgPoolOptions::new()
        .max_connections(pool_settings.max_connections)
        .min_connections(pool_settings.min_connections)
        .acquire_timeout(pool_settings.acquire_timeout)
        .connect(&config.database.url)
        .await?;
    migrator().run(&pool).await?;

    create_initial_admin_user(
        &config.admin_email,
        config.admin_password.as_deref(),
        Argon2Params::from(&config.auth.native.password),
        &pool,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to create initial admin user: {}", e))?;

    seed_database(&config.catalog, &pool).await?;

    Ok(pool)
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors_config = &config.auth.security.cors;
    let allow_origin = if cors_config.allowed_origins.iter().any(|o| matches!(o, CorsOrigin::Wildcard)) {
        if cors_config.allow_credentials {
            anyhow::bail!("CORS wildcard origin cannot be combined with allow_credentials");
        }
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &cors_config.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                origins.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(config.auth.security.cors.allow_credentials)
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::PATCH,
            http::Method::DELETE,
        ])
        .allow_headers([http::header::AUTHORIZATION, http::header::CONTENT_TYPE])
        .expose_headers(vec![http::header::LOCATION]);

    if let Some(max_age) = config.auth.security.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router.
///
/// Every endpoint is nested under `/api`; `/healthz` and the optional `/internal/metrics` sit at
/// the root. CORS and request tracing wrap the whole router.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    // Uploads get their own body limit; everything else keeps axum's default
    let upload_limit = usize::try_from(state.config.uploads.max_file_size)?.saturating_add(MULTIPART_OVERHEAD_BYTES);
    let upload_routes = Router::new().route(
        "/uploads",
        post(handlers::uploads::upload_file)
            .get(handlers::uploads::list_uploads)
            .layer(DefaultBodyLimit::max(upload_limit)),
    );

    let api_routes = Router::new()
        // Authentication
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/me", get(handlers::auth::me))
        .route("/auth/password-resets", post(handlers::auth::request_password_reset))
        .route(
            "/auth/password-resets/{token_id}/confirm",
            post(handlers::auth::confirm_password_reset),
        )
        .route("/auth/password-change", post(handlers::auth::change_password))
        // Uploads and quotes
        .merge(upload_routes)
        .route(
            "/uploads/{id}",
            get(handlers::uploads::get_upload).delete(handlers::uploads::delete_upload),
        )
        .route("/pricing/estimate", post(handlers::pricing::estimate_price))
        .route("/materials", get(handlers::materials::list_materials))
        .route("/materials/{id}", get(handlers::materials::get_material))
        // Orders and payments
        .route("/orders", get(handlers::orders::list_orders).post(handlers::orders::create_order))
        .route("/orders/{id}", get(handlers::orders::get_order).patch(handlers::orders::update_order))
        .route("/orders/{id}/cancel", post(handlers::orders::cancel_order))
        .route("/orders/{id}/payments", post(handlers::payments::pay_order))
        .route("/shipping/options", get(handlers::orders::list_shipping_options))
        .route("/payments/notify", post(handlers::payments::payment_notification))
        .route("/payments/{id}", get(handlers::payments::get_payment))
        // Credits
        .route("/credits/balance", get(handlers::credits::get_balance))
        .route("/credits/transactions", get(handlers::credits::list_transactions))
        .route("/credits/top-ups", post(handlers::credits::create_top_up))
        // Appointments and design requests
        .route(
            "/appointments",
            get(handlers::appointments::list_appointments).post(handlers::appointments::book_appointment),
        )
        .route("/appointments/availability", get(handlers::appointments::get_availability))
        .route("/appointments/{id}", patch(handlers::appointments::update_appointment))
        .route("/appointments/{id}/cancel", post(handlers::appointments::cancel_appointment))
        .route(
            "/design-requests",
            get(handlers::design_requests::list_design_requests).post(handlers::design_requests::create_design_request),
        )
        .route(
            "/design-requests/{id}",
            get(handlers::design_requests::get_design_request).patch(handlers::design_requests::update_design_request),
        )
        .route("/settings/public", get(handlers::settings::get_public_settings))
        // Staff and admin
        .route(
            "/admin/materials",
            get(handlers::materials::admin_list_materials).post(handlers::materials::create_material),
        )
        .route(
            "/admin/materials/{id}",
            patch(handlers::materials::update_material).delete(handlers::materials::delete_material),
        )
        .route(
            "/admin/printers",
            get(handlers::printers::list_printers).post(handlers::printers::create_printer),
        )
        .route(
            "/admin/printers/{id}",
            get(handlers::printers::get_printer)
                .patch(handlers::printers::update_printer)
                .delete(handlers::printers::delete_printer),
        )
        .route(
            "/admin/settings",
            get(handlers::settings::get_settings).put(handlers::settings::put_settings),
        )
        .route("/admin/users", get(handlers::users::list_users))
        .route(
            "/admin/users/{id}",
            get(handlers::users::get_user)
                .patch(handlers::users::update_user)
                .delete(handlers::users::delete_user),
        )
        .route("/admin/credits/adjustments", post(handlers::credits::create_adjustment))
        .route("/admin/dashboard", get(handlers::dashboard::get_dashboard))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state.clone());

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .nest("/api", api_routes)
        .merge(Scalar::with_url("/api/docs", ApiDoc::openapi()));

    let cors_layer = create_cors_layer(&state.config)?;
    let mut router = router.layer(cors_layer);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Wrap the router so that `/api/orders/` and `/api/orders` route the same way.
///
/// Path normalisation has to run before routing, so it wraps the router instead of being a route layer.
fn normalize_paths(router: Router) -> NormalizePath<Router> {
    NormalizePathLayer::trim_trailing_slash().layer(router)
}

/// Background tasks running alongside the HTTP server.
///
/// [`shutdown`](BackgroundServices::shutdown) stops them and waits for them to finish. Dropping
/// the struct cancels the shutdown token through `drop_guard`.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

fn setup_background_services(state: &AppState, shutdown_token: CancellationToken) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    let reconciliation = &state.config.background_services.reconciliation;
    if !reconciliation.enabled {
        info!("Payment reconciliation disabled by configuration");
    } else if state.payment_provider.is_none() {
        info!("No payment provider configured, skipping payment reconciliation");
    } else {
        let task_state = state.clone();
        let task_shutdown = shutdown_token.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = reconciliation::run_reconciliation(task_state, task_shutdown).await {
                tracing::error!("Payment reconciliation stopped: {:#}", e);
            }
        });
        background_tasks.push(handle);
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// The assembled server.
///
/// 1. **Create**: [`Application::new`] connects to the database, runs migrations, bootstraps the
///    admin user and catalog, and starts background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: When the shutdown signal is received, gracefully stops all services
pub struct Application {
    router: Router,
    config: Config,
    pool: PgPool,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting printhub with configuration: {:#?}", config);

        let pool = setup_database(&config).await?;

        let payment_provider = config.payment.clone().map(payment_providers::create_provider).transpose()?;
        match &payment_provider {
            Some(provider) => info!("Payment provider: {}", provider.name()),
            None => info!("No payment provider configured; only credits payments are available"),
        }
        let email = EmailService::new(&config.email, &config.public_url)?;

        let app_state = AppState::builder()
            .db(pool.clone())
            .config(config.clone())
            .maybe_payment_provider(payment_provider)
            .email(Arc::new(email))
            .build();

        let bg_services = setup_background_services(&app_state, CancellationToken::new());
        let router = build_router(&app_state)?;

        Ok(Self {
            router,
            config,
            pool,
            bg_services,
        })
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "printhub listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        let service = normalize_paths(self.router);
        axum::serve(listener, ServiceExt::<Request>::into_make_service(service))
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.pool.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
