//! Shared fixtures for unit and handler tests.

use std::sync::Arc;

use axum_test::TestServer;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    AppState,
    api::models::users::{CurrentUser, Role},
    auth::{password::Argon2Params, session},
    config::{
        Config, DummyConfig, EmailConfig, EmailTransportConfig, NativeAuthConfig, PasswordConfig, PayUConfig, PaymentConfig,
        ReconciliationConfig, SessionConfig, UploadsConfig,
    },
    db::{
        handlers::{Files, Materials, Orders, Repository, Users},
        models::{
            files::{UploadedFileCreateDBRequest, UploadedFileDBResponse},
            materials::{MaterialCreateDBRequest, MaterialDBResponse, MaterialKind},
            orders::{OrderCreateDBRequest, OrderDBResponse, ShippingMethod},
            users::{UserCreateDBRequest, UserDBResponse},
        },
    },
    email::EmailService,
    payment_providers::create_provider,
    types::UserId,
};

pub const TEST_WEBHOOK_SECRET: &str = "test-webhook-secret";
pub const TEST_PAYU_SECOND_KEY: &str = "b6ca15b0d1020e8094d9b5f8d163db54";

/// Argon2 parameters cheap enough for tests
pub fn fast_argon2_params() -> Argon2Params {
    Argon2Params {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}

pub fn create_test_config() -> Config {
    // Per-process scratch directories for emails and uploads
    let scratch = std::env::temp_dir().join(format!("printhub-test-{}", std::process::id()));

    Config {
        secret_key: Some("test-secret-key-for-testing-only".to_string()),
        admin_email: "admin@test.com".to_string(),
        public_url: "http://shop.test".to_string(),
        api_base_url: "http://api.test".to_string(),
        auth: crate::config::AuthConfig {
            native: NativeAuthConfig {
                enabled: true,
                allow_registration: true,
                password: PasswordConfig {
                    argon2_memory_kib: 1024,
                    argon2_iterations: 1,
                    ..Default::default()
                },
                session: SessionConfig {
                    cookie_secure: false,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        },
        payment: Some(PaymentConfig::Dummy(DummyConfig {
            webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
            complete_immediately: false,
        })),
        email: EmailConfig {
            transport: EmailTransportConfig::File {
                path: scratch.join("emails").to_string_lossy().to_string(),
            },
            shop_notification_email: Some("shop@test.com".to_string()),
            ..Default::default()
        },
        uploads: UploadsConfig {
            directory: scratch.join("uploads"),
            ..Default::default()
        },
        background_services: crate::config::BackgroundServicesConfig {
            reconciliation: ReconciliationConfig {
                enabled: false,
                ..Default::default()
            },
        },
        ..Default::default()
    }
}

/// Test config talking to a PayU stand-in at `base_url`
pub fn create_payu_test_config(base_url: &str) -> Config {
    Config {
        payment: Some(PaymentConfig::Payu(PayUConfig {
            base_url: url::Url::parse(base_url).expect("Invalid PayU base url"),
            pos_id: "300746".to_string(),
            client_id: "300746".to_string(),
            client_secret: "2ee86a66e5d97e3fadc400c9f19b065d".to_string(),
            second_key: TEST_PAYU_SECOND_KEY.to_string(),
            currency: "PLN".to_string(),
            auto_capture: false,
            request_timeout: std::time::Duration::from_secs(5),
            language: "pl".to_string(),
        })),
        ..create_test_config()
    }
}

pub fn create_test_state(pool: PgPool, config: Config) -> AppState {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let payment_provider = config
        .payment
        .clone()
        .map(|p| create_provider(p).expect("Failed to create payment provider"));
    let email = EmailService::new(&config.email, &config.public_url).expect("Failed to create email service");

    AppState::builder()
        .db(pool)
        .config(config)
        .maybe_payment_provider(payment_provider)
        .email(Arc::new(email))
        .build()
}

/// Router over a fresh state, wrapped in a test server
pub fn create_test_server(state: AppState) -> TestServer {
    let router = crate::build_router(&state).expect("Failed to build router");
    TestServer::new(router).expect("Failed to create test server")
}

pub async fn create_test_app(pool: PgPool) -> (TestServer, AppState) {
    let state = create_test_state(pool, create_test_config());
    (create_test_server(state.clone()), state)
}

pub async fn create_test_user(pool: &PgPool, role: Role) -> UserDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let id = Uuid::new_v4();

    let mut roles = vec![Role::Customer];
    if role != Role::Customer {
        roles.push(role);
    }

    Users::new(&mut conn)
        .create(&UserCreateDBRequest {
            email: format!("user_{}@example.com", id.simple()),
            display_name: Some("Test User".to_string()),
            phone: None,
            is_admin: false,
            roles,
            auth_source: "test".to_string(),
            password_hash: None,
        })
        .await
        .expect("Failed to create test user")
}

pub async fn create_test_admin_user(pool: &PgPool) -> UserDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let id = Uuid::new_v4();
    Users::new(&mut conn)
        .create(&UserCreateDBRequest {
            email: format!("admin_{}@example.com", id.simple()),
            display_name: Some("Test Admin".to_string()),
            phone: None,
            is_admin: true,
            roles: vec![Role::Customer, Role::ShopAdmin],
            auth_source: "test".to_string(),
            password_hash: None,
        })
        .await
        .expect("Failed to create test admin")
}

/// `Authorization` header value for a user
pub fn bearer_for(state: &AppState, user: &UserDBResponse) -> String {
    let current = CurrentUser::from(user.clone());
    let token = session::create_session_token(&current, &state.config).expect("Failed to create session token");
    format!("Bearer {token}")
}

pub async fn create_test_material(pool: &PgPool) -> MaterialDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    Materials::new(&mut conn)
        .create(&MaterialCreateDBRequest {
            name: format!("PLA {}", Uuid::new_v4().simple()),
            kind: MaterialKind::Pla,
            description: None,
            density_g_cm3: Decimal::new(124, 2),
            price_per_gram: Decimal::new(10, 2),
            colors: vec!["black".to_string(), "white".to_string()],
            available: true,
        })
        .await
        .expect("Failed to create test material")
}

/// Upload row for a 12.5 cm³ model that fits any printer
pub async fn create_test_upload(pool: &PgPool, user_id: Option<UserId>) -> UploadedFileDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let id = Uuid::new_v4();
    Files::new(&mut conn)
        .create(&UploadedFileCreateDBRequest {
            id,
            user_id,
            original_name: "bracket.stl".to_string(),
            storage_path: format!("/tmp/{id}.stl"),
            content_type: Some("model/stl".to_string()),
            size_bytes: 684,
            volume_cm3: Some(Decimal::new(12500, 3)),
            bbox_mm: Some([Decimal::new(50, 0), Decimal::new(25, 0), Decimal::new(10, 0)]),
            triangle_count: Some(12),
        })
        .await
        .expect("Failed to create test upload")
}

/// Order awaiting payment, for 42.99 PLN, picked up at the shop
pub async fn create_test_order(pool: &PgPool, user_id: Option<UserId>) -> OrderDBResponse {
    let material = create_test_material(pool).await;
    let file = create_test_upload(pool, user_id).await;
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    Orders::new(&mut conn)
        .create(&OrderCreateDBRequest {
            user_id,
            customer_name: "Jan Kowalski".to_string(),
            customer_email: "jan@example.com".to_string(),
            customer_phone: None,
            material_id: material.id,
            printer_id: None,
            color: Some("black".to_string()),
            infill_percent: 20,
            quantity: 1,
            file_ids: vec![file.id],
            volume_cm3: Decimal::new(12500, 3),
            weight_g: Decimal::new(1550, 2),
            print_hours: Decimal::new(125, 2),
            subtotal: Decimal::new(4299, 2),
            shipping_cost: Decimal::ZERO,
            total: Decimal::new(4299, 2),
            currency: "PLN".to_string(),
            shipping_method: ShippingMethod::Pickup,
            shipping_address: None,
            notes: None,
        })
        .await
        .expect("Failed to create test order")
}
