//! OpenAPI documentation for the `/api` surface, served by Scalar at `/api/docs`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::{api, db};

/// Session token accepted as a bearer token or in the session cookie.
struct SessionSecurityAddon;

impl Modify for SessionSecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "session_token".to_string(),
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some(
                            "Session token returned by `/auth/login`. Send it as\n\n\
                            ```\nAuthorization: Bearer YOUR_TOKEN\n```\n\n\
                            Browser clients get the same token in the session cookie.",
                        ))
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "PrintHub API",
        description = "Quotes, orders, payments, credits and bookings for a 3D printing shop"
    ),
    servers(
        (url = "/api", description = "PrintHub API")
    ),
    modifiers(&SessionSecurityAddon),
    paths(
        api::handlers::auth::register,
        api::handlers::auth::login,
        api::handlers::auth::logout,
        api::handlers::auth::refresh,
        api::handlers::auth::me,
        api::handlers::auth::request_password_reset,
        api::handlers::auth::confirm_password_reset,
        api::handlers::auth::change_password,
        api::handlers::uploads::upload_file,
        api::handlers::uploads::list_uploads,
        api::handlers::uploads::get_upload,
        api::handlers::uploads::delete_upload,
        api::handlers::pricing::estimate_price,
        api::handlers::materials::list_materials,
        api::handlers::materials::get_material,
        api::handlers::orders::create_order,
        api::handlers::orders::list_orders,
        api::handlers::orders::get_order,
        api::handlers::orders::update_order,
        api::handlers::orders::cancel_order,
        api::handlers::orders::list_shipping_options,
        api::handlers::payments::pay_order,
        api::handlers::payments::get_payment,
        api::handlers::payments::payment_notification,
        api::handlers::credits::get_balance,
        api::handlers::credits::list_transactions,
        api::handlers::credits::create_top_up,
        api::handlers::appointments::get_availability,
        api::handlers::appointments::book_appointment,
        api::handlers::appointments::list_appointments,
        api::handlers::appointments::update_appointment,
        api::handlers::appointments::cancel_appointment,
        api::handlers::design_requests::create_design_request,
        api::handlers::design_requests::list_design_requests,
        api::handlers::design_requests::get_design_request,
        api::handlers::design_requests::update_design_request,
        api::handlers::settings::get_public_settings,
        // Staff and admin
        api::handlers::materials::admin_list_materials,
        api::handlers::materials::create_material,
        api::handlers::materials::update_material,
        api::handlers::materials::delete_material,
        api::handlers::printers::list_printers,
        api::handlers::printers::get_printer,
        api::handlers::printers::create_printer,
        api::handlers::printers::update_printer,
        api::handlers::printers::delete_printer,
        api::handlers::settings::get_settings,
        api::handlers::settings::put_settings,
        api::handlers::users::list_users,
        api::handlers::users::get_user,
        api::handlers::users::update_user,
        api::handlers::users::delete_user,
        api::handlers::credits::create_adjustment,
        api::handlers::dashboard::get_dashboard,
    ),
    components(
        schemas(
            api::models::users::Role,
            db::models::orders::OrderStatus,
            db::models::orders::ShippingMethod,
            db::models::payments::PaymentMethod,
            db::models::payments::PaymentStatus,
            db::models::appointments::AppointmentKind,
            db::models::appointments::AppointmentStatus,
            db::models::design_requests::DesignRequestStatus,
            db::models::materials::MaterialKind,
            db::models::printers::PrinterStatus,
        )
    ),
    tags(
        (name = "authentication", description = "Registration, login and password management"),
        (name = "uploads", description = "3D model uploads and their measured geometry"),
        (name = "pricing", description = "Instant quotes"),
        (name = "materials", description = "Public material catalog"),
        (name = "orders", description = "Print orders and shipping"),
        (name = "payments", description = "BLIK, card and credits payments"),
        (name = "credits", description = "Prepaid shop credits"),
        (name = "appointments", description = "Consultation, pickup and design review bookings"),
        (name = "design-requests", description = "Custom design intake"),
        (name = "settings", description = "Storefront settings"),
        (name = "admin", description = "Catalog, fleet, users and shop configuration"),
    )
)]
pub struct ApiDoc;
