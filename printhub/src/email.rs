//! Email notifications: order and payment confirmations, bookings, design requests and
//! password resets.
//!
//! Messages are rendered from the HTML templates in `templates/email`, compiled into the binary.
//! Delivery goes through SMTP or a directory of `.eml` files (lettre), or the Resend HTTP API.

use chrono::{DateTime, FixedOffset, Utc};
use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use minijinja::{Environment, Value, context};
use rust_decimal::Decimal;
use serde::Serialize;
use std::{path::Path, time::Duration};
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use crate::{
    config::{EmailConfig, EmailTransportConfig},
    db::models::{
        appointments::{AppointmentDBResponse, AppointmentKind},
        design_requests::DesignRequestDBResponse,
        orders::{OrderDBResponse, ShippingMethod},
    },
    errors::Error,
};

const TEMPLATES: [(&str, &str); 6] = [
    ("base.html", include_str!("../templates/email/base.html")),
    ("order_confirmation.html", include_str!("../templates/email/order_confirmation.html")),
    ("payment_received.html", include_str!("../templates/email/payment_received.html")),
    (
        "appointment_confirmation.html",
        include_str!("../templates/email/appointment_confirmation.html"),
    ),
    (
        "design_request_notification.html",
        include_str!("../templates/email/design_request_notification.html"),
    ),
    ("password_reset.html", include_str!("../templates/email/password_reset.html")),
];

pub struct EmailService {
    transport: EmailTransport,
    from: Mailbox,
    reply_to: Option<Mailbox>,
    shop_name: String,
    shop_notification_email: Option<String>,
    public_url: String,
    templates: Environment<'static>,
}

enum EmailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
    Resend {
        http: reqwest::Client,
        api_key: String,
        base_url: Url,
    },
}

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: String,
    to: Vec<String>,
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
}

fn parse_mailbox(email: &str, name: Option<&str>) -> Result<Mailbox, Error> {
    match name {
        Some(name) if !name.trim().is_empty() => format!("{} <{}>", name.trim(), email),
        _ => email.to_string(),
    }
    .parse::<Mailbox>()
    .map_err(|e| Error::Internal {
        operation: format!("parse email address: {e}"),
    })
}

fn appointment_kind_label(kind: AppointmentKind) -> &'static str {
    match kind {
        AppointmentKind::Consultation => "consultation",
        AppointmentKind::Pickup => "order pickup",
        AppointmentKind::DesignReview => "design review",
    }
}

fn shipping_label(method: ShippingMethod) -> &'static str {
    match method {
        ShippingMethod::Pickup => "pickup at the shop",
        ShippingMethod::InpostLocker => "InPost locker",
        ShippingMethod::DpdCourier => "DPD courier",
    }
}

impl EmailService {
    pub fn new(config: &EmailConfig, public_url: &str) -> Result<Self, Error> {
        let transport = match &config.transport {
            EmailTransportConfig::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    tracing::warn!("SMTP TLS is disabled - this is not recommended for production");
                }

                let smtp_builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                } else {
                    Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
                }
                .map_err(|e| Error::Internal {
                    operation: format!("create SMTP transport: {e}"),
                })?
                .port(*port)
                .credentials(Credentials::new(username.clone(), password.clone()));

                EmailTransport::Smtp(smtp_builder.build())
            }
            EmailTransportConfig::File { path } => {
                let emails_dir = Path::new(path);
                if !emails_dir.exists() {
                    std::fs::create_dir_all(emails_dir).map_err(|e| Error::Internal {
                        operation: format!("create emails directory: {e}"),
                    })?;
                }
                EmailTransport::File(AsyncFileTransport::<Tokio1Executor>::new(emails_dir))
            }
            EmailTransportConfig::Resend { api_key, base_url } => {
                let http = reqwest::Client::builder()
                    .timeout(Duration::from_secs(15))
                    .build()
                    .map_err(|e| Error::Internal {
                        operation: format!("create Resend client: {e}"),
                    })?;
                EmailTransport::Resend {
                    http,
                    api_key: api_key.clone(),
                    base_url: base_url.clone(),
                }
            }
        };

        let mut templates = Environment::new();
        for (name, source) in TEMPLATES {
            templates
                .add_template(name, source)
                .map_err(|e| Error::Internal {
                    operation: format!("load email template: {e}"),
                })?;
        }

        Ok(Self {
            transport,
            from: parse_mailbox(&config.from_email, Some(&config.from_name))?,
            reply_to: config.reply_to.as_deref().map(|r| parse_mailbox(r, None)).transpose()?,
            shop_name: config.from_name.clone(),
            shop_notification_email: config.shop_notification_email.clone(),
            public_url: public_url.trim_end_matches('/').to_string(),
            templates,
        })
    }

    fn render(&self, template: &str, ctx: Value) -> Result<String, Error> {
        let ctx = context! { shop_name => &self.shop_name, ..ctx };
        self.templates
            .get_template(template)
            .and_then(|t| t.render(ctx))
            .map_err(|e| Error::Internal {
                operation: format!("render email template: {e}"),
            })
    }

    #[instrument(skip(self, order), fields(order_number = order.number), err)]
    pub async fn send_order_confirmation(&self, order: &OrderDBResponse, material_name: &str) -> Result<(), Error> {
        let body = self.render(
            "order_confirmation.html",
            context! {
                customer_name => &order.customer_name,
                order_number => order.number,
                material => material_name,
                color => &order.color,
                quantity => order.quantity,
                infill_percent => order.infill_percent,
                weight_g => order.weight_g.to_string(),
                subtotal => order.subtotal.to_string(),
                shipping_method => shipping_label(order.shipping_method),
                shipping_cost => order.shipping_cost.to_string(),
                total => order.total.to_string(),
                currency => &order.currency,
                order_url => format!("{}/orders/{}", self.public_url, order.id),
            },
        )?;

        let to = parse_mailbox(&order.customer_email, Some(&order.customer_name))?;
        self.send(to, &format!("Order #{} received", order.number), body).await
    }

    /// `description` completes "for ...", e.g. "order #12" or "a credits top-up".
    #[instrument(skip(self, to_email, to_name), err)]
    pub async fn send_payment_received(
        &self,
        to_email: &str,
        to_name: Option<&str>,
        amount: Decimal,
        currency: &str,
        description: &str,
        link_path: Option<&str>,
    ) -> Result<(), Error> {
        let body = self.render(
            "payment_received.html",
            context! {
                name => to_name,
                amount => amount.to_string(),
                currency => currency,
                description => description,
                link => link_path.map(|p| format!("{}{}", self.public_url, p)),
            },
        )?;

        self.send(parse_mailbox(to_email, to_name)?, "Payment received", body).await
    }

    #[instrument(skip(self, appointment), err)]
    pub async fn send_appointment_confirmation(&self, appointment: &AppointmentDBResponse, utc_offset_minutes: i32) -> Result<(), Error> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| Error::Internal {
            operation: format!("apply UTC offset of {utc_offset_minutes} minutes"),
        })?;
        let local = |t: DateTime<Utc>| t.with_timezone(&offset);
        let starts = local(appointment.starts_at);

        let body = self.render(
            "appointment_confirmation.html",
            context! {
                name => &appointment.name,
                kind => appointment_kind_label(appointment.kind),
                date => starts.format("%A, %d %B %Y").to_string(),
                start_time => starts.format("%H:%M").to_string(),
                end_time => local(appointment.ends_at).format("%H:%M").to_string(),
                notes => &appointment.notes,
            },
        )?;

        let to = parse_mailbox(&appointment.email, Some(&appointment.name))?;
        self.send(to, "Your appointment is booked", body).await
    }

    /// Tell the shop about a new design request. Skipped when no notification address is set.
    #[instrument(skip(self, request), err)]
    pub async fn send_design_request_notification(&self, request: &DesignRequestDBResponse, currency: &str) -> Result<(), Error> {
        let Some(shop_email) = &self.shop_notification_email else {
            debug!("No shop notification address configured, skipping design request email");
            return Ok(());
        };

        let body = self.render(
            "design_request_notification.html",
            context! {
                title => &request.title,
                name => &request.name,
                email => &request.email,
                phone => &request.phone,
                budget => request.budget.map(|b| b.to_string()),
                currency => currency,
                deadline => request.deadline.map(|d| d.to_string()),
                attachment_count => request.attachment_ids.len(),
                description => &request.description,
                admin_url => format!("{}/admin/design-requests/{}", self.public_url, request.id),
            },
        )?;

        let to = parse_mailbox(shop_email, None)?;
        self.send(to, &format!("New design request: {}", request.title), body).await
    }

    #[instrument(skip(self, to_email, to_name, token), err)]
    pub async fn send_password_reset(
        &self,
        to_email: &str,
        to_name: Option<&str>,
        token_id: &Uuid,
        token: &str,
        valid_for: Duration,
    ) -> Result<(), Error> {
        let reset_link = format!("{}/reset-password?id={}&token={}", self.public_url, token_id, token);
        let body = self.render(
            "password_reset.html",
            context! {
                name => to_name,
                reset_link => reset_link,
                expires_minutes => valid_for.as_secs() / 60,
            },
        )?;

        self.send(parse_mailbox(to_email, to_name)?, "Password Reset Request", body).await
    }

    async fn send(&self, to: Mailbox, subject: &str, body: String) -> Result<(), Error> {
        match &self.transport {
            EmailTransport::Smtp(smtp) => {
                smtp.send(self.build_message(to, subject, body)?)
                    .await
                    .map_err(|e| Error::Internal {
                        operation: format!("send SMTP email: {e}"),
                    })?;
            }
            EmailTransport::File(file) => {
                file.send(self.build_message(to, subject, body)?)
                    .await
                    .map_err(|e| Error::Internal {
                        operation: format!("send file email: {e}"),
                    })?;
            }
            EmailTransport::Resend { http, api_key, base_url } => {
                let url = base_url
                    .join("emails")
                    .map_err(|e| Error::Internal {
                        operation: format!("build Resend URL: {e}"),
                    })?;
                let payload = ResendEmail {
                    from: self.from.to_string(),
                    to: vec![to.to_string()],
                    subject,
                    html: &body,
                    reply_to: self.reply_to.as_ref().map(|r| r.to_string()),
                };

                let response = http
                    .post(url)
                    .bearer_auth(api_key)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| Error::Internal {
                        operation: format!("send Resend email: {e}"),
                    })?;

                if !response.status().is_success() {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    return Err(Error::Internal {
                        operation: format!("send Resend email: {status} {text}"),
                    });
                }
            }
        }

        debug!(subject, "Email sent");
        Ok(())
    }

    fn build_message(&self, to: Mailbox, subject: &str, body: String) -> Result<Message, Error> {
        let mut builder = Message::builder().from(self.from.clone()).to(to).subject(subject);
        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(reply_to.clone());
        }
        builder
            .header(ContentType::TEXT_HTML)
            .body(body)
            .map_err(|e| Error::Internal {
                operation: format!("build email message: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    fn file_config(dir: &Path) -> EmailConfig {
        EmailConfig {
            transport: EmailTransportConfig::File {
                path: dir.to_string_lossy().to_string(),
            },
            shop_notification_email: Some("shop@printhub.local".to_string()),
            ..Default::default()
        }
    }

    fn eml_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "eml"))
            .map(|e| std::fs::read_to_string(e.path()).unwrap())
            .collect()
    }

    fn appointment() -> AppointmentDBResponse {
        AppointmentDBResponse {
            id: Uuid::new_v4(),
            user_id: None,
            name: "Anna Nowak".to_string(),
            email: "anna@example.com".to_string(),
            phone: None,
            kind: AppointmentKind::Consultation,
            starts_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
            ends_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap(),
            status: crate::db::models::appointments::AppointmentStatus::Scheduled,
            notes: Some("<b>bring samples</b>".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_templates_render_and_escape() {
        let dir = tempfile::tempdir().unwrap();
        let service = EmailService::new(&file_config(dir.path()), "https://shop.example.com/").unwrap();

        let body = service
            .render(
                "payment_received.html",
                context! { name => "<script>", amount => "49.99", currency => "PLN", description => "order #7", link => None::<String> },
            )
            .unwrap();
        assert!(body.contains("49.99 PLN"));
        assert!(body.contains("&lt;script&gt;"));
        assert!(!body.contains("<script>"));
        assert!(body.contains("PrintHub"));
    }

    #[tokio::test]
    async fn test_file_transport_writes_messages() {
        let dir = tempfile::tempdir().unwrap();
        let service = EmailService::new(&file_config(dir.path()), "https://shop.example.com").unwrap();

        // 09:00 UTC is 10:00 in the shop's default UTC+1
        service.send_appointment_confirmation(&appointment(), 60).await.unwrap();
        service
            .send_password_reset("anna@example.com", None, &Uuid::new_v4(), "tok", Duration::from_secs(1800))
            .await
            .unwrap();

        let messages = eml_files(dir.path());
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m.contains("Subject: Your appointment is booked")));
        assert!(messages.iter().any(|m| m.contains("Subject: Password Reset Request")));
    }

    #[test]
    fn test_appointment_times_are_local() {
        let dir = tempfile::tempdir().unwrap();
        let service = EmailService::new(&file_config(dir.path()), "https://shop.example.com").unwrap();
        let a = appointment();
        let offset = FixedOffset::east_opt(3600).unwrap();
        let body = service
            .render(
                "appointment_confirmation.html",
                context! {
                    name => &a.name,
                    kind => appointment_kind_label(a.kind),
                    date => a.starts_at.with_timezone(&offset).format("%A, %d %B %Y").to_string(),
                    start_time => a.starts_at.with_timezone(&offset).format("%H:%M").to_string(),
                    end_time => a.ends_at.with_timezone(&offset).format("%H:%M").to_string(),
                    notes => &a.notes,
                },
            )
            .unwrap();
        assert!(body.contains("10:00 to 10:30"));
        assert!(body.contains("Monday, 02 March 2026"));
        assert!(body.contains("&lt;b&gt;bring samples&lt;&#x2f;b&gt;"));
    }

    #[tokio::test]
    async fn test_resend_transport() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("authorization", "Bearer re_test"))
            .and(body_partial_json(serde_json::json!({
                "subject": "Payment received",
                "to": ["jan@example.com"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "email_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let config = EmailConfig {
            transport: EmailTransportConfig::Resend {
                api_key: "re_test".to_string(),
                base_url: Url::parse(&server.uri()).unwrap(),
            },
            ..Default::default()
        };
        let service = EmailService::new(&config, "https://shop.example.com").unwrap();
        service
            .send_payment_received("jan@example.com", None, Decimal::new(5000, 2), "PLN", "a credits top-up", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resend_errors_are_reported() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid from"))
            .mount(&server)
            .await;

        let config = EmailConfig {
            transport: EmailTransportConfig::Resend {
                api_key: "re_test".to_string(),
                base_url: Url::parse(&server.uri()).unwrap(),
            },
            ..Default::default()
        };
        let service = EmailService::new(&config, "https://shop.example.com").unwrap();
        let err = service
            .send_payment_received("jan@example.com", None, Decimal::ONE, "PLN", "order #1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }
}
