use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use tracing::info;

use crate::{
    AppState,
    api::{
        handlers::{is_valid_email, missing_fields, non_blank, not_found},
        models::{
            appointments::{
                AppointmentCreate, AppointmentResponse, AppointmentUpdate, AvailabilityQuery, AvailabilityResponse,
                ListAppointmentsQuery, Slot,
            },
            pagination::PaginatedResponse,
            users::CurrentUser,
        },
    },
    auth::{current_user::MaybeUser, permissions},
    db::{
        handlers::{Appointments, Settings},
        models::{
            appointments::{AppointmentCreateDBRequest, AppointmentFilter, AppointmentKind, AppointmentStatus, AppointmentUpdateDBRequest},
            settings::{MAX_DAYS_AHEAD, MAX_NOTICE_HOURS, ScheduleSettings},
        },
    },
    errors::Error,
    types::{AppointmentId, Operation, Resource, abbrev_uuid},
};

fn shop_offset(schedule: &ScheduleSettings) -> Result<FixedOffset, Error> {
    FixedOffset::east_opt(schedule.utc_offset_minutes * 60).ok_or_else(|| Error::Internal {
        operation: format!("apply UTC offset of {} minutes", schedule.utc_offset_minutes),
    })
}

/// Every bookable window of `kind` on a local date, ignoring notice, horizon and existing
/// bookings. Windows start on slot boundaries and end by closing time.
fn opening_slots(schedule: &ScheduleSettings, date: NaiveDate, kind: AppointmentKind) -> Result<Vec<Slot>, Error> {
    if schedule.slot_minutes == 0 || !schedule.working_days.contains(&date.weekday()) {
        return Ok(Vec::new());
    }
    let offset = shop_offset(schedule)?;
    let step = Duration::minutes(i64::from(schedule.slot_minutes));
    let length = step * kind.slot_count() as i32;

    let close = date.and_time(schedule.close_time);
    let mut start = date.and_time(schedule.open_time);
    let mut slots = Vec::new();
    while start + length <= close {
        if let Some(local) = offset.from_local_datetime(&start).single() {
            let starts_at = local.with_timezone(&Utc);
            slots.push(Slot {
                starts_at,
                ends_at: starts_at + length,
            });
        }
        start += step;
    }
    Ok(slots)
}

/// Bounds on how soon and how far ahead a booking may start. Stored values are clamped so rows
/// written before the limits existed cannot overflow the date arithmetic.
fn booking_window(schedule: &ScheduleSettings, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        now + Duration::hours(schedule.min_notice_hours.clamp(0, MAX_NOTICE_HOURS)),
        now + Duration::days(schedule.max_days_ahead.clamp(1, MAX_DAYS_AHEAD)),
    )
}

/// The slot a booking starting at `starts_at` would occupy, if the time is bookable
fn slot_for(schedule: &ScheduleSettings, starts_at: DateTime<Utc>, kind: AppointmentKind, now: DateTime<Utc>) -> Result<Slot, Error> {
    let offset = shop_offset(schedule)?;
    let local_date = starts_at.with_timezone(&offset).date_naive();

    let slot = opening_slots(schedule, local_date, kind)?
        .into_iter()
        .find(|s| s.starts_at == starts_at)
        .ok_or_else(|| Error::BadRequest {
            message: "Start time must be on a slot boundary within opening hours".to_string(),
        })?;

    let (earliest, latest) = booking_window(schedule, now);
    if slot.starts_at < earliest {
        return Err(Error::BadRequest {
            message: format!("Appointments must be booked at least {} hours ahead", schedule.min_notice_hours),
        });
    }
    if slot.starts_at > latest {
        return Err(Error::BadRequest {
            message: format!("Appointments can be booked at most {} days ahead", schedule.max_days_ahead),
        });
    }
    Ok(slot)
}

/// Free appointment slots for a day
#[utoipa::path(
    get,
    path = "/appointments/availability",
    tag = "appointments",
    params(AvailabilityQuery),
    responses(
        (status = 200, description = "Slots that can still be booked", body = AvailabilityResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, Error> {
    let kind = query.kind.unwrap_or(AppointmentKind::Consultation);

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let schedule = Settings::new(&mut conn).get_shop().await?.schedule;

    let (earliest, latest) = booking_window(&schedule, Utc::now());
    let candidates: Vec<Slot> = opening_slots(&schedule, query.date, kind)?
        .into_iter()
        .filter(|s| s.starts_at >= earliest && s.starts_at <= latest)
        .collect();

    let slots = match (candidates.first(), candidates.last()) {
        (Some(first), Some(last)) => {
            let booked = Appointments::new(&mut conn)
                .list_active_between(first.starts_at, last.ends_at)
                .await?;
            candidates
                .into_iter()
                .filter(|slot| !booked.iter().any(|a| a.starts_at < slot.ends_at && slot.starts_at < a.ends_at))
                .collect()
        }
        _ => Vec::new(),
    };

    Ok(Json(AvailabilityResponse {
        date: query.date,
        kind,
        utc_offset_minutes: schedule.utc_offset_minutes,
        slots,
    }))
}

/// Book an appointment
///
/// Guests may book; signed-in users' name and email default to their account.
#[utoipa::path(
    post,
    path = "/appointments",
    tag = "appointments",
    request_body = AppointmentCreate,
    responses(
        (status = 201, description = "Appointment booked", body = AppointmentResponse),
        (status = 400, description = "Missing fields or time not bookable"),
        (status = 409, description = "The slot is already taken"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn book_appointment(
    State(state): State<AppState>,
    user: MaybeUser,
    Json(request): Json<AppointmentCreate>,
) -> Result<(StatusCode, Json<AppointmentResponse>), Error> {
    let name = non_blank(request.name.as_deref()).or_else(|| user.as_ref().and_then(|u| non_blank(u.display_name.as_deref())));
    let email = non_blank(request.email.as_deref()).or_else(|| user.as_ref().map(|u| u.email.clone()));

    let (Some(name), Some(email), Some(kind), Some(starts_at)) = (name.clone(), email.clone(), request.kind, request.starts_at) else {
        let missing: Vec<&str> = [
            ("name", name.is_none()),
            ("email", email.is_none()),
            ("kind", request.kind.is_none()),
            ("starts_at", request.starts_at.is_none()),
        ]
        .into_iter()
        .filter_map(|(field, absent)| absent.then_some(field))
        .collect();
        return Err(missing_fields(&missing));
    };
    if !is_valid_email(&email) {
        return Err(Error::BadRequest {
            message: "Invalid email address".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let schedule = Settings::new(&mut conn).get_shop().await?.schedule;
    let slot = slot_for(&schedule, starts_at, kind, Utc::now())?;

    let mut repo = Appointments::new(&mut conn);
    if repo.has_overlap(slot.starts_at, slot.ends_at).await? {
        return Err(Error::Conflict {
            message: "The selected time slot is no longer available".to_string(),
        });
    }
    // The exclusion constraint catches a concurrent booking of the same slot
    let appointment = repo
        .create(&AppointmentCreateDBRequest {
            user_id: user.as_ref().map(|u| u.id),
            name,
            email: email.trim().to_lowercase(),
            phone: non_blank(request.phone.as_deref()),
            kind,
            starts_at: slot.starts_at,
            ends_at: slot.ends_at,
            notes: non_blank(request.notes.as_deref()),
        })
        .await?;

    metrics::counter!("printhub_appointments_booked_total").increment(1);
    info!(appointment_id = %abbrev_uuid(&appointment.id), starts_at = %appointment.starts_at, "Appointment booked");

    if let Err(e) = state
        .email
        .send_appointment_confirmation(&appointment, schedule.utc_offset_minutes)
        .await
    {
        tracing::error!(appointment_id = %appointment.id, "Failed to send appointment confirmation: {}", e);
    }

    Ok((StatusCode::CREATED, Json(AppointmentResponse::from(appointment))))
}

/// List appointments
///
/// Customers see their own bookings; staff see all of them.
#[utoipa::path(
    get,
    path = "/appointments",
    tag = "appointments",
    params(ListAppointmentsQuery),
    responses(
        (status = 200, description = "Appointments by start time", body = PaginatedResponse<AppointmentResponse>),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_appointments(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListAppointmentsQuery>,
) -> Result<Json<PaginatedResponse<AppointmentResponse>>, Error> {
    permissions::require(&user, Resource::Appointments, Operation::ReadOwn)?;
    let (skip, limit) = query.pagination.params();

    let filter = AppointmentFilter {
        user_id: (!permissions::can_access_all(&user, Resource::Appointments, Operation::ReadAll)).then_some(user.id),
        status: query.status,
        from: query.from,
        to: query.to,
        skip,
        limit,
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Appointments::new(&mut conn);
    let appointments = repo.list(&filter).await?;
    let total = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        appointments.into_iter().map(AppointmentResponse::from).collect(),
        total,
        skip,
        limit,
    )))
}

/// Update an appointment (staff)
#[utoipa::path(
    patch,
    path = "/appointments/{id}",
    tag = "appointments",
    request_body = AppointmentUpdate,
    params(("id" = String, Path, description = "Appointment ID")),
    responses(
        (status = 200, description = "Appointment updated", body = AppointmentResponse),
        (status = 400, description = "Transition not allowed"),
        (status = 403, description = "Staff only"),
        (status = 404, description = "Appointment not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_appointment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<AppointmentId>,
    Json(request): Json<AppointmentUpdate>,
) -> Result<Json<AppointmentResponse>, Error> {
    permissions::require(&user, Resource::Appointments, Operation::UpdateAll)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Appointments::new(&mut conn);
    let appointment = repo.get_by_id(id).await?.ok_or_else(|| not_found("Appointment", id))?;

    if request
        .status
        .is_some_and(|next| !appointment.status.can_transition_to(next))
    {
        return Err(Error::BadRequest {
            message: "Appointment cannot move to the requested status".to_string(),
        });
    }

    let updated = repo
        .update(
            id,
            &AppointmentUpdateDBRequest {
                status: request.status,
                notes: request.notes,
            },
        )
        .await?;

    Ok(Json(AppointmentResponse::from(updated)))
}

/// Cancel an appointment
///
/// Available to the person who booked it and to staff. Frees the slot.
#[utoipa::path(
    post,
    path = "/appointments/{id}/cancel",
    tag = "appointments",
    params(("id" = String, Path, description = "Appointment ID")),
    responses(
        (status = 200, description = "Appointment cancelled", body = AppointmentResponse),
        (status = 403, description = "Not your appointment"),
        (status = 404, description = "Appointment not found"),
        (status = 409, description = "Already completed or cancelled"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn cancel_appointment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<AppointmentId>,
) -> Result<Json<AppointmentResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Appointments::new(&mut conn);
    let appointment = repo.get_by_id(id).await?.ok_or_else(|| not_found("Appointment", id))?;

    permissions::require_access(&user, Resource::Appointments, Operation::UpdateOwn, appointment.user_id)?;

    if !appointment.status.is_active() {
        return Err(Error::Conflict {
            message: "Appointment is already closed".to_string(),
        });
    }

    let updated = repo
        .update(
            id,
            &AppointmentUpdateDBRequest {
                status: Some(AppointmentStatus::Cancelled),
                notes: None,
            },
        )
        .await?;
    info!(appointment_id = %abbrev_uuid(&id), "Appointment cancelled");

    Ok(Json(AppointmentResponse::from(updated)))
}
