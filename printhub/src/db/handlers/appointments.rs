//! Database repository for appointments.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    db::{
        errors::{DbError, Result},
        models::appointments::{AppointmentCreateDBRequest, AppointmentDBResponse, AppointmentFilter, AppointmentUpdateDBRequest},
    },
    types::{AppointmentId, abbrev_uuid},
};

const APPOINTMENT_COLUMNS: &str =
    "id, user_id, name, email, phone, kind, starts_at, ends_at, status, notes, created_at, updated_at";

pub struct Appointments<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Appointments<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Overlapping active bookings fail with an exclusion violation of `appointments_no_overlap`.
    #[instrument(skip(self, request), fields(kind = ?request.kind, starts_at = %request.starts_at), err)]
    pub async fn create(&mut self, request: &AppointmentCreateDBRequest) -> Result<AppointmentDBResponse> {
        let appointment = sqlx::query_as::<_, AppointmentDBResponse>(&format!(
            r#"
            INSERT INTO appointments (id, user_id, name, email, phone, kind, starts_at, ends_at, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {APPOINTMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.user_id)
        .bind(request.name.trim())
        .bind(request.email.trim().to_lowercase())
        .bind(&request.phone)
        .bind(request.kind)
        .bind(request.starts_at)
        .bind(request.ends_at)
        .bind(&request.notes)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(appointment)
    }

    #[instrument(skip(self), fields(appointment_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: AppointmentId) -> Result<Option<AppointmentDBResponse>> {
        let appointment =
            sqlx::query_as::<_, AppointmentDBResponse>(&format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(appointment)
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list(&mut self, filter: &AppointmentFilter) -> Result<Vec<AppointmentDBResponse>> {
        let appointments = sqlx::query_as::<_, AppointmentDBResponse>(&format!(
            r#"
            SELECT {APPOINTMENT_COLUMNS} FROM appointments
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR starts_at >= $3)
              AND ($4::timestamptz IS NULL OR starts_at < $4)
            ORDER BY starts_at ASC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(filter.user_id)
        .bind(filter.status)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(appointments)
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &AppointmentFilter) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM appointments
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR starts_at >= $3)
              AND ($4::timestamptz IS NULL OR starts_at < $4)
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.status)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// Active appointments that intersect `[from, to)`, earliest first.
    #[instrument(skip(self), err)]
    pub async fn list_active_between(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AppointmentDBResponse>> {
        let appointments = sqlx::query_as::<_, AppointmentDBResponse>(&format!(
            r#"
            SELECT {APPOINTMENT_COLUMNS} FROM appointments
            WHERE status IN ('scheduled', 'confirmed')
              AND starts_at < $2 AND ends_at > $1
            ORDER BY starts_at ASC
            "#
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(appointments)
    }

    /// True if any active appointment intersects `[starts_at, ends_at)`.
    #[instrument(skip(self), err)]
    pub async fn has_overlap(&mut self, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Result<bool> {
        let overlap = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM appointments
                WHERE status IN ('scheduled', 'confirmed')
                  AND tstzrange(starts_at, ends_at) && tstzrange($1, $2)
            )
            "#,
        )
        .bind(starts_at)
        .bind(ends_at)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(overlap)
    }

    #[instrument(skip(self, request), fields(appointment_id = %abbrev_uuid(&id)), err)]
    pub async fn update(&mut self, id: AppointmentId, request: &AppointmentUpdateDBRequest) -> Result<AppointmentDBResponse> {
        sqlx::query_as::<_, AppointmentDBResponse>(&format!(
            r#"
            UPDATE appointments SET
                status = COALESCE($2, status),
                notes = COALESCE($3, notes),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {APPOINTMENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.status)
        .bind(&request.notes)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)
    }

    /// Active appointments starting within the next `days` days
    #[instrument(skip(self), err)]
    pub async fn count_upcoming(&mut self, days: i32) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM appointments
            WHERE status IN ('scheduled', 'confirmed')
              AND starts_at >= NOW() AND starts_at < NOW() + make_interval(days => $1)
            "#,
        )
        .bind(days)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::appointments::{AppointmentKind, AppointmentStatus};
    use chrono::Duration;
    use sqlx::PgPool;

    fn booking(starts_at: DateTime<Utc>, minutes: i64) -> AppointmentCreateDBRequest {
        AppointmentCreateDBRequest {
            user_id: None,
            name: "Anna Nowak".to_string(),
            email: "Anna@Example.com".to_string(),
            phone: None,
            kind: AppointmentKind::Consultation,
            starts_at,
            ends_at: starts_at + Duration::minutes(minutes),
            notes: None,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_overlapping_booking_hits_exclusion_constraint(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Appointments::new(&mut conn);
        let start = Utc::now() + Duration::days(2);

        let first = repo.create(&booking(start, 30)).await.unwrap();
        assert_eq!(first.email, "anna@example.com");
        assert_eq!(first.status, AppointmentStatus::Scheduled);

        assert!(repo.has_overlap(start + Duration::minutes(15), start + Duration::minutes(45)).await.unwrap());
        // Touching ranges do not overlap
        assert!(!repo.has_overlap(start + Duration::minutes(30), start + Duration::minutes(60)).await.unwrap());

        let err = repo.create(&booking(start + Duration::minutes(15), 30)).await.unwrap_err();
        assert!(matches!(err, DbError::ExclusionViolation { .. }));

        repo.create(&booking(start + Duration::minutes(30), 30)).await.unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_cancelled_booking_frees_slot(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Appointments::new(&mut conn);
        let start = Utc::now() + Duration::days(3);

        let first = repo.create(&booking(start, 30)).await.unwrap();
        repo.update(
            first.id,
            &AppointmentUpdateDBRequest {
                status: Some(AppointmentStatus::Cancelled),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(!repo.has_overlap(start, start + Duration::minutes(30)).await.unwrap());
        repo.create(&booking(start, 30)).await.unwrap();

        let active = repo.list_active_between(start - Duration::hours(1), start + Duration::hours(1)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(repo.count_upcoming(7).await.unwrap(), 1);
    }
}
