//! Database repository for printers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgConnection};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::{
            materials::MaterialKind,
            printers::{PrinterCreateDBRequest, PrinterDBResponse, PrinterFilter, PrinterStatus, PrinterUpdateDBRequest},
        },
    },
    types::{PrinterId, abbrev_uuid},
};

const PRINTER_COLUMNS: &str = "id, name, model, status, hourly_rate, throughput_g_per_hour, build_x_mm, build_y_mm, \
                               build_z_mm, supported_kinds, notes, created_at, updated_at";

#[derive(Debug, FromRow)]
struct Printer {
    id: PrinterId,
    name: String,
    model: String,
    status: PrinterStatus,
    hourly_rate: Decimal,
    throughput_g_per_hour: Decimal,
    build_x_mm: i32,
    build_y_mm: i32,
    build_z_mm: i32,
    supported_kinds: Vec<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<Printer> for PrinterDBResponse {
    fn from(p: Printer) -> Self {
        let supported_kinds = p
            .supported_kinds
            .iter()
            .filter_map(|k| match k.parse::<MaterialKind>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    warn!(printer_id = %abbrev_uuid(&p.id), "Ignoring stored material kind: {}", e);
                    None
                }
            })
            .collect();

        Self {
            id: p.id,
            name: p.name,
            model: p.model,
            status: p.status,
            hourly_rate: p.hourly_rate,
            throughput_g_per_hour: p.throughput_g_per_hour,
            build_x_mm: p.build_x_mm,
            build_y_mm: p.build_y_mm,
            build_z_mm: p.build_z_mm,
            supported_kinds,
            notes: p.notes,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

fn kinds_to_text(kinds: &[MaterialKind]) -> Vec<&'static str> {
    kinds.iter().map(|k| k.as_str()).collect()
}

pub struct Printers<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Printers<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Printers that can take a job in this material, cheapest first.
    #[instrument(skip(self), err)]
    pub async fn list_for_kind(&mut self, kind: MaterialKind) -> Result<Vec<PrinterDBResponse>> {
        let printers = sqlx::query_as::<_, Printer>(&format!(
            r#"
            SELECT {PRINTER_COLUMNS} FROM printers
            WHERE $1 = ANY(supported_kinds) AND status IN ('idle', 'printing')
            ORDER BY hourly_rate ASC, name ASC
            "#
        ))
        .bind(kind.as_str())
        .fetch_all(&mut *self.db)
        .await?;
        Ok(printers.into_iter().map(PrinterDBResponse::from).collect())
    }

    #[instrument(skip(self), err)]
    pub async fn count(&mut self, filter: &PrinterFilter) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM printers WHERE ($1::text IS NULL OR status = $1)")
            .bind(filter.status)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    /// Number of printers per status, for the dashboard
    #[instrument(skip(self), err)]
    pub async fn status_counts(&mut self) -> Result<Vec<(PrinterStatus, i64)>> {
        let rows = sqlx::query_as::<_, (PrinterStatus, i64)>("SELECT status, COUNT(*) FROM printers GROUP BY status ORDER BY status")
            .fetch_all(&mut *self.db)
            .await?;
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Printers<'c> {
    type CreateRequest = PrinterCreateDBRequest;
    type UpdateRequest = PrinterUpdateDBRequest;
    type Response = PrinterDBResponse;
    type Id = PrinterId;
    type Filter = PrinterFilter;

    #[instrument(skip(self, request), fields(name = %request.name), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let printer = sqlx::query_as::<_, Printer>(&format!(
            r#"
            INSERT INTO printers (id, name, model, status, hourly_rate, throughput_g_per_hour,
                                  build_x_mm, build_y_mm, build_z_mm, supported_kinds, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {PRINTER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.model)
        .bind(request.status)
        .bind(request.hourly_rate)
        .bind(request.throughput_g_per_hour)
        .bind(request.build_x_mm)
        .bind(request.build_y_mm)
        .bind(request.build_z_mm)
        .bind(kinds_to_text(&request.supported_kinds))
        .bind(&request.notes)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(printer.into())
    }

    #[instrument(skip(self), fields(printer_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let printer = sqlx::query_as::<_, Printer>(&format!("SELECT {PRINTER_COLUMNS} FROM printers WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(printer.map(PrinterDBResponse::from))
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let printers = sqlx::query_as::<_, Printer>(&format!("SELECT {PRINTER_COLUMNS} FROM printers WHERE id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(printers.into_iter().map(|p| (p.id, PrinterDBResponse::from(p))).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let printers = sqlx::query_as::<_, Printer>(&format!(
            r#"
            SELECT {PRINTER_COLUMNS} FROM printers
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY name
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(filter.status)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(printers.into_iter().map(PrinterDBResponse::from).collect())
    }

    #[instrument(skip(self), fields(printer_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM printers WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(printer_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let kinds = request.supported_kinds.as_deref().map(kinds_to_text);
        let printer = sqlx::query_as::<_, Printer>(&format!(
            r#"
            UPDATE printers SET
                name = COALESCE($2, name),
                model = COALESCE($3, model),
                status = COALESCE($4, status),
                hourly_rate = COALESCE($5, hourly_rate),
                throughput_g_per_hour = COALESCE($6, throughput_g_per_hour),
                supported_kinds = COALESCE($7, supported_kinds),
                notes = COALESCE($8, notes),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {PRINTER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.name)
        .bind(&request.model)
        .bind(request.status)
        .bind(request.hourly_rate)
        .bind(request.throughput_g_per_hour)
        .bind(kinds)
        .bind(&request.notes)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(printer.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    fn printer(name: &str, rate: i64, kinds: Vec<MaterialKind>, status: PrinterStatus) -> PrinterCreateDBRequest {
        PrinterCreateDBRequest {
            name: name.to_string(),
            model: "Prusa MK4".to_string(),
            status,
            hourly_rate: Decimal::new(rate, 0),
            throughput_g_per_hour: Decimal::new(15, 0),
            build_x_mm: 250,
            build_y_mm: 210,
            build_z_mm: 220,
            supported_kinds: kinds,
            notes: None,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_for_kind_skips_unavailable_and_orders_by_rate(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Printers::new(&mut conn);

        repo.create(&printer("Expensive", 12, vec![MaterialKind::Pla], PrinterStatus::Idle))
            .await
            .unwrap();
        let cheap = repo
            .create(&printer("Cheap", 6, vec![MaterialKind::Pla, MaterialKind::Petg], PrinterStatus::Printing))
            .await
            .unwrap();
        repo.create(&printer("Broken", 1, vec![MaterialKind::Pla], PrinterStatus::Maintenance))
            .await
            .unwrap();
        repo.create(&printer("Resin only", 2, vec![MaterialKind::Resin], PrinterStatus::Idle))
            .await
            .unwrap();

        let candidates = repo.list_for_kind(MaterialKind::Pla).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id, cheap.id);
        assert!(candidates[0].supports(MaterialKind::Petg));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_update_status_and_kinds(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Printers::new(&mut conn);

        let p = repo
            .create(&printer("P1", 8, vec![MaterialKind::Pla], PrinterStatus::Idle))
            .await
            .unwrap();
        let updated = repo
            .update(
                p.id,
                &PrinterUpdateDBRequest {
                    status: Some(PrinterStatus::Offline),
                    supported_kinds: Some(vec![MaterialKind::Abs, MaterialKind::Asa]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, PrinterStatus::Offline);
        assert_eq!(updated.supported_kinds, vec![MaterialKind::Abs, MaterialKind::Asa]);

        let counts = repo.status_counts().await.unwrap();
        assert_eq!(counts, vec![(PrinterStatus::Offline, 1)]);
    }
}
