//! Database repository for materials.

use std::collections::HashMap;

use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::materials::{MaterialCreateDBRequest, MaterialDBResponse, MaterialFilter, MaterialUpdateDBRequest},
    },
    types::{MaterialId, abbrev_uuid},
};

const MATERIAL_COLUMNS: &str =
    "id, name, kind, description, density_g_cm3, price_per_gram, colors, available, created_at, updated_at";

pub struct Materials<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Materials<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &MaterialFilter) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM materials WHERE ($1 = FALSE OR available)")
            .bind(filter.available_only)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Materials<'c> {
    type CreateRequest = MaterialCreateDBRequest;
    type UpdateRequest = MaterialUpdateDBRequest;
    type Response = MaterialDBResponse;
    type Id = MaterialId;
    type Filter = MaterialFilter;

    #[instrument(skip(self, request), fields(name = %request.name), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let material = sqlx::query_as::<_, MaterialDBResponse>(&format!(
            r#"
            INSERT INTO materials (id, name, kind, description, density_g_cm3, price_per_gram, colors, available)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {MATERIAL_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(request.kind)
        .bind(&request.description)
        .bind(request.density_g_cm3)
        .bind(request.price_per_gram)
        .bind(&request.colors)
        .bind(request.available)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(material)
    }

    #[instrument(skip(self), fields(material_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let material = sqlx::query_as::<_, MaterialDBResponse>(&format!("SELECT {MATERIAL_COLUMNS} FROM materials WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(material)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let materials =
            sqlx::query_as::<_, MaterialDBResponse>(&format!("SELECT {MATERIAL_COLUMNS} FROM materials WHERE id = ANY($1)"))
                .bind(&ids)
                .fetch_all(&mut *self.db)
                .await?;
        Ok(materials.into_iter().map(|m| (m.id, m)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let materials = sqlx::query_as::<_, MaterialDBResponse>(&format!(
            r#"
            SELECT {MATERIAL_COLUMNS} FROM materials
            WHERE ($1 = FALSE OR available)
            ORDER BY kind, name
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(filter.available_only)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(materials)
    }

    #[instrument(skip(self), fields(material_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM materials WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(material_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        sqlx::query_as::<_, MaterialDBResponse>(&format!(
            r#"
            UPDATE materials SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                density_g_cm3 = COALESCE($4, density_g_cm3),
                price_per_gram = COALESCE($5, price_per_gram),
                colors = COALESCE($6, colors),
                available = COALESCE($7, available),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {MATERIAL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.density_g_cm3)
        .bind(request.price_per_gram)
        .bind(&request.colors)
        .bind(request.available)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::materials::MaterialKind;
    use rust_decimal::Decimal;
    use sqlx::PgPool;

    fn pla(name: &str, available: bool) -> MaterialCreateDBRequest {
        MaterialCreateDBRequest {
            name: name.to_string(),
            kind: MaterialKind::Pla,
            description: None,
            density_g_cm3: Decimal::new(124, 2),
            price_per_gram: Decimal::new(12, 2),
            colors: vec!["black".to_string(), "white".to_string()],
            available,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_and_filter_available(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Materials::new(&mut conn);

        let on = repo.create(&pla("PLA Basic", true)).await.unwrap();
        repo.create(&pla("PLA Silk", false)).await.unwrap();

        let all = repo
            .list(&MaterialFilter {
                available_only: false,
                skip: 0,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let filter = MaterialFilter {
            available_only: true,
            skip: 0,
            limit: 10,
        };
        let available = repo.list(&filter).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, on.id);
        assert_eq!(repo.count(&filter).await.unwrap(), 1);
        assert_eq!(available[0].colors, vec!["black", "white"]);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_update_partial_fields(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Materials::new(&mut conn);

        let material = repo.create(&pla("PLA Basic", true)).await.unwrap();
        let updated = repo
            .update(
                material.id,
                &MaterialUpdateDBRequest {
                    price_per_gram: Some(Decimal::new(15, 2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.price_per_gram, Decimal::new(15, 2));
        assert_eq!(updated.name, "PLA Basic");

        let missing = repo.update(Uuid::new_v4(), &MaterialUpdateDBRequest::default()).await;
        assert!(matches!(missing, Err(DbError::NotFound)));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_duplicate_name_rejected(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Materials::new(&mut conn);

        repo.create(&pla("PLA Basic", true)).await.unwrap();
        let err = repo.create(&pla("PLA Basic", true)).await.unwrap_err();
        assert!(err.is_unique_violation_of("materials_name_unique"));
    }
}
