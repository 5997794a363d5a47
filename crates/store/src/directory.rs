use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::Row;
use urgent_contracts::Operator;
use urgent_contracts::normalize::non_empty;

use crate::predicate::spacing_sql;
use crate::{Inventory, OperatorDirectory, PgStore, StoreError};

#[async_trait]
impl OperatorDirectory for PgStore {
    async fn find_by_credentials(
        &self,
        badge: &str,
        secret: &str,
    ) -> Result<Option<Operator>, StoreError> {
        let sql = format!(
            "SELECT matricule::text AS matricule, first_name::text AS first_name, \
             last_name::text AS last_name, role::text AS role \
             FROM users WHERE {} = $1 AND BTRIM(password::text) = $2 LIMIT 1",
            spacing_sql("matricule")
        );

        let row = self
            .timed(
                sqlx::query(&sql)
                    .bind(badge)
                    .bind(secret)
                    .fetch_optional(&self.pool),
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let matricule: String = row.try_get("matricule")?;
        let first_name: Option<String> = row.try_get("first_name")?;
        let last_name: Option<String> = row.try_get("last_name")?;
        let role: Option<String> = row.try_get("role")?;

        Ok(Some(Operator {
            matricule: matricule.trim().to_string(),
            first_name: non_empty(first_name.as_deref()),
            last_name: non_empty(last_name.as_deref()),
            role: non_empty(role.as_deref()),
        }))
    }
}

#[async_trait]
impl Inventory for PgStore {
    async fn missing_unicos(&self, unicos: &[String]) -> Result<Vec<String>, StoreError> {
        let mut requested = Vec::with_capacity(unicos.len());
        let mut seen = HashSet::new();
        for unico in unicos {
            let unico = unico.trim();
            if !unico.is_empty() && seen.insert(unico.to_string()) {
                requested.push(unico.to_string());
            }
        }

        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self
            .timed(
                sqlx::query(
                    "SELECT DISTINCT BTRIM(unico::text) AS unico FROM wires WHERE BTRIM(unico::text) = ANY($1)",
                )
                .bind(&requested)
                .fetch_all(&self.pool),
            )
            .await?;

        let mut found = HashSet::with_capacity(rows.len());
        for row in rows {
            let unico: String = row.try_get("unico")?;
            found.insert(unico);
        }

        Ok(requested
            .into_iter()
            .filter(|unico| !found.contains(unico))
            .collect())
    }
}
