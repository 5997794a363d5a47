use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use urgent_contracts::filter::FilterSet;
use urgent_contracts::normalize::{machine_label, non_empty, normalize_annotation};
use urgent_contracts::{Incident, IncidentDraft, IncidentStatus, Operator, PlanBApplied};

use crate::predicate::{compile, spacing_sql};
use crate::{IncidentRepository, PgStore, StoreError};

fn decorated_from_sql() -> String {
    format!(
        "FROM urgents u \
         LEFT JOIN LATERAL (SELECT first_name, last_name, role FROM users WHERE {dm} = {ud} LIMIT 1) d ON TRUE \
         LEFT JOIN LATERAL (SELECT first_name, last_name, role FROM users WHERE {cm} = {uc} LIMIT 1) c ON TRUE",
        dm = spacing_sql("users.matricule"),
        ud = spacing_sql("u.declared_by"),
        cm = spacing_sql("users.matricule"),
        uc = spacing_sql("u.corrected_by"),
    )
}

const DECORATED_COLUMNS: &str = "u.id, u.unico, u.machine, u.status, u.urgent_type, u.time_remaining, \
     u.plan_b, u.mc_pb, u.declared_by, u.declared_at, u.corrected_by, u.corrected_at, \
     d.first_name::text AS declarer_first_name, d.last_name::text AS declarer_last_name, \
     d.role::text AS declarer_role, c.first_name::text AS corrector_first_name, \
     c.last_name::text AS corrector_last_name, c.role::text AS corrector_role";

const LATEST_ACTIVE_ID_SQL: &str = "SELECT id FROM urgents WHERE BTRIM(unico) = $1 AND status = 'NOK' \
     ORDER BY declared_at DESC, id DESC LIMIT 1";

fn incident_from_row(row: &PgRow) -> Result<Incident, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = IncidentStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown urgent status `{}`", status_raw)))?;

    let text = |column: &str| -> Result<Option<String>, StoreError> {
        let value: Option<String> = row.try_get(column)?;
        Ok(non_empty(value.as_deref()))
    };

    let declared_by: String = row.try_get("declared_by")?;
    let declared_by = Operator {
        matricule: declared_by.trim().to_string(),
        first_name: text("declarer_first_name")?,
        last_name: text("declarer_last_name")?,
        role: text("declarer_role")?,
    };

    let corrected_by = match text("corrected_by")? {
        Some(matricule) => Some(Operator {
            matricule,
            first_name: text("corrector_first_name")?,
            last_name: text("corrector_last_name")?,
            role: text("corrector_role")?,
        }),
        None => None,
    };

    let unico: String = row.try_get("unico")?;
    let machine: String = row.try_get("machine")?;
    let incident_type: Option<String> = row.try_get("urgent_type")?;
    let time_remaining: Option<String> = row.try_get("time_remaining")?;

    Ok(Incident {
        id: row.try_get("id")?,
        unico: unico.trim().to_string(),
        machine: machine.trim().to_string(),
        status,
        incident_type: normalize_annotation(incident_type.as_deref()),
        time_remaining: normalize_annotation(time_remaining.as_deref()),
        plan_b: row.try_get("plan_b")?,
        mc_pb: text("mc_pb")?,
        declared_by,
        declared_at: row.try_get("declared_at")?,
        corrected_by,
        corrected_at: row.try_get("corrected_at")?,
    })
}

#[async_trait]
impl IncidentRepository for PgStore {
    async fn list(&self, filters: &FilterSet) -> Result<Vec<Incident>, StoreError> {
        let predicate = compile(filters);
        let sql = format!(
            "SELECT {} {}{} ORDER BY u.declared_at DESC, u.id DESC",
            DECORATED_COLUMNS,
            decorated_from_sql(),
            predicate.where_sql()
        );

        let rows = self
            .timed(predicate.bind_all(sqlx::query(&sql)).fetch_all(&self.pool))
            .await?;

        rows.iter().map(incident_from_row).collect()
    }

    async fn distinct_machines(&self, filters: &FilterSet) -> Result<Vec<String>, StoreError> {
        let predicate = compile(filters);
        let sql = format!(
            "SELECT DISTINCT UPPER({}) AS machine {}{}",
            spacing_sql("u.machine"),
            decorated_from_sql(),
            predicate.where_sql()
        );

        let rows = self
            .timed(predicate.bind_all(sqlx::query(&sql)).fetch_all(&self.pool))
            .await?;

        let mut machines = BTreeSet::new();
        for row in rows {
            let raw: Option<String> = row.try_get("machine")?;
            if let Some(label) = raw.as_deref().and_then(machine_label) {
                machines.insert(label);
            }
        }

        Ok(machines.into_iter().collect())
    }

    async fn get(&self, id: i32) -> Result<Option<Incident>, StoreError> {
        let sql = format!(
            "SELECT {} {} WHERE u.id = $1",
            DECORATED_COLUMNS,
            decorated_from_sql()
        );

        let row = self
            .timed(sqlx::query(&sql).bind(id).fetch_optional(&self.pool))
            .await?;

        row.as_ref().map(incident_from_row).transpose()
    }

    async fn insert(&self, draft: &IncidentDraft) -> Result<i32, StoreError> {
        let row = self
            .timed(
                sqlx::query(
                    "INSERT INTO urgents (unico, machine, status, urgent_type, time_remaining, plan_b, mc_pb, declared_by, declared_at) \
                     VALUES ($1, $2, 'NOK', $3, $4, $5, $6, $7, $8) RETURNING id",
                )
                .bind(&draft.unico)
                .bind(&draft.machine)
                .bind(&draft.incident_type)
                .bind(&draft.time_remaining)
                .bind(draft.plan_b)
                .bind(&draft.mc_pb)
                .bind(&draft.declared_by)
                .bind(draft.declared_at)
                .fetch_one(&self.pool),
            )
            .await?;

        Ok(row.try_get("id")?)
    }

    async fn apply_plan_b(
        &self,
        unico: &str,
        mc_pb: &str,
    ) -> Result<Option<PlanBApplied>, StoreError> {
        let sql = format!(
            "UPDATE urgents SET plan_b = TRUE, mc_pb = $2 \
             WHERE id = ({}) AND status = 'NOK' \
             RETURNING id, machine, urgent_type",
            LATEST_ACTIVE_ID_SQL
        );

        let row = self
            .timed(
                sqlx::query(&sql)
                    .bind(unico)
                    .bind(mc_pb)
                    .fetch_optional(&self.pool),
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let machine: String = row.try_get("machine")?;
        let incident_type: Option<String> = row.try_get("urgent_type")?;
        Ok(Some(PlanBApplied {
            id: row.try_get("id")?,
            machine: machine.trim().to_string(),
            incident_type: normalize_annotation(incident_type.as_deref()),
        }))
    }

    async fn resolve(
        &self,
        unico: &str,
        corrector: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Incident>, StoreError> {
        // The outer status check makes a racing second resolve update nothing.
        let sql = format!(
            "UPDATE urgents SET status = 'OK', corrected_by = $2, corrected_at = $3 \
             WHERE id = ({}) AND status = 'NOK' \
             RETURNING id",
            LATEST_ACTIVE_ID_SQL
        );

        let row = self
            .timed(
                sqlx::query(&sql)
                    .bind(unico)
                    .bind(corrector)
                    .bind(now)
                    .fetch_optional(&self.pool),
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: i32 = row.try_get("id")?;
        match self.get(id).await? {
            Some(incident) => Ok(Some(incident)),
            None => Err(StoreError::Corrupt(format!(
                "resolved urgent {} vanished before re-read",
                id
            ))),
        }
    }
}
