use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use urgent_contracts::filter::FilterSet;
use urgent_contracts::normalize::{machine_label, normalize_annotation, normalize_badge};
use urgent_contracts::{Incident, IncidentDraft, IncidentStatus, Operator, PlanBApplied};
use urgent_store::{IncidentRepository, Inventory, OperatorDirectory, StoreError};

/// In-memory stand-in for the Postgres store, seeded with the same collaborators as
/// `db/init/001_collaborators.sql`.
pub(crate) struct MemoryStore {
    inner: Mutex<Inner>,
}

struct Inner {
    incidents: Vec<Incident>,
    next_id: i32,
    operators: Vec<(Operator, String)>,
    inventory: BTreeSet<String>,
    failing: bool,
    lose_reads: bool,
}

fn operator(matricule: &str, first: &str, last: &str, role: &str) -> Operator {
    Operator {
        matricule: matricule.to_string(),
        first_name: Some(first.to_string()).filter(|v| !v.is_empty()),
        last_name: Some(last.to_string()).filter(|v| !v.is_empty()),
        role: Some(role.to_string()),
    }
}

impl MemoryStore {
    pub(crate) fn seeded() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                incidents: Vec::new(),
                next_id: 1,
                operators: vec![
                    (operator("1001", "Amina", "Haddad", "operator"), "line-one".to_string()),
                    (operator("2002", "Jonas", "Keller", "maintenance"), "fix-it".to_string()),
                    (operator("3003", "", "Okafor", "operator"), "tabbed".to_string()),
                ],
                inventory: ["LH-148031", "LH-148032", "LH-200100", "ZX-0007"]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                failing: false,
                lose_reads: false,
            }),
        })
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Makes `get` report every row as missing, as if it was deleted right after insert.
    pub(crate) fn set_lose_reads(&self, lose_reads: bool) {
        self.lock().lose_reads = lose_reads;
    }

    pub(crate) fn incident_count(&self) -> usize {
        self.lock().incidents.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn guard(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock();
        if inner.failing {
            return Err(StoreError::Timeout);
        }
        Ok(inner)
    }
}

impl Inner {
    fn decorate(&self, matricule: &str) -> Operator {
        let key = normalize_badge(matricule);
        self.operators
            .iter()
            .find(|(op, _)| op.matricule == key)
            .map(|(op, _)| op.clone())
            .unwrap_or_else(|| Operator::bare(key))
    }

    fn latest_active(&mut self, unico: &str) -> Option<&mut Incident> {
        let unico = unico.trim();
        self.incidents
            .iter_mut()
            .filter(|i| i.status == IncidentStatus::Nok && i.unico == unico)
            .max_by(|a, b| a.declared_at.cmp(&b.declared_at).then(a.id.cmp(&b.id)))
    }
}

#[async_trait]
impl IncidentRepository for MemoryStore {
    async fn list(&self, filters: &FilterSet) -> Result<Vec<Incident>, StoreError> {
        let inner = self.guard()?;
        let mut rows: Vec<Incident> = inner
            .incidents
            .iter()
            .filter(|i| filters.matches(i))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.declared_at.cmp(&a.declared_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn distinct_machines(&self, filters: &FilterSet) -> Result<Vec<String>, StoreError> {
        let inner = self.guard()?;
        let machines: BTreeSet<String> = inner
            .incidents
            .iter()
            .filter(|i| filters.matches(i))
            .filter_map(|i| machine_label(&i.machine))
            .collect();
        Ok(machines.into_iter().collect())
    }

    async fn get(&self, id: i32) -> Result<Option<Incident>, StoreError> {
        let inner = self.guard()?;
        if inner.lose_reads {
            return Ok(None);
        }
        Ok(inner.incidents.iter().find(|i| i.id == id).cloned())
    }

    async fn insert(&self, draft: &IncidentDraft) -> Result<i32, StoreError> {
        let mut inner = self.guard()?;
        let id = inner.next_id;
        inner.next_id += 1;
        let declared_by = inner.decorate(&draft.declared_by);
        inner.incidents.push(Incident {
            id,
            unico: draft.unico.trim().to_string(),
            machine: draft.machine.trim().to_string(),
            status: IncidentStatus::Nok,
            incident_type: normalize_annotation(draft.incident_type.as_deref()),
            time_remaining: normalize_annotation(draft.time_remaining.as_deref()),
            plan_b: draft.plan_b,
            mc_pb: draft.mc_pb.clone(),
            declared_by,
            declared_at: draft.declared_at,
            corrected_by: None,
            corrected_at: None,
        });
        Ok(id)
    }

    async fn apply_plan_b(
        &self,
        unico: &str,
        mc_pb: &str,
    ) -> Result<Option<PlanBApplied>, StoreError> {
        let mut inner = self.guard()?;
        Ok(inner.latest_active(unico).map(|incident| {
            incident.plan_b = true;
            incident.mc_pb = Some(mc_pb.to_string());
            PlanBApplied {
                id: incident.id,
                machine: incident.machine.clone(),
                incident_type: incident.incident_type.clone(),
            }
        }))
    }

    async fn resolve(
        &self,
        unico: &str,
        corrector: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Incident>, StoreError> {
        let mut inner = self.guard()?;
        let corrected_by = inner.decorate(corrector);
        Ok(inner.latest_active(unico).map(|incident| {
            incident.status = IncidentStatus::Ok;
            incident.corrected_by = Some(corrected_by);
            incident.corrected_at = Some(now);
            incident.clone()
        }))
    }
}

#[async_trait]
impl OperatorDirectory for MemoryStore {
    async fn find_by_credentials(
        &self,
        badge: &str,
        secret: &str,
    ) -> Result<Option<Operator>, StoreError> {
        let inner = self.guard()?;
        let badge = normalize_badge(badge);
        Ok(inner
            .operators
            .iter()
            .find(|(op, pw)| op.matricule == badge && pw.trim() == secret.trim())
            .map(|(op, _)| op.clone()))
    }
}

#[async_trait]
impl Inventory for MemoryStore {
    async fn missing_unicos(&self, unicos: &[String]) -> Result<Vec<String>, StoreError> {
        let inner = self.guard()?;
        let mut seen = BTreeSet::new();
        Ok(unicos
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty() && seen.insert(u.clone()))
            .filter(|u| !inner.inventory.contains(u))
            .collect())
    }
}
