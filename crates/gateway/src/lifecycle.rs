use std::sync::Arc;

use chrono::Utc;
use urgent_contracts::filter::FilterSet;
use urgent_contracts::normalize::non_empty;
use urgent_contracts::{
    DeclareItem, DeclareRequest, Incident, IncidentDraft, NO_NOK_URGENT_FOUND, Operator,
    PlanBRequest, PlanBResponse, ResolveRequest, ResolveResponse, SkippedResolve,
    UrgentEvent, UrgentQuery,
};
use urgent_store::{IncidentRepository, Inventory, StoreError};

use crate::credentials::CredentialVerifier;
use crate::notifier::EventPublisher;

#[derive(Debug)]
pub enum LifecycleError {
    BadRequest(String),
    MissingUnicos(Vec<String>),
    Unauthorized,
    NotFound(String),
    Internal(StoreError),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::BadRequest(message) => write!(f, "bad request: {}", message),
            LifecycleError::MissingUnicos(missing) => {
                write!(f, "unknown unico(s): {}", missing.join(", "))
            }
            LifecycleError::Unauthorized => write!(f, "invalid credentials"),
            LifecycleError::NotFound(message) => write!(f, "not found: {}", message),
            LifecycleError::Internal(err) => write!(f, "internal: {}", err),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<StoreError> for LifecycleError {
    fn from(value: StoreError) -> Self {
        LifecycleError::Internal(value)
    }
}

impl LifecycleError {
    fn outcome(&self) -> &'static str {
        match self {
            LifecycleError::BadRequest(_) | LifecycleError::MissingUnicos(_) => "rejected",
            LifecycleError::Unauthorized => "unauthorized",
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::Internal(_) => "error",
        }
    }
}

/// A declaration item that passed field validation.
#[derive(Debug, Clone)]
struct Declaration {
    unico: String,
    machine: String,
    incident_type: Option<String>,
    time_remaining: Option<String>,
    plan_b: bool,
    mc_pb: Option<String>,
}

impl Declaration {
    fn from_item(item: &DeclareItem) -> Option<Self> {
        let unico = non_empty(item.unico.as_deref())?;
        let machine = non_empty(item.machine.as_deref())?;

        Some(Self {
            unico,
            machine,
            incident_type: non_empty(item.incident_type.as_deref()),
            time_remaining: non_empty(item.time_remaining.as_deref()),
            plan_b: item.plan_b.unwrap_or(false),
            mc_pb: non_empty(item.mc_pb.as_deref()),
        })
    }

    fn into_draft(self, declarer: &Operator) -> IncidentDraft {
        IncidentDraft {
            unico: self.unico,
            machine: self.machine,
            incident_type: self.incident_type,
            time_remaining: self.time_remaining,
            plan_b: self.plan_b,
            mc_pb: self.mc_pb,
            declared_by: declarer.matricule.clone(),
            declared_at: Utc::now(),
        }
    }
}

/// Batch items missing `unico` or `machine` are skipped; a batch with nothing left is rejected.
fn declarations(req: &DeclareRequest) -> Result<Vec<Declaration>, LifecycleError> {
    match &req.urgents {
        Some(batch) => {
            let items: Vec<Declaration> = batch.iter().filter_map(Declaration::from_item).collect();
            if items.is_empty() {
                return Err(LifecycleError::BadRequest(
                    "urgents must contain at least one entry with unico and machine".to_string(),
                ));
            }
            Ok(items)
        }
        None => Declaration::from_item(&req.single)
            .map(|item| vec![item])
            .ok_or_else(|| LifecycleError::BadRequest("unico and machine are required".to_string())),
    }
}

fn resolve_targets(req: &ResolveRequest) -> Result<Vec<String>, LifecycleError> {
    let mut targets: Vec<String> = req
        .unicos
        .iter()
        .flatten()
        .filter_map(|code| non_empty(Some(code.as_str())))
        .collect();
    if targets.is_empty() {
        targets.extend(non_empty(req.unico.as_deref()));
    }

    if targets.is_empty() {
        return Err(LifecycleError::BadRequest(
            "unico or unicos is required".to_string(),
        ));
    }
    Ok(targets)
}

/// Validates, authenticates and persists lifecycle transitions, then publishes one event per
/// persisted change. Events are never published for a failed or rejected write.
#[derive(Clone)]
pub struct LifecycleEngine {
    incidents: Arc<dyn IncidentRepository>,
    inventory: Arc<dyn Inventory>,
    verifier: CredentialVerifier,
    events: EventPublisher,
}

impl LifecycleEngine {
    pub fn new(
        incidents: Arc<dyn IncidentRepository>,
        inventory: Arc<dyn Inventory>,
        verifier: CredentialVerifier,
        events: EventPublisher,
    ) -> Self {
        Self {
            incidents,
            inventory,
            verifier,
            events,
        }
    }

    pub async fn list(&self, query: &UrgentQuery) -> Result<Vec<Incident>, LifecycleError> {
        let filters = compile_filters(query)?;
        Ok(self.incidents.list(&filters).await?)
    }

    /// Distinct machine labels among matching incidents. Machine filters are ignored.
    pub async fn machines(&self, query: &UrgentQuery) -> Result<Vec<String>, LifecycleError> {
        let filters = compile_filters(query)?.without_machine();
        Ok(self.incidents.distinct_machines(&filters).await?)
    }

    pub async fn declare(&self, req: DeclareRequest) -> Result<Vec<Incident>, LifecycleError> {
        let result = self.declare_inner(&req).await;
        observe("declare", &result);
        result
    }

    async fn declare_inner(&self, req: &DeclareRequest) -> Result<Vec<Incident>, LifecycleError> {
        let items = declarations(req)?;
        let declarer = self
            .verifier
            .verify(
                req.declarer_matricule.as_deref(),
                req.password.as_deref(),
                "declarerMatricule",
            )
            .await?;

        let unicos: Vec<String> = items.iter().map(|item| item.unico.clone()).collect();
        let missing = self.inventory.missing_unicos(&unicos).await?;
        if !missing.is_empty() {
            tracing::info!(missing = ?missing, "declaration references unknown unico");
            return Err(LifecycleError::MissingUnicos(missing));
        }

        let mut created = Vec::with_capacity(items.len());
        for item in items {
            let draft = item.into_draft(&declarer);
            let id = self.incidents.insert(&draft).await?;
            let incident = self.incidents.get(id).await?.ok_or_else(|| {
                StoreError::Corrupt(format!("declared urgent {} vanished before re-read", id))
            })?;

            tracing::info!(
                id,
                unico = %incident.unico,
                declared_by = %declarer.matricule,
                "urgent declared"
            );
            self.events.publish(UrgentEvent::added(&incident));
            created.push(incident);
        }

        Ok(created)
    }

    /// Flags the latest NOK incident for the reference code as running on a backup machine.
    /// This transition takes no credentials.
    pub async fn set_plan_b(&self, req: PlanBRequest) -> Result<PlanBResponse, LifecycleError> {
        let result = self.set_plan_b_inner(&req).await;
        observe("plan_b", &result);
        result
    }

    async fn set_plan_b_inner(&self, req: &PlanBRequest) -> Result<PlanBResponse, LifecycleError> {
        let unico = non_empty(req.unico.as_deref())
            .ok_or_else(|| LifecycleError::BadRequest("unico is required".to_string()))?;
        let mc_pb = non_empty(req.mc_pb.as_deref())
            .ok_or_else(|| LifecycleError::BadRequest("McPb is required".to_string()))?;

        let applied = self
            .incidents
            .apply_plan_b(&unico, &mc_pb)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("no NOK urgent found for {}", unico)))?;

        tracing::info!(id = applied.id, unico = %unico, mc_pb = %mc_pb, "plan-b applied");
        self.events
            .publish(UrgentEvent::plan_b(&applied, &unico, &mc_pb, Utc::now()));

        Ok(PlanBResponse {
            success: true,
            unico,
            mc_pb,
            plan_b: true,
        })
    }

    /// Resolves the latest NOK incident for each requested code, in request order.
    /// Codes with nothing to resolve are reported as skipped.
    pub async fn resolve(&self, req: ResolveRequest) -> Result<ResolveResponse, LifecycleError> {
        let result = self.resolve_inner(&req).await;
        observe("resolve", &result);
        if let Ok(response) = &result
            && !response.skipped.is_empty()
        {
            let skipped = response.skipped.len() as u64;
            crate::metrics::observe_transitions("resolve", "skipped", skipped);
        }
        result
    }

    async fn resolve_inner(&self, req: &ResolveRequest) -> Result<ResolveResponse, LifecycleError> {
        let targets = resolve_targets(req)?;
        let corrector = self
            .verifier
            .verify(
                req.corrector_matricule.as_deref(),
                req.password.as_deref(),
                "correctorMatricule",
            )
            .await?;

        let mut results = Vec::with_capacity(targets.len());
        let mut skipped = Vec::new();
        for unico in targets {
            let now = Utc::now();
            match self
                .incidents
                .resolve(&unico, &corrector.matricule, now)
                .await?
            {
                Some(incident) => {
                    tracing::info!(
                        id = incident.id,
                        unico = %unico,
                        corrected_by = %corrector.matricule,
                        "urgent resolved"
                    );
                    self.events.publish(UrgentEvent::resolved(
                        &incident,
                        &corrector.matricule,
                        now,
                    ));
                    results.push(incident);
                }
                None => {
                    tracing::debug!(unico = %unico, "nothing to resolve");
                    skipped.push(SkippedResolve {
                        unico,
                        reason: NO_NOK_URGENT_FOUND.to_string(),
                    });
                }
            }
        }

        Ok(ResolveResponse {
            count: results.len(),
            results,
            skipped,
        })
    }
}

fn compile_filters(query: &UrgentQuery) -> Result<FilterSet, LifecycleError> {
    FilterSet::from_query(query).map_err(|err| LifecycleError::BadRequest(err.message))
}

fn observe<T>(transition: &'static str, result: &Result<T, LifecycleError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => err.outcome(),
    };
    crate::metrics::observe_transition(transition, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Notifier;
    use crate::testing::MemoryStore;
    use tokio::sync::broadcast;
    use urgent_contracts::IncidentStatus;

    struct Harness {
        store: Arc<MemoryStore>,
        engine: LifecycleEngine,
        events: broadcast::Receiver<UrgentEvent>,
        _notifier: Notifier,
    }

    fn harness() -> Harness {
        let store = MemoryStore::seeded();
        let (publisher, notifier, _task) = Notifier::start(64);
        let events = notifier.subscribe();
        let engine = LifecycleEngine::new(
            store.clone(),
            store.clone(),
            CredentialVerifier::new(store.clone()),
            publisher,
        );
        Harness {
            store,
            engine,
            events,
            _notifier: notifier,
        }
    }

    fn declare_one(unico: &str, machine: &str) -> DeclareRequest {
        DeclareRequest {
            declarer_matricule: Some("1001".to_string()),
            password: Some("line-one".to_string()),
            urgents: None,
            single: DeclareItem {
                unico: Some(unico.to_string()),
                machine: Some(machine.to_string()),
                incident_type: Some("urgent".to_string()),
                ..DeclareItem::default()
            },
        }
    }

    fn resolve_req(unicos: &[&str]) -> ResolveRequest {
        ResolveRequest {
            unico: None,
            unicos: Some(unicos.iter().map(|u| u.to_string()).collect()),
            corrector_matricule: Some("2002".to_string()),
            password: Some("fix-it".to_string()),
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<UrgentEvent>) -> UrgentEvent {
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("event should arrive")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn declare_persists_decorated_incident_and_announces_it() {
        let mut h = harness();
        let created = h
            .engine
            .declare(declare_one(" LH-148031 ", "mc27"))
            .await
            .expect("declare should succeed");

        assert_eq!(created.len(), 1);
        let incident = &created[0];
        assert_eq!(incident.unico, "LH-148031");
        assert_eq!(incident.status, IncidentStatus::Nok);
        assert_eq!(incident.incident_type.as_deref(), Some("URGENT"));
        assert_eq!(incident.declared_by.first_name.as_deref(), Some("Amina"));
        assert!(incident.corrected_by.is_none());

        let event = next_event(&mut h.events).await;
        assert_eq!(event.name(), "urgent:added");
        assert_eq!(event.incident_id(), incident.id);
    }

    #[tokio::test]
    async fn unknown_unico_rejects_whole_batch() {
        let h = harness();
        let req = DeclareRequest {
            declarer_matricule: Some("1001".to_string()),
            password: Some("line-one".to_string()),
            urgents: Some(vec![
                DeclareItem {
                    unico: Some("LH-148031".to_string()),
                    machine: Some("MC27".to_string()),
                    ..DeclareItem::default()
                },
                DeclareItem {
                    unico: Some("NOPE-1".to_string()),
                    machine: Some("MC27".to_string()),
                    ..DeclareItem::default()
                },
            ]),
            single: DeclareItem::default(),
        };

        match h.engine.declare(req).await {
            Err(LifecycleError::MissingUnicos(missing)) => assert_eq!(missing, vec!["NOPE-1"]),
            other => panic!("expected missing unico, got {:?}", other),
        }
        assert_eq!(h.store.incident_count(), 0);
    }

    #[tokio::test]
    async fn batch_skips_incomplete_items_but_rejects_when_none_remain() {
        let h = harness();
        let mut req = declare_one("LH-148031", "MC27");
        req.urgents = Some(vec![
            DeclareItem {
                unico: Some("LH-148031".to_string()),
                machine: Some("MC27".to_string()),
                ..DeclareItem::default()
            },
            DeclareItem {
                unico: Some("LH-148032".to_string()),
                ..DeclareItem::default()
            },
        ]);
        let created = h.engine.declare(req.clone()).await.expect("declare batch");
        assert_eq!(created.len(), 1);

        req.urgents = Some(vec![DeclareItem {
            machine: Some("MC27".to_string()),
            ..DeclareItem::default()
        }]);
        assert!(matches!(
            h.engine.declare(req).await,
            Err(LifecycleError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn bad_credentials_write_nothing_and_emit_nothing() {
        let mut h = harness();
        let mut req = declare_one("LH-148031", "MC27");
        req.password = Some("wrong".to_string());

        assert!(matches!(
            h.engine.declare(req).await,
            Err(LifecycleError::Unauthorized)
        ));
        assert_eq!(h.store.incident_count(), 0);
        assert!(matches!(
            h.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn resolve_reports_skips_and_is_idempotent_per_incident() {
        let mut h = harness();
        let declared = h
            .engine
            .declare(declare_one("LH-148031", "MC27"))
            .await
            .expect("declare");
        let _ = next_event(&mut h.events).await;

        let first = h
            .engine
            .resolve(resolve_req(&["LH-148031", "LH-200100"]))
            .await
            .expect("resolve");
        assert_eq!(first.count, 1);
        assert_eq!(first.results[0].id, declared[0].id);
        assert_eq!(first.results[0].status, IncidentStatus::Ok);
        assert_eq!(
            first.results[0]
                .corrected_by
                .as_ref()
                .and_then(|c| c.last_name.as_deref()),
            Some("Keller")
        );
        assert_eq!(first.skipped.len(), 1);
        assert_eq!(first.skipped[0].unico, "LH-200100");
        assert_eq!(first.skipped[0].reason, NO_NOK_URGENT_FOUND);

        let event = next_event(&mut h.events).await;
        assert_eq!(event.name(), "urgent:resolved");

        let second = h
            .engine
            .resolve(resolve_req(&["LH-148031"]))
            .await
            .expect("second resolve");
        assert_eq!(second.count, 0);
        assert_eq!(second.skipped.len(), 1);
        assert!(matches!(
            h.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn transitions_target_the_latest_active_incident() {
        let h = harness();
        let older = h
            .engine
            .declare(declare_one("LH-148031", "MC27"))
            .await
            .expect("declare older");
        let newer = h
            .engine
            .declare(declare_one("LH-148031", "MC28"))
            .await
            .expect("declare newer");

        let resolved = h
            .engine
            .resolve(resolve_req(&["LH-148031"]))
            .await
            .expect("resolve");
        assert_eq!(resolved.results[0].id, newer[0].id);

        let again = h
            .engine
            .resolve(resolve_req(&["LH-148031"]))
            .await
            .expect("resolve older");
        assert_eq!(again.results[0].id, older[0].id);
    }

    #[tokio::test]
    async fn plan_b_requires_active_incident_and_no_credentials() {
        let mut h = harness();
        let req = PlanBRequest {
            unico: Some("LH-148031".to_string()),
            mc_pb: Some("mc30".to_string()),
        };
        assert!(matches!(
            h.engine.set_plan_b(req.clone()).await,
            Err(LifecycleError::NotFound(_))
        ));

        let declared = h
            .engine
            .declare(declare_one("LH-148031", "MC27"))
            .await
            .expect("declare");
        let _ = next_event(&mut h.events).await;

        let response = h.engine.set_plan_b(req).await.expect("plan-b");
        assert!(response.success && response.plan_b);
        assert_eq!(response.mc_pb, "mc30");

        let event = next_event(&mut h.events).await;
        assert_eq!(event.name(), "urgent:planb");
        assert_eq!(event.incident_id(), declared[0].id);

        let listed = h
            .engine
            .list(&UrgentQuery::default())
            .await
            .expect("list");
        assert!(listed[0].plan_b);
        assert_eq!(listed[0].mc_pb.as_deref(), Some("mc30"));
    }

    #[tokio::test]
    async fn plan_b_validates_fields_before_store_access() {
        let h = harness();
        h.store.set_failing(true);
        let err = h
            .engine
            .set_plan_b(PlanBRequest {
                unico: Some("LH-148031".to_string()),
                mc_pb: Some("  ".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::BadRequest(ref m) if m.contains("McPb")));
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_internal_without_events() {
        let mut h = harness();
        h.store.set_failing(true);
        assert!(matches!(
            h.engine.declare(declare_one("LH-148031", "MC27")).await,
            Err(LifecycleError::Internal(_))
        ));
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn machines_ignore_machine_filters() {
        let h = harness();
        h.engine
            .declare(declare_one("LH-148031", "mc27"))
            .await
            .expect("declare");
        h.engine
            .declare(declare_one("LH-148032", "MC28 "))
            .await
            .expect("declare");

        let query = UrgentQuery {
            machine: Some("MC27".to_string()),
            ..UrgentQuery::default()
        };
        let machines = h.engine.machines(&query).await.expect("machines");
        assert_eq!(machines, vec!["MC27".to_string(), "MC28".to_string()]);

        let listed = h.engine.list(&query).await.expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn unknown_status_filter_is_rejected() {
        let h = harness();
        let query = UrgentQuery {
            status: Some("closed".to_string()),
            ..UrgentQuery::default()
        };
        assert!(matches!(
            h.engine.list(&query).await,
            Err(LifecycleError::BadRequest(_))
        ));
    }

    #[test]
    fn resolve_targets_prefer_list_and_drop_blanks() {
        let req = ResolveRequest {
            unico: Some("IGNORED".to_string()),
            unicos: Some(vec![" A ".to_string(), "".to_string(), "B".to_string()]),
            corrector_matricule: None,
            password: None,
        };
        assert_eq!(resolve_targets(&req).expect("targets"), vec!["A", "B"]);

        let empty = ResolveRequest::default();
        assert!(resolve_targets(&empty).is_err());
    }

    #[test]
    fn resolve_targets_fall_back_to_single_code_when_list_is_blank() {
        let req = ResolveRequest {
            unico: Some(" LH-148031 ".to_string()),
            unicos: Some(vec!["  ".to_string()]),
            corrector_matricule: None,
            password: None,
        };
        assert_eq!(resolve_targets(&req).expect("targets"), vec!["LH-148031"]);

        let req = ResolveRequest {
            unicos: Some(Vec::new()),
            ..req
        };
        assert_eq!(resolve_targets(&req).expect("targets"), vec!["LH-148031"]);
    }

    #[tokio::test]
    async fn batch_events_follow_result_order() {
        let mut h = harness();
        let mut req = declare_one("unused", "unused");
        req.urgents = Some(
            ["ZX-0007", "LH-148031", "LH-148032"]
                .iter()
                .map(|unico| DeclareItem {
                    unico: Some(unico.to_string()),
                    machine: Some("MC27".to_string()),
                    ..DeclareItem::default()
                })
                .collect(),
        );

        let created = h.engine.declare(req).await.expect("declare batch");
        let unicos: Vec<&str> = created.iter().map(|i| i.unico.as_str()).collect();
        assert_eq!(unicos, vec!["ZX-0007", "LH-148031", "LH-148032"]);
        for incident in &created {
            let event = next_event(&mut h.events).await;
            assert_eq!(event.name(), "urgent:added");
            assert_eq!(event.incident_id(), incident.id);
            assert_eq!(event.unico(), incident.unico);
        }

        let resolved = h
            .engine
            .resolve(resolve_req(&["LH-148032", "ZX-0007"]))
            .await
            .expect("resolve batch");
        let unicos: Vec<&str> = resolved.results.iter().map(|i| i.unico.as_str()).collect();
        assert_eq!(unicos, vec!["LH-148032", "ZX-0007"]);
        for incident in &resolved.results {
            let event = next_event(&mut h.events).await;
            assert_eq!(event.name(), "urgent:resolved");
            assert_eq!(event.incident_id(), incident.id);
            assert_eq!(event.unico(), incident.unico);
        }
        assert!(matches!(
            h.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn declared_row_missing_on_reread_is_an_internal_error() {
        let mut h = harness();
        h.store.set_lose_reads(true);

        match h.engine.declare(declare_one("LH-148031", "MC27")).await {
            Err(LifecycleError::Internal(StoreError::Corrupt(detail))) => {
                assert!(detail.contains("vanished"))
            }
            other => panic!("expected corrupt store error, got {:?}", other),
        }
        assert!(matches!(
            h.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn skipped_resolves_are_counted_per_code() {
        let h = harness();
        let before = crate::metrics::transition_count("resolve", "skipped");

        let response = h
            .engine
            .resolve(resolve_req(&["LH-148031", "LH-148032", "LH-200100"]))
            .await
            .expect("resolve");
        assert_eq!(response.skipped.len(), 3);

        let after = crate::metrics::transition_count("resolve", "skipped");
        assert!(after - before >= 3, "expected at least 3 skips counted");
    }
}
