use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod filter;
pub mod normalize;

pub const NO_NOK_URGENT_FOUND: &str = "No NOK urgent found";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentStatus {
    #[serde(rename = "NOK")]
    Nok,
    #[serde(rename = "OK")]
    Ok,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Nok => "NOK",
            IncidentStatus::Ok => "OK",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NOK" => Some(IncidentStatus::Nok),
            "OK" => Some(IncidentStatus::Ok),
            _ => None,
        }
    }
}

/// Operator identity as read from the user directory. Display fields may be blank upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub matricule: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<String>,
}

impl Operator {
    pub fn bare(matricule: impl Into<String>) -> Self {
        Self {
            matricule: matricule.into(),
            first_name: None,
            last_name: None,
            role: None,
        }
    }
}

/// A decorated incident row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: i32,
    pub unico: String,
    pub machine: String,
    pub status: IncidentStatus,
    #[serde(rename = "type")]
    pub incident_type: Option<String>,
    pub time_remaining: Option<String>,
    pub plan_b: bool,
    pub mc_pb: Option<String>,
    pub declared_by: Operator,
    pub declared_at: DateTime<Utc>,
    pub corrected_by: Option<Operator>,
    pub corrected_at: Option<DateTime<Utc>>,
}

/// A validated declaration ready to be persisted with status NOK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentDraft {
    pub unico: String,
    pub machine: String,
    pub incident_type: Option<String>,
    pub time_remaining: Option<String>,
    pub plan_b: bool,
    pub mc_pb: Option<String>,
    pub declared_by: String,
    pub declared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanBApplied {
    pub id: i32,
    pub machine: String,
    pub incident_type: Option<String>,
}

/// Raw query-string filters for the listing endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrgentQuery {
    pub status: Option<String>,
    pub unico: Option<String>,
    pub machine: Option<String>,
    pub machines: Option<String>,
    pub machine_like: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub declared_by: Option<String>,
    pub corrected_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclareItem {
    pub unico: Option<String>,
    pub machine: Option<String>,
    pub plan_b: Option<bool>,
    pub mc_pb: Option<String>,
    #[serde(rename = "type")]
    pub incident_type: Option<String>,
    pub time_remaining: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclareRequest {
    pub declarer_matricule: Option<String>,
    pub password: Option<String>,
    pub urgents: Option<Vec<DeclareItem>>,
    #[serde(flatten)]
    pub single: DeclareItem,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanBRequest {
    pub unico: Option<String>,
    #[serde(rename = "McPb", alias = "mcPb")]
    pub mc_pb: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub unico: Option<String>,
    pub unicos: Option<Vec<String>>,
    pub corrector_matricule: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub count: usize,
    pub results: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(results: Vec<T>) -> Self {
        Self {
            count: results.len(),
            results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanBResponse {
    pub success: bool,
    pub unico: String,
    #[serde(rename = "McPb")]
    pub mc_pb: String,
    #[serde(rename = "Plan_B")]
    pub plan_b: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedResolve {
    pub unico: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub count: usize,
    pub results: Vec<Incident>,
    pub skipped: Vec<SkippedResolve>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentAdded {
    pub id: i32,
    pub unico: String,
    pub machine: String,
    #[serde(rename = "type")]
    pub incident_type: Option<String>,
    pub declared_at: DateTime<Utc>,
    pub declared_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanBFlagged {
    pub id: i32,
    pub unico: String,
    pub machine: String,
    #[serde(rename = "type")]
    pub incident_type: Option<String>,
    pub mc_pb: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentResolved {
    pub id: i32,
    pub unico: String,
    pub machine: String,
    #[serde(rename = "type")]
    pub incident_type: Option<String>,
    pub corrected_at: DateTime<Utc>,
    pub corrected_by: String,
}

/// Realtime notification, serialized as `{"event": "urgent:…", "payload": {…}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum UrgentEvent {
    #[serde(rename = "urgent:added")]
    Added(IncidentAdded),
    #[serde(rename = "urgent:planb")]
    PlanB(PlanBFlagged),
    #[serde(rename = "urgent:resolved")]
    Resolved(IncidentResolved),
}

impl UrgentEvent {
    pub fn added(incident: &Incident) -> Self {
        UrgentEvent::Added(IncidentAdded {
            id: incident.id,
            unico: incident.unico.clone(),
            machine: incident.machine.clone(),
            incident_type: incident.incident_type.clone(),
            declared_at: incident.declared_at,
            declared_by: incident.declared_by.matricule.clone(),
        })
    }

    pub fn plan_b(applied: &PlanBApplied, unico: &str, mc_pb: &str, at: DateTime<Utc>) -> Self {
        UrgentEvent::PlanB(PlanBFlagged {
            id: applied.id,
            unico: unico.to_string(),
            machine: applied.machine.clone(),
            incident_type: applied.incident_type.clone(),
            mc_pb: mc_pb.to_string(),
            at,
        })
    }

    /// Builds the resolution event; `corrector` is the verified badge that performed it.
    pub fn resolved(incident: &Incident, corrector: &str, corrected_at: DateTime<Utc>) -> Self {
        UrgentEvent::Resolved(IncidentResolved {
            id: incident.id,
            unico: incident.unico.clone(),
            machine: incident.machine.clone(),
            incident_type: incident.incident_type.clone(),
            corrected_at: incident.corrected_at.unwrap_or(corrected_at),
            corrected_by: corrector.to_string(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            UrgentEvent::Added(_) => "urgent:added",
            UrgentEvent::PlanB(_) => "urgent:planb",
            UrgentEvent::Resolved(_) => "urgent:resolved",
        }
    }

    pub fn incident_id(&self) -> i32 {
        match self {
            UrgentEvent::Added(e) => e.id,
            UrgentEvent::PlanB(e) => e.id,
            UrgentEvent::Resolved(e) => e.id,
        }
    }

    pub fn unico(&self) -> &str {
        match self {
            UrgentEvent::Added(e) => &e.unico,
            UrgentEvent::PlanB(e) => &e.unico,
            UrgentEvent::Resolved(e) => &e.unico,
        }
    }
}
