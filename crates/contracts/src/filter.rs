use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::normalize::{machine_key, normalize_badge};
use crate::{Incident, IncidentStatus, Operator, UrgentQuery};

/// One typed listing filter. String payloads are stored already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncidentFilter {
    StatusEquals(IncidentStatus),
    UnicoContains(String),
    MachineEquals(String),
    MachineIn(Vec<String>),
    MachineContains(String),
    DeclaredFrom(DateTime<Utc>),
    DeclaredTo(DateTime<Utc>),
    DeclaredByContains(String),
    CorrectedByContains(String),
}

impl IncidentFilter {
    pub fn is_machine_filter(&self) -> bool {
        matches!(
            self,
            IncidentFilter::MachineEquals(_)
                | IncidentFilter::MachineIn(_)
                | IncidentFilter::MachineContains(_)
        )
    }

    pub fn matches(&self, incident: &Incident) -> bool {
        match self {
            IncidentFilter::StatusEquals(status) => incident.status == *status,
            IncidentFilter::UnicoContains(needle) => {
                incident.unico.trim().to_lowercase().contains(needle.as_str())
            }
            IncidentFilter::MachineEquals(machine) => machine_key(&incident.machine) == *machine,
            IncidentFilter::MachineIn(machines) => {
                let key = machine_key(&incident.machine);
                machines.iter().any(|m| *m == key)
            }
            IncidentFilter::MachineContains(needle) => {
                machine_key(&incident.machine).contains(needle.as_str())
            }
            IncidentFilter::DeclaredFrom(from) => incident.declared_at >= *from,
            IncidentFilter::DeclaredTo(to) => incident.declared_at <= *to,
            IncidentFilter::DeclaredByContains(needle) => {
                operator_matches(&incident.declared_by, needle)
            }
            IncidentFilter::CorrectedByContains(needle) => incident
                .corrected_by
                .as_ref()
                .is_some_and(|op| operator_matches(op, needle)),
        }
    }
}

fn operator_matches(operator: &Operator, needle: &str) -> bool {
    let contains = |value: Option<&str>| {
        value.is_some_and(|v| v.to_lowercase().contains(needle))
    };

    normalize_badge(&operator.matricule)
        .to_lowercase()
        .contains(needle)
        || contains(operator.first_name.as_deref())
        || contains(operator.last_name.as_deref())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError {
    pub message: String,
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid filter: {}", self.message)
    }
}

impl std::error::Error for FilterError {}

/// Conjunction of typed filters. An empty set matches every incident.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    filters: Vec<IncidentFilter>,
}

impl FilterSet {
    pub fn new(filters: Vec<IncidentFilter>) -> Self {
        Self { filters }
    }

    pub fn from_query(query: &UrgentQuery) -> Result<Self, FilterError> {
        let mut filters = Vec::new();

        if let Some(raw) = present(&query.status) {
            let status = IncidentStatus::parse(raw).ok_or_else(|| FilterError {
                message: format!("status must be NOK or OK, got `{}`", raw),
            })?;
            filters.push(IncidentFilter::StatusEquals(status));
        }

        if let Some(raw) = present(&query.unico) {
            filters.push(IncidentFilter::UnicoContains(raw.to_lowercase()));
        }

        let machine_list = present(&query.machines)
            .map(parse_machine_list)
            .filter(|list| !list.is_empty());
        match machine_list {
            Some(list) => filters.push(IncidentFilter::MachineIn(list)),
            None => {
                if let Some(raw) = present(&query.machine) {
                    let key = machine_key(raw);
                    if !key.is_empty() {
                        filters.push(IncidentFilter::MachineEquals(key));
                    }
                }
            }
        }

        if let Some(raw) = present(&query.machine_like) {
            let key = machine_key(raw);
            if !key.is_empty() {
                filters.push(IncidentFilter::MachineContains(key));
            }
        }

        if let Some(from) = present(&query.from).and_then(parse_timestamp) {
            filters.push(IncidentFilter::DeclaredFrom(from));
        }
        if let Some(to) = present(&query.to).and_then(parse_timestamp) {
            filters.push(IncidentFilter::DeclaredTo(to));
        }

        if let Some(raw) = present(&query.declared_by) {
            filters.push(IncidentFilter::DeclaredByContains(actor_needle(raw)));
        }
        if let Some(raw) = present(&query.corrected_by) {
            filters.push(IncidentFilter::CorrectedByContains(actor_needle(raw)));
        }

        Ok(Self { filters })
    }

    pub fn without_machine(&self) -> Self {
        Self {
            filters: self
                .filters
                .iter()
                .filter(|f| !f.is_machine_filter())
                .cloned()
                .collect(),
        }
    }

    pub fn matches(&self, incident: &Incident) -> bool {
        self.filters.iter().all(|f| f.matches(incident))
    }

    pub fn iter(&self) -> impl Iterator<Item = &IncidentFilter> {
        self.filters.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_machine_list(raw: &str) -> Vec<String> {
    let mut out = raw
        .split(',')
        .map(machine_key)
        .filter(|m| !m.is_empty())
        .collect::<Vec<_>>();
    out.sort();
    out.dedup();
    out
}

fn actor_needle(raw: &str) -> String {
    normalize_badge(raw).to_lowercase()
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS` / `YYYY-MM-DD HH:MM:SS` (UTC) and `YYYY-MM-DD`
/// (UTC midnight).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
