use chrono::{DateTime, Utc};
use sqlx::Postgres;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use urgent_contracts::filter::{FilterSet, IncidentFilter};

/// Folds tabs and non-breaking spaces into plain spaces and trims, mirroring
/// `urgent_contracts::normalize::normalize_spacing`.
pub fn spacing_sql(column: &str) -> String {
    format!(
        "BTRIM(REPLACE(REPLACE({}::text, chr(9), ' '), chr(160), ' '))",
        column
    )
}

pub fn machine_key_sql() -> String {
    format!("LOWER({})", spacing_sql("u.machine"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindValue {
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// A parameterized WHERE body. Placeholders are numbered from `$1` in `binds` order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    pub clause: String,
    pub binds: Vec<BindValue>,
}

impl Predicate {
    pub fn where_sql(&self) -> String {
        if self.clause.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clause)
        }
    }

    pub fn bind_all<'q>(
        &'q self,
        mut query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        for value in &self.binds {
            query = match value {
                BindValue::Text(v) => query.bind(v.as_str()),
                BindValue::Timestamp(ts) => query.bind(*ts),
            };
        }
        query
    }

    fn push(&mut self, value: BindValue) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }
}

/// Compiles the filter set against `urgents u` joined with declarer `d` and corrector `c`.
pub fn compile(filters: &FilterSet) -> Predicate {
    let mut predicate = Predicate::default();
    let mut fragments = Vec::with_capacity(filters.len());
    let machine_key = machine_key_sql();

    for filter in filters.iter() {
        let fragment = match filter {
            IncidentFilter::StatusEquals(status) => {
                let p = predicate.push(BindValue::Text(status.as_str().to_string()));
                format!("u.status = {}", p)
            }
            IncidentFilter::UnicoContains(needle) => {
                let p = predicate.push(BindValue::Text(like_contains(needle)));
                format!("LOWER(BTRIM(u.unico)) LIKE {}", p)
            }
            IncidentFilter::MachineEquals(machine) => {
                let p = predicate.push(BindValue::Text(machine.clone()));
                format!("{} = {}", machine_key, p)
            }
            IncidentFilter::MachineIn(machines) => {
                let alternatives = machines
                    .iter()
                    .map(|m| {
                        let p = predicate.push(BindValue::Text(m.clone()));
                        format!("{} = {}", machine_key, p)
                    })
                    .collect::<Vec<_>>();
                format!("({})", alternatives.join(" OR "))
            }
            IncidentFilter::MachineContains(needle) => {
                let p = predicate.push(BindValue::Text(like_contains(needle)));
                format!("{} LIKE {}", machine_key, p)
            }
            IncidentFilter::DeclaredFrom(from) => {
                let p = predicate.push(BindValue::Timestamp(*from));
                format!("u.declared_at >= {}", p)
            }
            IncidentFilter::DeclaredTo(to) => {
                let p = predicate.push(BindValue::Timestamp(*to));
                format!("u.declared_at <= {}", p)
            }
            IncidentFilter::DeclaredByContains(needle) => {
                let p = predicate.push(BindValue::Text(like_contains(needle)));
                actor_group("u.declared_by", "d", &p)
            }
            IncidentFilter::CorrectedByContains(needle) => {
                let p = predicate.push(BindValue::Text(like_contains(needle)));
                actor_group("u.corrected_by", "c", &p)
            }
        };
        fragments.push(fragment);
    }

    predicate.clause = fragments.join(" AND ");
    predicate
}

fn actor_group(badge_column: &str, alias: &str, param: &str) -> String {
    format!(
        "(LOWER({badge}) LIKE {p} OR LOWER(COALESCE({a}.first_name, '')) LIKE {p} OR LOWER(COALESCE({a}.last_name, '')) LIKE {p})",
        badge = spacing_sql(badge_column),
        a = alias,
        p = param,
    )
}

fn like_contains(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for ch in needle.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}
