/// Placeholder some line terminals store instead of leaving the machine blank.
pub const MACHINE_PLACEHOLDER: &str = "-";

const NBSP: char = '\u{a0}';

/// Replaces tabs and non-breaking spaces with a plain space and trims the result.
pub fn normalize_spacing(raw: &str) -> String {
    raw.replace(['\t', NBSP], " ").trim().to_string()
}

/// Comparison key for machine identifiers.
pub fn machine_key(raw: &str) -> String {
    normalize_spacing(raw).to_lowercase()
}

/// Grouping label for machine identifiers, as returned by the distinct machines listing.
pub fn machine_label(raw: &str) -> Option<String> {
    let label = normalize_spacing(raw).to_uppercase();
    (!label.is_empty() && label != MACHINE_PLACEHOLDER).then_some(label)
}

pub fn normalize_badge(raw: &str) -> String {
    normalize_spacing(raw)
}

/// Trimmed, upper-cased free-text annotation (`type`, `timeRemaining`); blanks become `None`.
pub fn normalize_annotation(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
}

pub fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
