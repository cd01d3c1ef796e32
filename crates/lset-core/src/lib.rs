//! Canonical entity schema, date normalization, and record standardization for LSET.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

pub const CRATE_NAME: &str = "lset-core";

/// Timestamp layout used for every date field persisted by the tracker.
pub const CANONICAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

pub const ID_FIELD: &str = "id";
pub const DOMAIN_FIELD: &str = "domain";
pub const FIRST_SEEN_FIELD: &str = "first_seen";
pub const GROUP_KEY_FIELD: &str = "group_key";
pub const GROUP_NAME_FIELD: &str = "ransomware_group";

const IDENTITY_SEPARATOR: char = ':';
const COUNTDOWN_TEXT_SUBFIELD: &str = "countdown_text";

/// Coercion applied to a canonical field by the standardizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Copied as-is; upstream sources disagree on the value shape.
    Text,
    /// Best-effort integer coercion; the original value survives a failed parse.
    Integer,
    /// Run through the date normalizer.
    Date,
    /// Nested countdown sub-structure.
    Countdown,
}

/// One row of the declarative schema driving standardization and merge.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Set on first insert, never overwritten by a later upsert.
    pub write_once: bool,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        write_once: false,
    }
}

/// The fixed canonical field set. Every persisted record carries exactly
/// these fields, with explicit nulls for anything the source omitted.
pub const CANONICAL_FIELDS: [FieldSpec; 16] = [
    field(ID_FIELD, FieldKind::Text),
    field(DOMAIN_FIELD, FieldKind::Text),
    field("status", FieldKind::Text),
    field("description_preview", FieldKind::Text),
    field("updated", FieldKind::Date),
    field("views", FieldKind::Integer),
    field("countdown_remaining", FieldKind::Countdown),
    field("estimated_publish_date", FieldKind::Date),
    FieldSpec {
        name: FIRST_SEEN_FIELD,
        kind: FieldKind::Date,
        write_once: true,
    },
    field(GROUP_NAME_FIELD, FieldKind::Text),
    field(GROUP_KEY_FIELD, FieldKind::Text),
    field("country", FieldKind::Text),
    field("data_size", FieldKind::Text),
    field("last_view", FieldKind::Date),
    field("visits", FieldKind::Integer),
    field("class", FieldKind::Text),
];

pub const COUNTDOWN_SUBFIELDS: [&str; 5] =
    [COUNTDOWN_TEXT_SUBFIELD, "days", "hours", "minutes", "seconds"];

/// One tracked leak-site entry with the full canonical field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRecord(Map<String, Value>);

impl EntityRecord {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// Deduplication key, present whenever both identity fields exist.
    pub fn identity_key(&self) -> Option<String> {
        identity_key_of(&self.0)
    }
}

fn key_component(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// `id` + `domain` joined with a separator; None when either field is absent.
pub fn identity_key_of(map: &Map<String, Value>) -> Option<String> {
    let id = map.get(ID_FIELD)?;
    let domain = map.get(DOMAIN_FIELD)?;
    Some(format!(
        "{}{}{}",
        key_component(id),
        IDENTITY_SEPARATOR,
        key_component(domain)
    ))
}

/// Outcome of best-effort date normalization. `Unparsed` carries the original
/// string so an unrecognized timestamp never drops a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedDate {
    Canonical(String),
    Unparsed(String),
}

impl NormalizedDate {
    pub fn into_string(self) -> String {
        match self {
            NormalizedDate::Canonical(text) | NormalizedDate::Unparsed(text) => text,
        }
    }

    pub fn is_canonical(&self) -> bool {
        matches!(self, NormalizedDate::Canonical(_))
    }
}

type DateMatcher = fn(&str) -> Option<String>;

/// Ordered strategy list; the first matcher to recognize the input wins.
const DATE_MATCHERS: [DateMatcher; 6] = [
    already_canonical,
    named_month,
    slash_delimited,
    missing_zone,
    foreign_zone,
    alternate_formats,
];

/// Rewrite a heterogeneous upstream timestamp into the canonical layout.
pub fn normalize_date(raw: &str) -> NormalizedDate {
    for matcher in DATE_MATCHERS {
        if let Some(canonical) = matcher(raw) {
            return NormalizedDate::Canonical(canonical);
        }
    }
    warn!(raw, "no known timestamp layout matched; keeping original value");
    NormalizedDate::Unparsed(raw.to_string())
}

fn already_canonical(input: &str) -> Option<String> {
    NaiveDateTime::parse_from_str(input, CANONICAL_TIME_FORMAT).ok()?;
    Some(input.to_string())
}

/// Named-month form used by LockBit-style pages, e.g. "12 Aug, 2024, 11:05 UTC".
fn named_month(input: &str) -> Option<String> {
    let parsed = NaiveDateTime::parse_from_str(input, "%d %b, %Y, %H:%M UTC").ok()?;
    Some(parsed.format(CANONICAL_TIME_FORMAT).to_string())
}

fn slash_delimited(input: &str) -> Option<String> {
    let parsed = NaiveDateTime::parse_from_str(input, "%Y/%m/%d %H:%M:%S").ok()?;
    Some(parsed.format(CANONICAL_TIME_FORMAT).to_string())
}

fn missing_zone(input: &str) -> Option<String> {
    NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(format!("{input} UTC"))
}

/// A different timezone abbreviation gets relabeled; the clock value is kept
/// as-is rather than offset-converted.
fn foreign_zone(input: &str) -> Option<String> {
    let (stamp, zone) = input.rsplit_once(' ')?;
    if zone.is_empty() || !zone.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(format!("{stamp} UTC"))
}

const ALTERNATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M",
    "%d %b %Y %H:%M",
    "%d %B %Y %H:%M",
];

fn alternate_formats(input: &str) -> Option<String> {
    ALTERNATE_FORMATS.iter().find_map(|layout| {
        NaiveDateTime::parse_from_str(input, layout)
            .ok()
            .map(|parsed| parsed.format(CANONICAL_TIME_FORMAT).to_string())
    })
}

/// Map an arbitrary upstream record onto the canonical schema.
pub fn standardize_record(input: &Map<String, Value>) -> EntityRecord {
    standardize_with_group(input, None)
}

/// Standardize and, when the input lacks attribution, stamp the supplied
/// source group onto `group_key`/`ransomware_group`. Used when replaying
/// per-group shard files whose records predate attribution.
pub fn standardize_with_group(input: &Map<String, Value>, group: Option<&str>) -> EntityRecord {
    let mut out = Map::new();
    for spec in CANONICAL_FIELDS {
        let value = input.get(spec.name).cloned().unwrap_or(Value::Null);
        let value = match spec.kind {
            FieldKind::Text => value,
            FieldKind::Date => normalize_date_value(value),
            FieldKind::Integer => coerce_integer(value),
            FieldKind::Countdown => normalize_countdown(value),
        };
        out.insert(spec.name.to_string(), value);
    }

    if let Some(group) = group {
        for name in [GROUP_KEY_FIELD, GROUP_NAME_FIELD] {
            if out.get(name).map(Value::is_null).unwrap_or(true) {
                out.insert(name.to_string(), Value::String(group.to_string()));
            }
        }
    }

    EntityRecord(out)
}

fn normalize_date_value(value: Value) -> Value {
    match value {
        Value::String(text) if text.is_empty() => Value::Null,
        Value::String(text) => Value::String(normalize_date(&text).into_string()),
        other => other,
    }
}

fn coerce_integer(value: Value) -> Value {
    let coerced = match &value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    match coerced {
        Some(n) => Value::from(n),
        None => value,
    }
}

/// Countdown invariant: if present at all, all five subfields exist; a
/// non-structured value is wrapped as its text form.
fn normalize_countdown(value: Value) -> Value {
    let mut fields = match value {
        Value::Null => return Value::Null,
        Value::Object(map) => map,
        Value::String(text) => {
            let mut map = Map::new();
            map.insert(COUNTDOWN_TEXT_SUBFIELD.to_string(), Value::String(text));
            map
        }
        other => {
            let mut map = Map::new();
            map.insert(
                COUNTDOWN_TEXT_SUBFIELD.to_string(),
                Value::String(other.to_string()),
            );
            map
        }
    };

    for name in COUNTDOWN_SUBFIELDS {
        fields.entry(name).or_insert(Value::Null);
    }
    Value::Object(fields)
}
