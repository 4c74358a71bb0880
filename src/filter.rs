//! Saved image filters and the eligible-set evaluation built on them.
//!
//! Filters are stored as react-querybuilder groups:
//!
//! ```json
//! { "combinator": "and",
//!   "rules": [ { "field": "directory", "operator": "contains", "value": "kenya" },
//!              { "combinator": "or", "rules": [ ... ] } ] }
//! ```
//!
//! A group without rules matches every image.

use std::sync::Arc;

use gallery_model::{FilterId, Image};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FilterError;
use crate::library::ImageStore;
use crate::settings::SettingsStore;

/// A filter as persisted in the settings store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedFilter {
    pub name: String,
    /// The query document, either inline or as a JSON string.
    pub query: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextField {
    Filename,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumberField {
    AspectWidth,
    AspectHeight,
}

#[derive(Debug, Clone, PartialEq)]
enum TextOp {
    Equals(String),
    NotEquals(String),
    Contains(String),
    BeginsWith(String),
    EndsWith(String),
    DoesNotContain(String),
    DoesNotBeginWith(String),
    DoesNotEndWith(String),
    Null,
    NotNull,
    In(Vec<String>),
    NotIn(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NumberOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    #[doc(hidden)]
    Text(TextRule),
    #[doc(hidden)]
    Number(NumberRule),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextRule {
    field: TextField,
    op: TextOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberRule {
    field: NumberField,
    op: NumberOp,
    value: f64,
}

impl Predicate {
    /// Accepts every image.
    pub fn everything() -> Self {
        Predicate::All(Vec::new())
    }

    pub fn parse(query: &Value) -> Result<Self, FilterError> {
        match query {
            Value::String(raw) => {
                let parsed: Value =
                    serde_json::from_str(raw).map_err(|err| FilterError::InvalidValue {
                        field: "query".into(),
                        reason: err.to_string(),
                    })?;
                parse_group(&parsed)
            }
            other => parse_group(other),
        }
    }

    pub fn matches(&self, image: &Image) -> bool {
        match self {
            Predicate::All(parts) => parts.iter().all(|p| p.matches(image)),
            Predicate::Any(parts) => parts.iter().any(|p| p.matches(image)),
            Predicate::Text(rule) => rule.matches(image),
            Predicate::Number(rule) => rule.matches(image),
        }
    }
}

fn parse_group(group: &Value) -> Result<Predicate, FilterError> {
    let rules = group
        .get("rules")
        .and_then(Value::as_array)
        .ok_or_else(|| FilterError::InvalidValue {
            field: "rules".into(),
            reason: "query group is missing its rules".into(),
        })?;

    let mut parts = Vec::with_capacity(rules.len());
    for rule in rules {
        if rule.get("rules").is_some() {
            parts.push(parse_group(rule)?);
        } else {
            parts.push(parse_rule(rule)?);
        }
    }

    let combinator = group
        .get("combinator")
        .and_then(Value::as_str)
        .unwrap_or("and")
        .to_ascii_lowercase();
    let predicate = match combinator.as_str() {
        "and" => Predicate::All(parts),
        // An empty `or` would match nothing; an empty group matches all.
        "or" if parts.is_empty() => Predicate::everything(),
        "or" => Predicate::Any(parts),
        _ => return Err(FilterError::UnsupportedCombinator(combinator)),
    };
    Ok(predicate)
}

fn parse_rule(rule: &Value) -> Result<Predicate, FilterError> {
    let field = rule
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| FilterError::InvalidValue {
            field: "field".into(),
            reason: "rule has no field".into(),
        })?;
    let operator = rule
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| FilterError::InvalidValue {
            field: field.to_string(),
            reason: "rule has no operator".into(),
        })?;
    let value = rule.get("value").unwrap_or(&Value::Null);

    match field {
        "filename" => text_rule(TextField::Filename, field, operator, value),
        "directory" => text_rule(TextField::Directory, field, operator, value),
        "aspect_ratio_width" => number_rule(NumberField::AspectWidth, field, operator, value),
        "aspect_ratio_height" => number_rule(NumberField::AspectHeight, field, operator, value),
        other => Err(FilterError::UnsupportedField(other.to_string())),
    }
}

fn text_rule(
    field: TextField,
    name: &str,
    operator: &str,
    value: &Value,
) -> Result<Predicate, FilterError> {
    let text = || text_value(name, value);
    let op = match operator {
        "=" => TextOp::Equals(text()?),
        "!=" => TextOp::NotEquals(text()?),
        "contains" => TextOp::Contains(text()?),
        "beginsWith" => TextOp::BeginsWith(text()?),
        "endsWith" => TextOp::EndsWith(text()?),
        "doesNotContain" => TextOp::DoesNotContain(text()?),
        "doesNotBeginWith" => TextOp::DoesNotBeginWith(text()?),
        "doesNotEndWith" => TextOp::DoesNotEndWith(text()?),
        "null" => TextOp::Null,
        "notNull" => TextOp::NotNull,
        "in" => TextOp::In(list_value(name, value)?),
        "notIn" => TextOp::NotIn(list_value(name, value)?),
        other => {
            return Err(FilterError::UnsupportedOperator {
                field: name.to_string(),
                operator: other.to_string(),
            });
        }
    };
    Ok(Predicate::Text(TextRule { field, op }))
}

fn number_rule(
    field: NumberField,
    name: &str,
    operator: &str,
    value: &Value,
) -> Result<Predicate, FilterError> {
    let op = match operator {
        "=" => NumberOp::Eq,
        "!=" => NumberOp::Ne,
        "<" => NumberOp::Lt,
        "<=" => NumberOp::Le,
        ">" => NumberOp::Gt,
        ">=" => NumberOp::Ge,
        other => {
            return Err(FilterError::UnsupportedOperator {
                field: name.to_string(),
                operator: other.to_string(),
            });
        }
    };
    let value = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| FilterError::InvalidValue {
        field: name.to_string(),
        reason: format!("expected a number, got {value}"),
    })?;
    Ok(Predicate::Number(NumberRule { field, op, value }))
}

fn text_value(field: &str, value: &Value) -> Result<String, FilterError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(FilterError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected text, got {other}"),
        }),
    }
}

/// `in` values arrive either as a list or as a comma-separated string.
fn list_value(field: &str, value: &Value) -> Result<Vec<String>, FilterError> {
    match value {
        Value::Array(items) => items.iter().map(|item| text_value(field, item)).collect(),
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()),
        other => Err(FilterError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected a list, got {other}"),
        }),
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

fn starts_with_ci(haystack: &str, prefix: &str) -> bool {
    haystack
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn ends_with_ci(haystack: &str, suffix: &str) -> bool {
    haystack
        .len()
        .checked_sub(suffix.len())
        .and_then(|start| haystack.get(start..))
        .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
}

impl TextRule {
    fn matches(&self, image: &Image) -> bool {
        let directory;
        let subject: &str = match self.field {
            TextField::Filename => &image.filename,
            TextField::Directory => {
                directory = image.directory();
                &directory
            }
        };
        match &self.op {
            TextOp::Equals(v) => subject == v,
            TextOp::NotEquals(v) => subject != v,
            TextOp::Contains(v) => contains_ci(subject, v),
            TextOp::BeginsWith(v) => starts_with_ci(subject, v),
            TextOp::EndsWith(v) => ends_with_ci(subject, v),
            TextOp::DoesNotContain(v) => !contains_ci(subject, v),
            TextOp::DoesNotBeginWith(v) => !starts_with_ci(subject, v),
            TextOp::DoesNotEndWith(v) => !ends_with_ci(subject, v),
            TextOp::Null => subject.is_empty(),
            TextOp::NotNull => !subject.is_empty(),
            TextOp::In(values) => values.iter().any(|v| v == subject),
            TextOp::NotIn(values) => !values.iter().any(|v| v == subject),
        }
    }
}

impl NumberRule {
    fn matches(&self, image: &Image) -> bool {
        let subject = f64::from(match self.field {
            NumberField::AspectWidth => image.aspect_width,
            NumberField::AspectHeight => image.aspect_height,
        });
        match self.op {
            NumberOp::Eq => subject == self.value,
            NumberOp::Ne => subject != self.value,
            NumberOp::Lt => subject < self.value,
            NumberOp::Le => subject <= self.value,
            NumberOp::Gt => subject > self.value,
            NumberOp::Ge => subject >= self.value,
        }
    }
}

/// Resolves "which images may be shown right now".
#[derive(Clone)]
pub struct FilterEvaluator {
    images: Arc<dyn ImageStore>,
    settings: Arc<dyn SettingsStore>,
}

impl FilterEvaluator {
    pub fn new(images: Arc<dyn ImageStore>, settings: Arc<dyn SettingsStore>) -> Self {
        Self { images, settings }
    }

    /// Images matching `filter`, in identity order. No filter, or a filter
    /// id that no longer exists, means the whole library.
    pub fn eligible(&self, filter: Option<&FilterId>) -> Result<Vec<Image>, FilterError> {
        let predicate = match filter {
            None => Predicate::everything(),
            Some(id) => self.predicate(id)?,
        };
        let eligible: Vec<Image> = self
            .images
            .images()
            .into_iter()
            .filter(|image| predicate.matches(image))
            .collect();
        debug!(filter = ?filter, eligible = eligible.len(), "evaluated filter");
        Ok(eligible)
    }

    fn predicate(&self, id: &FilterId) -> Result<Predicate, FilterError> {
        let saved = self
            .settings
            .filter(id)
            .map_err(|err| FilterError::Malformed {
                id: id.clone(),
                reason: format!("{err:#}"),
            })?;
        match saved {
            Some(saved) => Predicate::parse(&saved.query).map_err(|err| FilterError::Malformed {
                id: id.clone(),
                reason: err.to_string(),
            }),
            None => {
                warn!(filter = %id, "active filter no longer exists; using the whole library");
                Ok(Predicate::everything())
            }
        }
    }
}
