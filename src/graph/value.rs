//! Property values and `${resource.attribute}` references.
//!
//! References are parsed at declaration time, which is what lets the graph
//! infer dependencies, and are resolved only during execution, once the
//! referenced resource has been applied and its outputs are known.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Declared properties of a resource.
pub type Properties = BTreeMap<String, Value>;

/// A reference to an output attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Reference {
    /// Logical name of the referenced resource.
    pub resource: String,
    /// Output attribute of the referenced resource.
    pub attribute: String,
}

impl Reference {
    /// Creates a new reference.
    #[must_use]
    pub fn new(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }

    /// Parses the inside of a `${...}` expression.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the expression is not of the
    /// form `resource.attribute`.
    pub fn parse(expression: &str) -> Result<Self, String> {
        let expression = expression.trim();
        let Some((resource, attribute)) = expression.split_once('.') else {
            return Err(String::from("expected '<resource>.<attribute>'"));
        };

        if resource.is_empty() || attribute.is_empty() {
            return Err(String::from("resource and attribute must be non-empty"));
        }

        let valid = |s: &str| {
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        };
        if !valid(resource) || !valid(attribute) {
            return Err(String::from(
                "only ASCII letters, digits, '_', '-' and '.' are allowed",
            ));
        }

        Ok(Self::new(resource, attribute))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.attribute)
    }
}

/// One piece of a string template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Literal(String),
    /// An embedded reference.
    Ref(Reference),
}

/// A string property value split into literals and references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

/// Error raised while parsing a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    /// The offending expression.
    pub expression: String,
    /// Why it was rejected.
    pub reason: String,
}

impl Template {
    /// Parses a string, recognising `${resource.attribute}` and the `$${` escape.
    ///
    /// # Errors
    ///
    /// Returns a `TemplateError` for unterminated or malformed expressions.
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = input;

        while let Some(pos) = rest.find('$') {
            literal.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if tail.starts_with("$${") {
                literal.push_str("${");
                rest = &tail[3..];
            } else if let Some(body) = tail.strip_prefix("${") {
                let Some(end) = body.find('}') else {
                    return Err(TemplateError {
                        expression: tail.to_string(),
                        reason: String::from("unterminated '${'"),
                    });
                };
                let expression = &body[..end];
                let reference = Reference::parse(expression).map_err(|reason| TemplateError {
                    expression: format!("${{{expression}}}"),
                    reason,
                })?;
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Ref(reference));
                rest = &body[end + 1..];
            } else {
                literal.push('$');
                rest = &tail[1..];
            }
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// Returns the references embedded in this template.
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Ref(r) => Some(r),
            Segment::Literal(_) => None,
        })
    }

    /// Returns true if the template has at least one reference.
    #[must_use]
    pub fn has_references(&self) -> bool {
        self.references().next().is_some()
    }

    /// Renders the template.
    ///
    /// A template made of exactly one reference yields the referenced value
    /// unchanged, so non-string outputs keep their JSON type.
    fn render<F>(&self, lookup: &F) -> Result<Value, Reference>
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        if let [Segment::Ref(reference)] = self.segments.as_slice() {
            return lookup(reference).ok_or_else(|| reference.clone());
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Ref(reference) => {
                    let value = lookup(reference).ok_or_else(|| reference.clone())?;
                    match value {
                        Value::String(s) => out.push_str(&s),
                        other => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(Value::String(out))
    }
}

/// Collects every reference found in a value, recursing into arrays and objects.
///
/// # Errors
///
/// Returns the first malformed expression found.
pub fn collect_references(value: &Value) -> Result<Vec<Reference>, TemplateError> {
    let mut found = Vec::new();
    walk_references(value, &mut found)?;
    Ok(found)
}

fn walk_references(value: &Value, found: &mut Vec<Reference>) -> Result<(), TemplateError> {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                found.extend(Template::parse(s)?.references().cloned());
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_references(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                walk_references(item, found)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Resolves every reference in a value using `lookup`.
///
/// # Errors
///
/// Returns the first reference `lookup` could not answer. Values are assumed
/// to have passed `collect_references`; malformed templates are left as-is.
pub fn resolve_value<F>(value: &Value, lookup: &F) -> Result<Value, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    match value {
        Value::String(s) if s.contains('$') => match Template::parse(s) {
            Ok(template) => template.render(lookup),
            Err(_) => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve_value(item, lookup)?);
            }
            Ok(Value::Object(out))
        }
        _ => Ok(value.clone()),
    }
}

/// Resolves every property of a resource.
///
/// # Errors
///
/// Returns the first unresolved reference.
pub fn resolve_properties<F>(properties: &Properties, lookup: &F) -> Result<Properties, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    properties
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(value, lookup)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(reference: &Reference) -> Option<Value> {
        match (reference.resource.as_str(), reference.attribute.as_str()) {
            ("table", "name") => Some(json!("images-table")),
            ("bucket", "name") => Some(json!("images-bucket")),
            ("table", "capacity") => Some(json!(25)),
            _ => None,
        }
    }

    #[test]
    fn test_parse_reference() {
        let r = Reference::parse("table.name").unwrap();
        assert_eq!(r, Reference::new("table", "name"));
        assert!(Reference::parse("table").is_err());
        assert!(Reference::parse(".name").is_err());
        assert!(Reference::parse("table.").is_err());
        assert!(Reference::parse("ta ble.name").is_err());
    }

    #[test]
    fn test_template_segments() {
        let t = Template::parse("arn:${bucket.name}/*").unwrap();
        let refs: Vec<_> = t.references().collect();
        assert_eq!(refs, vec![&Reference::new("bucket", "name")]);
    }

    #[test]
    fn test_escape_is_literal() {
        let t = Template::parse("cost: $${not.a_ref} and $5").unwrap();
        assert!(!t.has_references());
        let rendered = t.render(&outputs).unwrap();
        assert_eq!(rendered, json!("cost: ${not.a_ref} and $5"));
    }

    #[test]
    fn test_unterminated_reference_rejected() {
        let err = Template::parse("${table.name").unwrap_err();
        assert!(err.reason.contains("unterminated"));
    }

    #[test]
    fn test_whole_reference_keeps_json_type() {
        let resolved = resolve_value(&json!("${table.capacity}"), &outputs).unwrap();
        assert_eq!(resolved, json!(25));
    }

    #[test]
    fn test_interpolation_inside_nested_values() {
        let value = json!({
            "environment": {
                "TABLE_NAME": "${table.name}",
                "BUCKET_URL": "s3://${bucket.name}/uploads"
            },
            "tags": ["${table.name}", 3]
        });

        let refs = collect_references(&value).unwrap();
        assert_eq!(refs.len(), 3);

        let resolved = resolve_value(&value, &outputs).unwrap();
        assert_eq!(resolved["environment"]["TABLE_NAME"], json!("images-table"));
        assert_eq!(
            resolved["environment"]["BUCKET_URL"],
            json!("s3://images-bucket/uploads")
        );
        assert_eq!(resolved["tags"], json!(["images-table", 3]));
    }

    #[test]
    fn test_unresolved_reference_is_reported() {
        let err = resolve_value(&json!("${role.arn}"), &outputs).unwrap_err();
        assert_eq!(err, Reference::new("role", "arn"));
    }
}
