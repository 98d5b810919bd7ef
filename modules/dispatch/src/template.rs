//! Field-substitution templates
//!
//! Used for prompt templates and for `publishes` subject templates. The only
//! syntax is `{{.field}}` (dotted paths such as `{{.contact.value}}` reach
//! into nested objects, whitespace inside the braces is ignored). `\{{`
//! produces a literal `{{`.

use serde_json::Value;
use std::fmt;

use river::subject::{validate_pattern, validate_subject};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),

    #[error("empty placeholder at byte {0}")]
    EmptyField(usize),

    #[error("invalid placeholder '{0}': expected {{{{.field}}}}")]
    InvalidField(String),

    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Vec<String>),
}

/// A parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;
        let mut offset = 0;

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix("\\{{") {
                literal.push_str("{{");
                offset += 3;
                rest = after;
            } else if let Some(after) = rest.strip_prefix("{{") {
                let end = after.find("}}").ok_or(TemplateError::Unclosed(offset))?;
                let raw = after[..end].trim();
                if raw.is_empty() {
                    return Err(TemplateError::EmptyField(offset));
                }
                let path = parse_path(raw)?;

                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Field(path));

                offset += 2 + end + 2;
                rest = &after[end + 2..];
            } else {
                let mut chars = rest.chars();
                if let Some(c) = chars.next() {
                    literal.push(c);
                    offset += c.len_utf8();
                }
                rest = chars.as_str();
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Parse a `publishes` subject template.
    ///
    /// Placeholders must fill whole tokens (`lead.{{.region}}.scored`), and
    /// the template must be a well-formed subject once they are filled.
    pub fn parse_subject(source: &str) -> Result<Self, TemplateError> {
        let template = Self::parse(source)?;

        let sample: String = template
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                Segment::Field(_) => "_",
            })
            .collect();
        validate_subject(&sample).map_err(TemplateError::InvalidSubject)?;

        // No literal wildcards remain, so every '*' below is a placeholder
        let pattern = template.as_pattern();
        if pattern.split('.').any(|token| token.contains('*') && token != "*") {
            return Err(TemplateError::InvalidSubject(format!(
                "placeholder must fill a whole token in '{source}'"
            )));
        }
        validate_pattern(&pattern).map_err(TemplateError::InvalidSubject)?;
        Ok(template)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template has no placeholders
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    /// Dotted paths of every placeholder, in order
    pub fn fields(&self) -> Vec<String> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Field(path) => Some(path.join(".")),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// The template with every placeholder replaced by a `*` wildcard
    pub fn as_pattern(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                Segment::Field(_) => "*",
            })
            .collect()
    }

    /// Substitute placeholders from a JSON object.
    ///
    /// Missing and null fields are errors; strings are inserted verbatim,
    /// other values as compact JSON.
    pub fn render(&self, data: &Value) -> Result<String, TemplateError> {
        self.render_with(data, |_, _| Ok(()))
    }

    /// Render and check the result is a concrete subject.
    ///
    /// Each substituted value must be exactly one token, so a value such as
    /// `"a.b"` or `"*"` cannot widen the subject beyond the token its
    /// placeholder stands for.
    pub fn render_subject(&self, data: &Value) -> Result<String, TemplateError> {
        let subject = self.render_with(data, |path, value| {
            if value.is_empty()
                || value
                    .chars()
                    .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
            {
                return Err(TemplateError::InvalidSubject(format!(
                    "field '{}' value '{value}' is not a single subject token",
                    path.join(".")
                )));
            }
            Ok(())
        })?;
        validate_subject(&subject).map_err(TemplateError::InvalidSubject)?;
        Ok(subject)
    }

    fn render_with<F>(&self, data: &Value, check: F) -> Result<String, TemplateError>
    where
        F: Fn(&[String], &str) -> Result<(), TemplateError>,
    {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(path) => {
                    let value = lookup(data, path)
                        .ok_or_else(|| TemplateError::MissingField(path.join(".")))?;
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    check(path, &text)?;
                    out.push_str(&text);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_path(raw: &str) -> Result<Vec<String>, TemplateError> {
    let path = raw.strip_prefix('.').unwrap_or(raw);
    let parts: Vec<String> = path.split('.').map(str::to_string).collect();
    let valid = parts.iter().all(|part| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    });
    if !valid {
        return Err(TemplateError::InvalidField(raw.to_string()));
    }
    Ok(parts)
}

fn lookup<'a>(data: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = data;
    for key in path {
        current = current.get(key.as_str())?;
    }
    (!current.is_null()).then_some(current)
}
