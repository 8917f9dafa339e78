use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use thiserror::Error;

use crate::{
    naming::JobId,
    report::FieldMismatch,
    table::{parse_number, FieldValue, ParameterRow},
};

/// Absolute tolerance for comparing numbers read back from an artifact.
pub const ABS_TOLERANCE: f64 = 1e-12;
/// Relative tolerance for comparing numbers read back from an artifact.
pub const REL_TOLERANCE: f64 = 1e-9;

/// Name of the placeholder that renders the job identifier.
pub const JOB_ID_PLACEHOLDER: &str = "job_id";

/// Errors raised by template parsing and rendering.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// The template file could not be read.
    #[error("reading template {path}: {message}")]
    Io {
        /// Template path.
        path: PathBuf,
        /// Error text.
        message: String,
    },
    /// `{{` without a closing `}}`.
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
    /// `{{}}` or a name with characters outside `[A-Za-z0-9_]`.
    #[error("invalid placeholder {name:?} at byte {offset}")]
    InvalidPlaceholder {
        /// Placeholder text.
        name: String,
        /// Byte offset in the template.
        offset: usize,
    },
    /// A row field is rendered only outside `key = value` lines, so an
    /// artifact cannot be read back for it.
    #[error("template field `{field}` is not on any assignment line and cannot be verified")]
    UnverifiableField {
        /// Placeholder name.
        field: String,
    },
    /// A placeholder has no value for this row and no default.
    #[error("template field `{field}` unresolved for job {job_id}")]
    TemplateFieldMissing {
        /// Job being rendered.
        job_id: JobId,
        /// Placeholder name.
        field: String,
    },
}

/// A `{{name}}` or `{{name|default}}` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Field name.
    pub name: String,
    /// Literal used when the field is absent.
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Placeholder),
}

/// A template line of the form `key = value` whose value holds one or more
/// placeholders separated by literal text, e.g. `x = {{a}}, {{b}}d0`. The
/// literals let a rendered artifact be read back into field values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Assignment key, lowercased.
    pub key: String,
    /// Bound placeholders in line order.
    pub placeholders: Vec<Placeholder>,
    pattern: Vec<Segment>,
}

/// Values injected into every render of one batch.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    /// Row being rendered.
    pub row: &'a ParameterRow,
    /// Identifier of the row.
    pub job_id: &'a JobId,
    /// Batch toggle answers by placeholder name.
    pub toggles: &'a IndexMap<String, bool>,
}

/// Parsed inlist template.
#[derive(Debug, Clone)]
pub struct InputTemplate {
    segments: Vec<Segment>,
    bindings: Vec<Binding>,
    unbound: Vec<String>,
}

enum Resolved {
    Value(FieldValue),
    Literal(String),
    Toggle(bool),
}

impl InputTemplate {
    /// Reads and parses a template file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| TemplateError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::parse(&raw)
    }

    /// Parses template text.
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let segments = split_segments(raw, 0)?;
        let mut bindings = Vec::new();
        let mut offset = 0;
        for line in raw.split_inclusive('\n') {
            if let Some(binding) = binding_for_line(line, offset)? {
                bindings.push(binding);
            }
            offset += line.len();
        }
        let mut template = Self {
            segments,
            bindings,
            unbound: Vec::new(),
        };
        let bound: HashSet<&str> = template
            .bindings
            .iter()
            .flat_map(|binding| binding.placeholders.iter().map(|slot| slot.name.as_str()))
            .collect();
        let unbound: Vec<String> = template
            .placeholders()
            .into_iter()
            .filter(|name| *name != JOB_ID_PLACEHOLDER && !bound.contains(name))
            .map(str::to_string)
            .collect();
        template.unbound = unbound;
        Ok(template)
    }

    /// Placeholder names in order of first appearance.
    #[must_use]
    pub fn placeholders(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Slot(slot) => Some(slot.name.as_str()),
                Segment::Literal(_) => None,
            })
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Assignment bindings used to read artifacts back.
    #[must_use]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Row fields that appear only outside assignment lines. Toggles are
    /// excluded since they are batch settings.
    #[must_use]
    pub fn unverifiable_fields(&self, toggle_names: &HashSet<String>) -> Vec<&str> {
        self.unbound
            .iter()
            .map(String::as_str)
            .filter(|name| !toggle_names.contains(*name))
            .collect()
    }

    /// Fails when some row field could never be read back from an artifact.
    pub fn ensure_verifiable(&self, toggle_names: &HashSet<String>) -> Result<(), TemplateError> {
        match self.unverifiable_fields(toggle_names).first() {
            Some(field) => Err(TemplateError::UnverifiableField {
                field: (*field).to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Substitutes every placeholder. Any unresolved placeholder fails the
    /// whole render.
    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(slot) => out.push_str(&render_resolved(&resolve(slot, ctx)?)),
            }
        }
        Ok(out)
    }

    /// Reads `artifact` back through the bindings and compares every bound
    /// field with the row. Toggle placeholders are skipped because their
    /// answer is a batch setting, not a row field.
    #[must_use]
    pub fn compare(
        &self,
        artifact: &str,
        row: &ParameterRow,
        job_id: &JobId,
        toggle_names: &HashSet<String>,
    ) -> Vec<FieldMismatch> {
        let assignments = parse_assignments(artifact);
        let no_toggles = IndexMap::new();
        let ctx = RenderContext {
            row,
            job_id,
            toggles: &no_toggles,
        };
        let mut mismatches = Vec::new();
        for binding in &self.bindings {
            let raw = assignments.get(&binding.key);
            let captured = raw.and_then(|raw| binding.capture(raw));
            for (idx, slot) in binding.placeholders.iter().enumerate() {
                if toggle_names.contains(&slot.name) {
                    continue;
                }
                let Ok(expected) = resolve(slot, &ctx) else {
                    mismatches.push(binding.mismatch(slot, "<unresolved>".into(), None));
                    continue;
                };
                let expected_text = render_resolved(&expected);
                let agrees = captured
                    .as_ref()
                    .is_some_and(|values| values_agree(&expected, values[idx]));
                if !agrees {
                    mismatches.push(binding.mismatch(slot, expected_text, raw.cloned()));
                }
            }
        }
        for field in self.unverifiable_fields(toggle_names) {
            let slot = Placeholder {
                name: field.to_string(),
                default: None,
            };
            let expected = resolve(&slot, &ctx).map_or_else(|_| "<unresolved>".into(), |r| render_resolved(&r));
            mismatches.push(FieldMismatch {
                field: field.to_string(),
                key: String::new(),
                expected,
                found: Some("<not verifiable>".into()),
            });
        }
        mismatches
    }
}

impl Binding {
    /// Splits an assignment value into one text per placeholder, using the
    /// literals between them as delimiters.
    fn capture<'a>(&self, raw: &'a str) -> Option<Vec<&'a str>> {
        let mut rest = raw;
        let mut values = Vec::with_capacity(self.placeholders.len());
        let mut segments = self.pattern.iter().peekable();
        while let Some(segment) = segments.next() {
            match segment {
                Segment::Literal(text) => rest = rest.strip_prefix(text.as_str())?,
                Segment::Slot(_) => match segments.peek() {
                    None => {
                        values.push(rest.trim());
                        rest = "";
                    }
                    Some(Segment::Slot(_)) => return None,
                    Some(Segment::Literal(next)) => {
                        let end = if segments.len() == 1 {
                            rest.strip_suffix(next.as_str())?.len()
                        } else {
                            rest.find(next.as_str())?
                        };
                        values.push(rest[..end].trim());
                        rest = &rest[end..];
                    }
                },
            }
        }
        rest.is_empty().then_some(values)
    }

    fn mismatch(&self, slot: &Placeholder, expected: String, found: Option<String>) -> FieldMismatch {
        FieldMismatch {
            field: slot.name.clone(),
            key: self.key.clone(),
            expected,
            found,
        }
    }
}

fn resolve(slot: &Placeholder, ctx: &RenderContext<'_>) -> Result<Resolved, TemplateError> {
    if slot.name == JOB_ID_PLACEHOLDER {
        return Ok(Resolved::Value(FieldValue::Text(ctx.job_id.to_string())));
    }
    if let Some(&answer) = ctx.toggles.get(&slot.name) {
        return Ok(Resolved::Toggle(answer));
    }
    if let Some(value) = ctx.row.field(&slot.name) {
        return Ok(Resolved::Value(value));
    }
    slot.default
        .as_ref()
        .map(|literal| Resolved::Literal(literal.clone()))
        .ok_or_else(|| TemplateError::TemplateFieldMissing {
            job_id: ctx.job_id.clone(),
            field: slot.name.clone(),
        })
}

fn render_resolved(resolved: &Resolved) -> String {
    match resolved {
        Resolved::Value(FieldValue::Number(value)) => format_number(*value),
        Resolved::Value(FieldValue::Text(text)) | Resolved::Literal(text) => text.clone(),
        Resolved::Toggle(true) => ".true.".into(),
        Resolved::Toggle(false) => ".false.".into(),
    }
}

/// Renders a number with the shortest text that parses back to the same
/// `f64`; integral values get a `.0` so Fortran reads them as reals.
#[must_use]
pub fn format_number(value: f64) -> String {
    let text = value.to_string();
    if text.contains(['.', 'e', 'E']) || !value.is_finite() {
        text
    } else {
        format!("{text}.0")
    }
}

/// Compares two numbers with the artifact round-trip tolerance.
#[must_use]
pub fn within_tolerance(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= ABS_TOLERANCE.max(REL_TOLERANCE * scale)
}

fn values_agree(expected: &Resolved, found: &str) -> bool {
    match expected {
        Resolved::Value(FieldValue::Number(value)) => {
            parse_number(found).is_some_and(|parsed| within_tolerance(*value, parsed))
        }
        Resolved::Value(FieldValue::Text(text)) | Resolved::Literal(text) => {
            match (parse_number(text), parse_number(found)) {
                (Some(a), Some(b)) => within_tolerance(a, b),
                _ => text.trim() == found,
            }
        }
        Resolved::Toggle(answer) => parse_logical(found) == Some(*answer),
    }
}

fn parse_logical(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().trim_matches('.') {
        "true" | "t" => Some(true),
        "false" | "f" => Some(false),
        _ => None,
    }
}

fn split_segments(raw: &str, base: usize) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = raw;
    let mut consumed = 0;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Literal(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or(TemplateError::Unterminated(base + consumed + open))?;
        let slot = parse_placeholder(&after[..close], base + consumed + open)?;
        segments.push(Segment::Slot(slot));
        let advance = open + 2 + close + 2;
        consumed += advance;
        rest = &rest[advance..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

fn parse_placeholder(body: &str, offset: usize) -> Result<Placeholder, TemplateError> {
    let (name, default) = match body.split_once('|') {
        Some((name, default)) => (name.trim(), Some(default.trim().to_string())),
        None => (body.trim(), None),
    };
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(TemplateError::InvalidPlaceholder {
            name: body.to_string(),
            offset,
        });
    }
    Ok(Placeholder {
        name: name.to_string(),
        default,
    })
}

fn binding_for_line(line: &str, offset: usize) -> Result<Option<Binding>, TemplateError> {
    let code = strip_comment(line);
    let Some((key, rhs)) = code.split_once('=') else {
        return Ok(None);
    };
    let key = key.trim();
    if key.is_empty() || key.contains("{{") {
        return Ok(None);
    }
    let pattern = split_segments(rhs.trim(), offset)?;
    let placeholders: Vec<Placeholder> = pattern
        .iter()
        .filter_map(|segment| match segment {
            Segment::Slot(slot) => Some(slot.clone()),
            Segment::Literal(_) => None,
        })
        .collect();
    if placeholders.is_empty() {
        return Ok(None);
    }
    Ok(Some(Binding {
        key: key.to_ascii_lowercase(),
        placeholders,
        pattern,
    }))
}

/// Removes a trailing `!` comment, ignoring `!` inside quoted strings.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (idx, ch) in line.char_indices() {
        match (quote, ch) {
            (None, '\'' | '"') => quote = Some(ch),
            (Some(open), c) if c == open => quote = None,
            (None, '!') => return &line[..idx],
            _ => {}
        }
    }
    line
}

/// Collects `key = value` assignments; keys are lowercased and the last
/// assignment of a key wins.
#[must_use]
pub fn parse_assignments(text: &str) -> HashMap<String, String> {
    let mut assignments = HashMap::new();
    for line in text.lines() {
        let code = strip_comment(line);
        if let Some((key, value)) = code.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                assignments.insert(key.to_ascii_lowercase(), value.trim().to_string());
            }
        }
    }
    assignments
}
