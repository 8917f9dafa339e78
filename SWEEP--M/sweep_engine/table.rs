use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::naming::{job_id, JobId};

/// Canonical column names, in the order they appear in derived tables.
pub const MASS: &str = "mass";
/// Metallicity column.
pub const METALLICITY: &str = "metallicity";
/// Overshoot scheme column.
pub const OVERSHOOT_SCHEME: &str = "overshoot_scheme";
/// Overshoot extent column (scheme dependent).
pub const F_OV: &str = "f_ov";
/// Overshoot switch point column (scheme dependent).
pub const F0_OV: &str = "f0_ov";

const REQUIRED: [&str; 3] = [MASS, METALLICITY, OVERSHOOT_SCHEME];
const OPTIONAL: [&str; 2] = [F_OV, F0_OV];

/// Errors raised while loading the parameter table.
#[derive(Debug, Error)]
pub enum TableError {
    /// I/O error (filesystem).
    #[error("reading table {path}: {source}")]
    Io {
        /// Table path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The table has no header line.
    #[error("table is empty")]
    Empty,
    /// A required column is absent from the header.
    #[error("table header lacks required column `{0}`")]
    MissingColumn(String),
    /// Two header cells share a name.
    #[error("table header repeats column `{0}`")]
    DuplicateColumn(String),
    /// A row has a different number of cells than the header.
    #[error("line {line}: expected {expected} cells, found {found}")]
    RaggedRow {
        /// 1-based line number in the file.
        line: usize,
        /// Header width.
        expected: usize,
        /// Row width.
        found: usize,
    },
    /// A line could not be split into cells.
    #[error("line {line}: {reason}")]
    Malformed {
        /// 1-based line number in the file.
        line: usize,
        /// Description.
        reason: String,
    },
    /// A cell does not hold a usable value.
    #[error("line {line}: field `{field}` = {value:?}: {reason}")]
    InvalidField {
        /// 1-based line number in the file.
        line: usize,
        /// Column name.
        field: String,
        /// Raw cell text.
        value: String,
        /// Description.
        reason: String,
    },
    /// Two rows map onto the same job identifier.
    #[error("rows {first_row} and {second_row} both map to job id {job_id}")]
    IdentifierCollision {
        /// Shared identifier.
        job_id: JobId,
        /// Row sequence number of the first occurrence.
        first_row: usize,
        /// Row sequence number of the colliding row.
        second_row: usize,
    },
}

/// Overshoot mixing scheme of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OvershootScheme {
    /// No overshooting.
    None,
    /// Exponentially decaying diffusion.
    Exponential,
    /// Step overshoot.
    Step,
    /// User-supplied scheme.
    Other,
}

impl OvershootScheme {
    /// Parses the categorical cell, case-insensitively. `noovs` and an empty
    /// cell mean [`OvershootScheme::None`].
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "noovs" => Some(Self::None),
            "exponential" => Some(Self::Exponential),
            "step" => Some(Self::Step),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Canonical lowercase name as written into inputs and results.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Exponential => "exponential",
            Self::Step => "step",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for OvershootScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of one named field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Numeric field.
    Number(f64),
    /// Categorical or pass-through field.
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// One parameter combination. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRow {
    /// 1-based position among the table's data rows.
    pub sequence: usize,
    /// Initial mass.
    pub mass: f64,
    /// Initial metallicity.
    pub metallicity: f64,
    /// Overshoot scheme.
    pub scheme: OvershootScheme,
    /// Overshoot extent, when given.
    pub f_ov: Option<f64>,
    /// Overshoot switch point, when given.
    pub f0_ov: Option<f64>,
    /// Pass-through columns in header order.
    pub extras: IndexMap<String, String>,
}

impl ParameterRow {
    /// Canonical identifier of this row.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        job_id(self)
    }

    /// Looks a field up by column name. Absent optional fields return `None`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            MASS => Some(FieldValue::Number(self.mass)),
            METALLICITY => Some(FieldValue::Number(self.metallicity)),
            OVERSHOOT_SCHEME => Some(FieldValue::Text(self.scheme.name().to_string())),
            F_OV => self.f_ov.map(FieldValue::Number),
            F0_OV => self.f0_ov.map(FieldValue::Number),
            other => self.extras.get(other).map(|v| FieldValue::Text(v.clone())),
        }
    }

    /// Returns whether `name` is a column of this row's table.
    #[must_use]
    pub fn knows_field(&self, name: &str) -> bool {
        REQUIRED.contains(&name) || OPTIONAL.contains(&name) || self.extras.contains_key(name)
    }
}

/// Loaded specification table.
#[derive(Debug, Clone)]
pub struct ParameterTable {
    columns: Vec<String>,
    rows: Vec<ParameterRow>,
}

impl ParameterTable {
    /// Loads a CSV table from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| TableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    /// Parses CSV text, validates every row and rejects identifier
    /// collisions.
    pub fn parse(raw: &str) -> Result<Self, TableError> {
        let mut lines = raw
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line))
            .filter(|(_, line)| {
                let trimmed = line.trim();
                !trimmed.is_empty() && !trimmed.starts_with('#')
            });

        let (header_line, header) = lines.next().ok_or(TableError::Empty)?;
        let columns = canonical_header(header_line, header)?;
        for required in REQUIRED {
            if !columns.iter().any(|c| c == required) {
                return Err(TableError::MissingColumn(required.to_string()));
            }
        }

        let mut rows = Vec::new();
        for (line_no, line) in lines {
            let cells = split_csv_record(line).map_err(|reason| TableError::Malformed {
                line: line_no,
                reason,
            })?;
            if cells.len() != columns.len() {
                return Err(TableError::RaggedRow {
                    line: line_no,
                    expected: columns.len(),
                    found: cells.len(),
                });
            }
            rows.push(parse_row(line_no, rows.len() + 1, &columns, cells)?);
        }

        let table = Self { columns, rows };
        table.check_collisions()?;
        Ok(table)
    }

    fn check_collisions(&self) -> Result<(), TableError> {
        let mut seen: HashMap<JobId, usize> = HashMap::with_capacity(self.rows.len());
        for row in &self.rows {
            let id = row.job_id();
            if let Some(&first_row) = seen.get(&id) {
                return Err(TableError::IdentifierCollision {
                    job_id: id,
                    first_row,
                    second_row: row.sequence,
                });
            }
            seen.insert(id, row.sequence);
        }
        Ok(())
    }

    /// Column names in header order (canonical columns lowercased).
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in table order.
    #[must_use]
    pub fn rows(&self) -> &[ParameterRow] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn canonical_header(line: usize, header: &str) -> Result<Vec<String>, TableError> {
    let cells = split_csv_record(header).map_err(|reason| TableError::Malformed { line, reason })?;
    let mut columns: Vec<String> = Vec::with_capacity(cells.len());
    for cell in cells {
        let lowered = cell.to_ascii_lowercase();
        let name = if REQUIRED.contains(&lowered.as_str()) || OPTIONAL.contains(&lowered.as_str()) {
            lowered
        } else {
            cell
        };
        if name.is_empty() {
            return Err(TableError::Malformed {
                line,
                reason: "empty column name in header".into(),
            });
        }
        if columns.contains(&name) {
            return Err(TableError::DuplicateColumn(name));
        }
        columns.push(name);
    }
    Ok(columns)
}

fn parse_row(
    line: usize,
    sequence: usize,
    columns: &[String],
    cells: Vec<String>,
) -> Result<ParameterRow, TableError> {
    let mut mass = None;
    let mut metallicity = None;
    let mut scheme = None;
    let mut f_ov = None;
    let mut f0_ov = None;
    let mut extras = IndexMap::new();

    for (column, cell) in columns.iter().zip(cells) {
        match column.as_str() {
            MASS => {
                let value = required_number(line, column, &cell)?;
                if value <= 0.0 {
                    return Err(invalid(line, column, &cell, "must be positive"));
                }
                mass = Some(value);
            }
            METALLICITY => {
                let value = required_number(line, column, &cell)?;
                if value < 0.0 {
                    return Err(invalid(line, column, &cell, "must not be negative"));
                }
                metallicity = Some(value);
            }
            OVERSHOOT_SCHEME => {
                scheme = Some(OvershootScheme::parse(&cell).ok_or_else(|| {
                    invalid(line, column, &cell, "expected none, exponential, step or other")
                })?);
            }
            F_OV => f_ov = optional_number(line, column, &cell)?,
            F0_OV => f0_ov = optional_number(line, column, &cell)?,
            _ => {
                extras.insert(column.clone(), cell);
            }
        }
    }

    // Required columns were checked against the header already.
    match (mass, metallicity, scheme) {
        (Some(mass), Some(metallicity), Some(scheme)) => Ok(ParameterRow {
            sequence,
            mass,
            metallicity,
            scheme,
            f_ov,
            f0_ov,
            extras,
        }),
        _ => Err(TableError::Malformed {
            line,
            reason: "row lacks a required field".into(),
        }),
    }
}

fn invalid(line: usize, field: &str, value: &str, reason: &str) -> TableError {
    TableError::InvalidField {
        line,
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn required_number(line: usize, field: &str, cell: &str) -> Result<f64, TableError> {
    optional_number(line, field, cell)?.ok_or_else(|| invalid(line, field, cell, "value required"))
}

fn optional_number(line: usize, field: &str, cell: &str) -> Result<Option<f64>, TableError> {
    if cell.is_empty() {
        return Ok(None);
    }
    let value = parse_number(cell).ok_or_else(|| invalid(line, field, cell, "not a number"))?;
    if value.is_finite() {
        Ok(Some(value))
    } else {
        Err(invalid(line, field, cell, "must be finite"))
    }
}

/// Parses a number, accepting Fortran `d`/`D` exponents.
#[must_use]
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .or_else(|| trimmed.replace(['d', 'D'], "e").parse::<f64>().ok())
}

/// Splits one CSV record. Cells are trimmed; double quotes group text and
/// `""` inside quotes is a literal quote.
pub(crate) fn split_csv_record(line: &str) -> Result<Vec<String>, String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted_cell = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.trim().is_empty() && !quoted_cell => {
                current.clear();
                in_quotes = true;
                quoted_cell = true;
            }
            ',' if !in_quotes => {
                cells.push(finish_cell(&mut current, quoted_cell));
                quoted_cell = false;
            }
            _ => current.push(ch),
        }
    }
    if in_quotes {
        return Err("unterminated quoted cell".into());
    }
    cells.push(finish_cell(&mut current, quoted_cell));
    Ok(cells)
}

fn finish_cell(current: &mut String, quoted: bool) -> String {
    let cell = std::mem::take(current);
    if quoted {
        // Keep whitespace inside quotes, drop what surrounds them.
        cell.trim_end().to_string()
    } else {
        cell.trim().to_string()
    }
}

/// Escapes one cell for CSV output.
pub(crate) fn csv_escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) || cell.trim() != cell {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
