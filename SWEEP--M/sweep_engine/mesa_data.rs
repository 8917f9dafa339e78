//! Reader for the simulator's whitespace-separated history and profile
//! files.
//!
//! Non-blank lines are, in order: header column numbers, header names, header
//! values, data column numbers, data column names, then one line per data row.

use indexmap::IndexMap;
use thiserror::Error;

use crate::table::{parse_number, FieldValue};

/// Parse failures for history/profile files.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataFileError {
    /// Fewer than the five preamble lines.
    #[error("truncated file: expected {expected} preamble lines, found {found}")]
    Truncated {
        /// Lines needed.
        expected: usize,
        /// Lines present.
        found: usize,
    },
    /// Header names and values disagree in count.
    #[error("header has {names} names but {values} values")]
    HeaderShape {
        /// Name count.
        names: usize,
        /// Value count.
        values: usize,
    },
    /// A quoted header value is never closed.
    #[error("unterminated quote in header values")]
    UnterminatedQuote,
    /// A data row has the wrong number of cells.
    #[error("data line {line}: expected {expected} cells, found {found}")]
    RaggedRow {
        /// 1-based line number in the file.
        line: usize,
        /// Column count.
        expected: usize,
        /// Cells present.
        found: usize,
    },
    /// A data cell is not a number.
    #[error("data line {line}: column `{column}` has non-numeric value {value:?}")]
    NotNumeric {
        /// 1-based line number in the file.
        line: usize,
        /// Column name.
        column: String,
        /// Cell text.
        value: String,
    },
}

/// Parsed history or profile file.
#[derive(Debug, Clone, PartialEq)]
pub struct MesaTable {
    header: IndexMap<String, FieldValue>,
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl MesaTable {
    /// Parses file text.
    pub fn parse(raw: &str) -> Result<Self, DataFileError> {
        let lines: Vec<(usize, &str)> = raw
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty())
            .collect();
        if lines.len() < 5 {
            return Err(DataFileError::Truncated {
                expected: 5,
                found: lines.len(),
            });
        }

        let names: Vec<&str> = lines[1].1.split_whitespace().collect();
        let values = split_header_values(lines[2].1)?;
        if names.len() != values.len() {
            return Err(DataFileError::HeaderShape {
                names: names.len(),
                values: values.len(),
            });
        }
        let header = names
            .into_iter()
            .zip(values)
            .map(|(name, value)| {
                let value = match parse_number(&value) {
                    Some(number) => FieldValue::Number(number),
                    None => FieldValue::Text(value),
                };
                (name.to_string(), value)
            })
            .collect();

        let columns: Vec<String> = lines[4].1.split_whitespace().map(str::to_string).collect();
        let mut rows = Vec::with_capacity(lines.len() - 5);
        for &(line_no, line) in &lines[5..] {
            let cells: Vec<&str> = line.split_whitespace().collect();
            if cells.len() != columns.len() {
                return Err(DataFileError::RaggedRow {
                    line: line_no,
                    expected: columns.len(),
                    found: cells.len(),
                });
            }
            let row = cells
                .iter()
                .zip(&columns)
                .map(|(cell, column)| {
                    parse_number(cell).ok_or_else(|| DataFileError::NotNumeric {
                        line: line_no,
                        column: column.clone(),
                        value: (*cell).to_string(),
                    })
                })
                .collect::<Result<Vec<f64>, _>>()?;
            rows.push(row);
        }
        Ok(Self {
            header,
            columns,
            rows,
        })
    }

    /// Header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&FieldValue> {
        self.header.get(name)
    }

    /// Numeric header value by name.
    #[must_use]
    pub fn header_number(&self, name: &str) -> Option<f64> {
        match self.header.get(name)? {
            FieldValue::Number(value) => Some(*value),
            FieldValue::Text(_) => None,
        }
    }

    /// Data column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of data rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no data rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column in row order, `None` when the column is absent.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row[idx]).collect())
    }

    /// Last value of a column.
    #[must_use]
    pub fn last(&self, name: &str) -> Option<f64> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.rows.last().map(|row| row[idx])
    }
}

/// Splits header values on whitespace, keeping double-quoted values whole.
fn split_header_values(line: &str) -> Result<Vec<String>, DataFileError> {
    let mut values = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if ch == '"' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => return Err(DataFileError::UnterminatedQuote),
                }
            }
            values.push(value.trim().to_string());
        } else {
            let mut value = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
            values.push(value);
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HISTORY: &str = r#"
                                         1                                         2                                         3
                              version_number                                compiler                               initial_mass
                                  "r24.08.1"                              "gfortran"                                        1.0D+00

                                         1                                         2                                         3                                         4
                                model_number                                 star_age                                   log_L                                center_h1
                                           1                     1.0000000000000000D-05                     -2.5000000000000000D-01                      7.0000000000000000D-01
                                           2                     2.5000000000000000E+03                     -2.4000000000000000D-01                      6.9000000000000000D-01
"#;

    #[test]
    fn parses_header_and_columns() {
        let table = MesaTable::parse(HISTORY).unwrap();
        assert_eq!(
            table.header("version_number"),
            Some(&FieldValue::Text("r24.08.1".into()))
        );
        assert_eq!(table.header_number("initial_mass"), Some(1.0));
        assert_eq!(table.columns().len(), 4);
        assert_eq!(table.len(), 2);
        assert_eq!(table.last("model_number"), Some(2.0));
        assert_eq!(table.last("star_age"), Some(2500.0));
        assert_eq!(table.column("center_h1").unwrap(), vec![0.7, 0.69]);
        assert_eq!(table.last("he_core_mass"), None);
    }

    #[test]
    fn quoted_header_values_may_contain_spaces() {
        let raw = "1 2\nrun_name version\n\"my run\" 3\n1\nx\n1.5\n";
        let table = MesaTable::parse(raw).unwrap();
        assert_eq!(table.header("run_name"), Some(&FieldValue::Text("my run".into())));
        assert_eq!(table.header_number("version"), Some(3.0));
    }

    #[test]
    fn rejects_broken_files() {
        assert!(matches!(
            MesaTable::parse("1\nx\n"),
            Err(DataFileError::Truncated { found: 2, .. })
        ));
        assert!(matches!(
            MesaTable::parse("1\na\n1\n1 2\nx y\n1.0\n"),
            Err(DataFileError::RaggedRow { line: 6, .. })
        ));
        assert!(matches!(
            MesaTable::parse("1\na\n1\n1\nx\nnope\n"),
            Err(DataFileError::NotNumeric { .. })
        ));
    }
}
