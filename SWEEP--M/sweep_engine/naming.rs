use std::fmt;

use serde::{Deserialize, Serialize};

use crate::table::{OvershootScheme, ParameterRow};

/// Token written in place of an absent optional field.
pub const ABSENT_TOKEN: &str = "na";

/// Canonical identifier of one job, the join key across inputs, runs,
/// timing and results.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wraps an identifier recovered from storage (file or directory name).
    #[must_use]
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrowed string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds the identifier of a row:
/// `M{mass:.4}_Z{metallicity:.8}_{scheme}_fov{f_ov:.5}_f0ov{f0_ov:.5}`.
///
/// Absent tuning fields are written as [`ABSENT_TOKEN`] so presence is always
/// encoded. Pass-through columns do not participate; the table loader
/// rejects rows that collide.
#[must_use]
pub fn job_id(row: &ParameterRow) -> JobId {
    JobId(format!(
        "M{}_Z{}_{}_fov{}_f0ov{}",
        fixed(row.mass, 4),
        fixed(row.metallicity, 8),
        scheme_token(row.scheme),
        optional(row.f_ov, 5),
        optional(row.f0_ov, 5),
    ))
}

const fn scheme_token(scheme: OvershootScheme) -> &'static str {
    match scheme {
        OvershootScheme::None => "noovs",
        OvershootScheme::Exponential => "exponential",
        OvershootScheme::Step => "step",
        OvershootScheme::Other => "other",
    }
}

fn fixed(value: f64, decimals: usize) -> String {
    let rendered = format!("{value:.decimals$}");
    // -0.0 and tiny negatives that round to zero share the zero token.
    if rendered.starts_with('-') && rendered[1..].chars().all(|c| c == '0' || c == '.') {
        rendered[1..].to_string()
    } else {
        rendered
    }
}

fn optional(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(|| ABSENT_TOKEN.to_string(), |v| fixed(v, decimals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use std::collections::HashSet;

    fn row(mass: f64, z: f64, scheme: OvershootScheme, f_ov: Option<f64>, f0: Option<f64>) -> ParameterRow {
        ParameterRow {
            sequence: 1,
            mass,
            metallicity: z,
            scheme,
            f_ov,
            f0_ov: f0,
            extras: IndexMap::new(),
        }
    }

    #[test]
    fn formats_fixed_layout() {
        let id = job_id(&row(1.0, 0.014, OvershootScheme::Exponential, Some(0.016), Some(0.008)));
        assert_eq!(id.as_str(), "M1.0000_Z0.01400000_exponential_fov0.01600_f0ov0.00800");
        let none = job_id(&row(2.5, 0.0001, OvershootScheme::None, None, None));
        assert_eq!(none.as_str(), "M2.5000_Z0.00010000_noovs_fovna_f0ovna");
    }

    #[test]
    fn is_stable_across_calls() {
        let r = row(1.2, 0.02, OvershootScheme::Step, Some(0.2), None);
        assert_eq!(job_id(&r), job_id(&r.clone()));
    }

    #[test]
    fn encodes_optional_fields_even_without_overshoot() {
        let bare = job_id(&row(1.0, 0.02, OvershootScheme::None, None, None));
        let tuned = job_id(&row(1.0, 0.02, OvershootScheme::None, Some(0.0), None));
        assert_ne!(bare, tuned);
    }

    #[test]
    fn negative_zero_matches_zero() {
        let a = job_id(&row(1.0, 0.0, OvershootScheme::None, None, None));
        let b = job_id(&row(1.0, -0.0, OvershootScheme::None, None, None));
        assert_eq!(a, b);
    }

    #[test]
    fn separates_extremely_metal_poor_rows() {
        let primordial = job_id(&row(1.0, 0.0, OvershootScheme::None, None, None));
        let poor = job_id(&row(1.0, 1e-7, OvershootScheme::None, None, None));
        assert_ne!(primordial, poor);
        assert_eq!(poor.as_str(), "M1.0000_Z0.00000010_noovs_fovna_f0ovna");
    }

    #[test]
    fn injective_over_grid() {
        let masses = [0.8, 1.0, 1.2, 1.5, 2.0, 3.0, 5.0, 10.0, 20.0];
        let metallicities = [0.0001, 0.001, 0.004, 0.008, 0.014, 0.02, 0.03];
        let schemes = [
            OvershootScheme::None,
            OvershootScheme::Exponential,
            OvershootScheme::Step,
            OvershootScheme::Other,
        ];
        let tunings = [None, Some(0.0), Some(0.005), Some(0.016), Some(0.2)];
        let mut seen = HashSet::new();
        let mut total = 0;
        for &m in &masses {
            for &z in &metallicities {
                for &s in &schemes {
                    for &f in &tunings {
                        for &f0 in &tunings {
                            total += 1;
                            seen.insert(job_id(&row(m, z, s, f, f0)));
                        }
                    }
                }
            }
        }
        assert_eq!(seen.len(), total);
    }
}
