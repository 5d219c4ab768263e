//! Class roster CSV for `batch`
//!
//! Rows are `student_id,enrolled_date,resource_limit`. The header row is
//! optional, `resource_limit` may be empty (meaning `standard`) and the
//! enrolment date is carried through untouched.

use labfleet_core::ResourceProfile;
use labfleet_workspace::StudentId;

/// One student to provision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub student: StudentId,
    pub enrolled: Option<String>,
    pub resources: ResourceProfile,
}

/// A row that could not be read
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("roster line {line}: {message}")]
pub struct RosterError {
    /// 1-based line number
    pub line: usize,
    pub message: String,
}

/// Parse the whole file; every bad row is reported, not just the first
///
/// # Errors
/// One [`RosterError`] per rejected row.
pub fn parse_roster(text: &str) -> Result<Vec<RosterEntry>, Vec<RosterError>> {
    let mut entries = Vec::new();
    let mut errors = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let row = raw.trim();
        if row.is_empty() || row.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = row.split(',').map(str::trim).collect();
        if line == 1 && fields[0].eq_ignore_ascii_case("student_id") {
            continue;
        }
        match parse_row(&fields) {
            Ok(entry) if entries.iter().any(|e: &RosterEntry| e.student == entry.student) => {
                errors.push(RosterError {
                    line,
                    message: format!("duplicate student {}", entry.student),
                });
            }
            Ok(entry) => entries.push(entry),
            Err(message) => errors.push(RosterError { line, message }),
        }
    }

    if errors.is_empty() {
        Ok(entries)
    } else {
        Err(errors)
    }
}

fn parse_row(fields: &[&str]) -> Result<RosterEntry, String> {
    if fields.len() > 3 {
        return Err(format!("expected at most 3 columns, found {}", fields.len()));
    }
    let student = StudentId::new(fields[0]).map_err(|e| e.to_string())?;
    let enrolled = fields
        .get(1)
        .filter(|s| !s.is_empty())
        .map(|s| (*s).to_string());
    let resources = match fields.get(2).filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse()?,
        None => ResourceProfile::default(),
    };
    Ok(RosterEntry {
        student,
        enrolled,
        resources,
    })
}
