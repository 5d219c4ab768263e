//! `access.json` handed to each student after provisioning

use labfleet_workspace::StudentId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessInfo {
    pub student_id: StudentId,
    pub url: String,
}

/// Write `<dir>/<student>/access.json`, replacing any previous file
///
/// # Errors
/// I/O errors creating the directory or writing the file.
pub async fn write_access_file(dir: &Path, info: &AccessInfo) -> std::io::Result<PathBuf> {
    let student_dir = dir.join(info.student_id.as_str());
    tokio::fs::create_dir_all(&student_dir).await?;
    let path = student_dir.join("access.json");
    let body = serde_json::to_vec_pretty(info)?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

/// Remove the student's access file if present
///
/// # Errors
/// I/O errors other than the file being absent.
pub async fn remove_access_file(dir: &Path, student: &StudentId) -> std::io::Result<()> {
    let path = dir.join(student.as_str()).join("access.json");
    match tokio::fs::remove_file(&path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
