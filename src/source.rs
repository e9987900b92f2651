use crate::EmployeeId;
use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// The prefix of an employee's photo directory; the employee's identifier follows it.
pub const EMPLOYEE_DIR_PREFIX: &str = "employee_";

/// A marker file placing an employee's directory out of the index.
pub const INACTIVE_MARKER: &str = ".inactive";

/// The file extensions treated as photos.
pub const PHOTO_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// An employee permitted to be recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Employee {
    /// The employee's identifier.
    pub id: EmployeeId,
}

/// A reference photo of an employee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhotoRef {
    /// The employee pictured.
    pub employee_id: EmployeeId,
    /// Where the photo is kept.
    pub path: PathBuf,
}

/// The authoritative store of employees and their reference photos.
pub trait EmployeePhotoSource: Send + Sync {
    /// List every employee who should be recognisable.
    fn list_active_employees(&self) -> anyhow::Result<Vec<Employee>>;

    /// List an employee's reference photos.
    fn list_photos(&self, employee_id: EmployeeId) -> anyhow::Result<Vec<PhotoRef>>;

    /// Read a photo's bytes.
    fn read_photo(&self, photo: &PhotoRef) -> anyhow::Result<Bytes>;
}

/// Photos kept on disk, one directory per employee.
///
/// ```text
/// <root>/employee_7/front.jpg
/// <root>/employee_7/side.png
/// <root>/employee_9/.inactive
/// <root>/employee_9/front.jpg
/// ```
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Create a source over a photo directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The photo directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding an employee's photos.
    pub fn employee_dir(&self, employee_id: EmployeeId) -> PathBuf {
        self.root
            .join(format!("{}{}", EMPLOYEE_DIR_PREFIX, employee_id))
    }
}

fn is_photo(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            PHOTO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(e))
        })
        .unwrap_or(false)
}

impl EmployeePhotoSource for DirectorySource {
    fn list_active_employees(&self) -> anyhow::Result<Vec<Employee>> {
        let mut employees = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("cannot list {}", self.root.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let id = match name
                .to_str()
                .and_then(|n| n.strip_prefix(EMPLOYEE_DIR_PREFIX))
                .and_then(|id| id.parse::<EmployeeId>().ok())
            {
                Some(id) => id,
                None => continue,
            };
            if entry.path().join(INACTIVE_MARKER).exists() {
                continue;
            }
            employees.push(Employee { id });
        }
        employees.sort_unstable_by_key(|e| e.id);
        Ok(employees)
    }

    fn list_photos(&self, employee_id: EmployeeId) -> anyhow::Result<Vec<PhotoRef>> {
        let dir = self.employee_dir(employee_id);
        let mut paths = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("cannot list {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_file() && is_photo(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths
            .into_iter()
            .map(|path| PhotoRef { employee_id, path })
            .collect())
    }

    fn read_photo(&self, photo: &PhotoRef) -> anyhow::Result<Bytes> {
        let bytes = fs::read(&photo.path)
            .with_context(|| format!("cannot read {}", photo.path.display()))?;
        Ok(Bytes::from(bytes))
    }
}
