//! Google Drive paths.
//!
//! `/Reports/2024` lives in the user's "My Drive"; `//Finance/Reports/2024`
//! lives in the shared drive named `Finance`.

use std::fmt;
use std::ops::Div;
use std::str::FromStr;

use crate::error::{DriveError, DriveResult};

/// Path inside the user's drive or a shared drive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DrivePath {
    drive: String,
    components: Vec<String>,
}

impl DrivePath {
    /// Build a path from segments. The first segment carries the anchor.
    pub fn new<I, S>(segments: I) -> DriveResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut segments = segments.into_iter();
        let first = match segments.next().map(|s| s.as_ref().to_string()) {
            Some(s) if s.starts_with('/') => s,
            _ => {
                return Err(DriveError::invalid(
                    "The first path segment must start with '//' (in case of a shared drive) \
                     or '/' (in case of the user's own \"My Drive\" drive)",
                ))
            }
        };

        let mut path = Self {
            drive: String::new(),
            components: Vec::new(),
        };
        let rest = if first.starts_with("//") {
            let mut split = first.trim_start_matches('/').splitn(2, '/');
            path.drive = split.next().unwrap_or_default().to_string();
            if path.drive.is_empty() {
                return Err(DriveError::invalid("Missing shared drive name"));
            }
            split.next().unwrap_or_default().to_string()
        } else {
            first
        };

        path.push(&rest);
        for segment in segments {
            path.push(segment.as_ref());
        }
        Ok(path)
    }

    fn push(&mut self, segment: &str) {
        self.components.extend(
            segment
                .split('/')
                .filter(|c| !c.is_empty() && *c != ".")
                .map(str::to_string),
        );
    }

    /// Name of the shared drive, empty for the user's drive.
    pub fn drive(&self) -> &str {
        &self.drive
    }

    pub fn root(&self) -> &str {
        "/"
    }

    /// `//Drive/` or `/`.
    pub fn anchor(&self) -> String {
        if self.drive.is_empty() {
            "/".to_string()
        } else {
            format!("//{}/", self.drive)
        }
    }

    /// The anchor followed by every component.
    pub fn parts(&self) -> Vec<String> {
        let mut parts = Vec::with_capacity(self.components.len() + 1);
        parts.push(self.anchor());
        parts.extend(self.components.iter().cloned());
        parts
    }

    /// Path components below the anchor.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Final component, empty for an anchor.
    pub fn name(&self) -> &str {
        self.components.last().map(String::as_str).unwrap_or("")
    }

    pub fn parent(&self) -> Self {
        let mut parent = self.clone();
        parent.components.pop();
        parent
    }

    /// Append relative segments. Leading slashes do not reset the path.
    pub fn join(&self, segment: impl AsRef<str>) -> Self {
        let mut joined = self.clone();
        joined.push(segment.as_ref());
        joined
    }

    pub fn as_uri(&self) -> String {
        format!("gdrive:{}", self)
    }
}

impl fmt::Display for DrivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.drive.is_empty() {
            write!(f, "//{}", self.drive)?;
        }
        write!(f, "/{}", self.components.join("/"))
    }
}

impl FromStr for DrivePath {
    type Err = DriveError;

    fn from_str(s: &str) -> DriveResult<Self> {
        Self::new([s])
    }
}

impl<S: AsRef<str>> Div<S> for &DrivePath {
    type Output = DrivePath;

    fn div(self, rhs: S) -> DrivePath {
        self.join(rhs)
    }
}

impl<S: AsRef<str>> Div<S> for DrivePath {
    type Output = DrivePath;

    fn div(mut self, rhs: S) -> DrivePath {
        self.push(rhs.as_ref());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
