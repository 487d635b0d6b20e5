use core::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Unique, immutable name of a calculation.
///
/// The name doubles as the working directory name under the runs root, so it
/// is restricted to a single safe path component:
/// - ASCII letters, digits, `-`, `_` and `.`
/// - no leading `.`
/// - at most 128 bytes
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CalcName(String);

impl CalcName {
    pub const MAX_LEN: usize = 128;

    pub fn parse(raw: &str) -> CoreResult<Self> {
        let invalid = |reason| CoreError::InvalidName {
            name: raw.to_string(),
            reason,
        };

        if raw.is_empty() {
            return Err(invalid("name is empty"));
        }
        if raw.len() > Self::MAX_LEN {
            return Err(invalid("name is longer than 128 bytes"));
        }
        if raw.starts_with('.') {
            return Err(invalid("name must not start with '.'"));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid("only ASCII letters, digits, '-', '_' and '.' are allowed"));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Working directory owned by this calculation under `runs_root`.
    pub fn working_directory(&self, runs_root: &Path) -> PathBuf {
        runs_root.join(&self.0)
    }
}

impl TryFrom<String> for CalcName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CalcName> for String {
    fn from(name: CalcName) -> Self {
        name.0
    }
}

impl AsRef<str> for CalcName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CalcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CalcName({})", self.0)
    }
}

impl fmt::Display for CalcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
