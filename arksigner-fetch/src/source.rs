use crate::error::FetchError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where the package comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// An `http://` or `https://` URL.
    Url(String),
    /// A `.deb` file already on disk.
    Local(PathBuf),
    /// Latest version listed on the download index.
    Auto,
}

impl PackageSource {
    const AUTO: &'static str = "auto";

    pub fn is_url(value: &str) -> bool {
        value.starts_with("http://") || value.starts_with("https://")
    }
}

impl FromStr for PackageSource {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(FetchError::InvalidReference(value.to_string()));
        }
        if trimmed == Self::AUTO {
            return Ok(Self::Auto);
        }
        if Self::is_url(trimmed) {
            return Ok(Self::Url(trimmed.to_string()));
        }
        Ok(Self::Local(PathBuf::from(trimmed)))
    }
}

impl fmt::Display for PackageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageSource::Url(url) => write!(f, "{url}"),
            PackageSource::Local(path) => write!(f, "{}", path.display()),
            PackageSource::Auto => write!(f, "{}", Self::AUTO),
        }
    }
}
