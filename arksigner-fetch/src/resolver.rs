use crate::error::FetchError;
use crate::index::{package_file_name, select_latest};
use crate::source::PackageSource;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use semver::Version;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const DEFAULT_INDEX_URL: &str = "https://downloads.arksigner.com/files/";
pub const DEFAULT_DESTINATION: &str = "/tmp/arksigner.deb";

const INDEX_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// A package staged at a fixed local path.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub path: PathBuf,
    /// The URL or path the package was taken from.
    pub origin: String,
    /// Set when the version was discovered through the index.
    pub version: Option<Version>,
    pub sha256: String,
}

pub struct Resolver {
    client: Client,
    index_url: String,
    destination: PathBuf,
}

impl Resolver {
    pub fn new() -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("arksigner-manager"));

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|err| FetchError::Network(err.to_string()))?;

        Ok(Self {
            client,
            index_url: DEFAULT_INDEX_URL.to_string(),
            destination: PathBuf::from(DEFAULT_DESTINATION),
        })
    }

    pub fn with_index_url(mut self, url: impl Into<String>) -> Self {
        self.index_url = url.into();
        self
    }

    pub fn with_destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = path.into();
        self
    }

    /// Stage `reference` at the destination path.
    ///
    /// `auto` re-queries the index on every call.
    pub fn resolve(&self, reference: &str) -> Result<ResolvedPackage, FetchError> {
        match PackageSource::from_str(reference)? {
            PackageSource::Auto => {
                let (version, url) = self.latest_url()?;
                info!(%version, %url, "Auto-detected latest version");
                self.download(&url)?;
                self.finish(url, Some(version))
            }
            PackageSource::Url(url) => {
                self.download(&url)?;
                self.finish(url, None)
            }
            PackageSource::Local(path) => {
                self.stage_local(&path)?;
                self.finish(path.display().to_string(), None)
            }
        }
    }

    /// Highest version on the index and its download URL.
    pub fn latest_url(&self) -> Result<(Version, String), FetchError> {
        let listing = self.fetch_index()?;
        let version = select_latest(&listing)
            .ok_or_else(|| FetchError::NoVersionFound(self.index_url.clone()))?;
        let url = format!(
            "{}/{}",
            self.index_url.trim_end_matches('/'),
            package_file_name(&version)
        );
        Ok((version, url))
    }

    fn fetch_index(&self) -> Result<String, FetchError> {
        debug!(url = %self.index_url, "Fetching package index");
        let response = self
            .client
            .get(&self.index_url)
            .timeout(INDEX_TIMEOUT)
            .send()
            .map_err(|err| FetchError::Network(err.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                url: self.index_url.clone(),
                status: response.status().as_u16(),
            });
        }

        response
            .text()
            .map_err(|err| FetchError::Network(err.to_string()))
    }

    fn download(&self, url: &str) -> Result<(), FetchError> {
        debug!(%url, dest = %self.destination.display(), "Downloading package");
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FetchError::Network(err.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut staged = self.staging_file()?;
        response
            .copy_to(staged.as_file_mut())
            .map_err(|err| FetchError::Network(err.to_string()))?;
        self.install_staged(staged)
    }

    fn stage_local(&self, path: &Path) -> Result<(), FetchError> {
        let is_deb = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(".deb"));

        if !path.is_file() || !is_deb {
            return Err(FetchError::InvalidReference(path.display().to_string()));
        }

        if same_file(path, &self.destination) {
            return Ok(());
        }

        let mut staged = self.staging_file()?;
        io::copy(&mut File::open(path)?, staged.as_file_mut())?;
        self.install_staged(staged)
    }

    /// A temp file next to the destination, so the final rename stays on
    /// one filesystem.
    fn staging_file(&self) -> Result<NamedTempFile, FetchError> {
        let dir = match self.destination.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        Ok(NamedTempFile::new_in(dir)?)
    }

    /// Rename the staged file over the destination. Whatever was at the
    /// destination, a symlink included, is replaced rather than written
    /// through.
    fn install_staged(&self, staged: NamedTempFile) -> Result<(), FetchError> {
        staged.as_file().sync_all()?;
        staged
            .persist(&self.destination)
            .map_err(|err| FetchError::Io(err.error))?;
        Ok(())
    }

    fn finish(
        &self,
        origin: String,
        version: Option<Version>,
    ) -> Result<ResolvedPackage, FetchError> {
        let sha256 = sha256_file(&self.destination)?;
        Ok(ResolvedPackage {
            path: self.destination.clone(),
            origin,
            version,
            sha256,
        })
    }
}

pub fn sha256_file(path: &Path) -> Result<String, FetchError> {
    let bytes = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// `b` is never considered the same file when it is a symlink.
fn same_file(a: &Path, b: &Path) -> bool {
    let b_is_link = fs::symlink_metadata(b).is_ok_and(|meta| meta.file_type().is_symlink());
    if b_is_link {
        return false;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
