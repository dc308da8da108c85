//! Version discovery on the vendor's directory listing.
//!
//! The listing is plain HTML. Any token of the form
//! `arksigner-pub-<major>.<minor>.<patch>.deb` counts, wherever it appears
//! (href, link text, or both), and versions compare numerically.

use semver::Version;

pub const PACKAGE_PREFIX: &str = "arksigner-pub-";
pub const PACKAGE_SUFFIX: &str = ".deb";

/// File name of the package for `version`.
pub fn package_file_name(version: &Version) -> String {
    format!("{PACKAGE_PREFIX}{version}{PACKAGE_SUFFIX}")
}

/// All versions mentioned in `content`, in order of appearance.
///
/// Tokens whose components overflow `u64` are dropped.
pub fn find_versions(content: &str) -> Vec<Version> {
    let mut versions = Vec::new();
    let mut rest = content;

    while let Some(pos) = rest.find(PACKAGE_PREFIX) {
        rest = &rest[pos + PACKAGE_PREFIX.len()..];
        if let Some(version) = parse_version_token(rest) {
            versions.push(version);
        }
    }

    versions
}

/// Highest version in `content`, if any.
pub fn select_latest(content: &str) -> Option<Version> {
    find_versions(content).into_iter().max()
}

/// Parse `X.Y.Z.deb` at the start of `input`.
fn parse_version_token(input: &str) -> Option<Version> {
    let mut parts = [0u64; 3];
    let mut cursor = input;

    for (index, slot) in parts.iter_mut().enumerate() {
        let digits = cursor.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        *slot = cursor[..digits].parse().ok()?;
        cursor = &cursor[digits..];

        if index < 2 {
            cursor = cursor.strip_prefix('.')?;
        }
    }

    cursor.starts_with(PACKAGE_SUFFIX).then(|| Version::new(parts[0], parts[1], parts[2]))
}
