//! Package acquisition for arksigner-manager.
//!
//! Turns a package reference (a local `.deb` path, an `http(s)` URL, or the
//! literal `auto`) into a staged local file. `auto` scrapes the vendor's
//! directory listing and picks the highest `arksigner-pub-X.Y.Z.deb`.

pub mod error;
pub mod index;
pub mod resolver;
pub mod source;

pub use error::FetchError;
pub use resolver::{ResolvedPackage, Resolver};
pub use source::PackageSource;
