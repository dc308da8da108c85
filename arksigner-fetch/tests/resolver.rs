use arksigner_fetch::{FetchError, Resolver};
use mockito::Server;
use semver::Version;
use std::fs;
use tempfile::tempdir;

const LISTING: &str = r#"<html><body>
<a href="arksigner-pub-1.2.3.deb">arksigner-pub-1.2.3.deb</a>
<a href="arksigner-pub-2.3.12.deb">arksigner-pub-2.3.12.deb</a>
<a href="arksigner-pub-2.10.0.deb">arksigner-pub-2.10.0.deb</a>
</body></html>"#;

#[test]
fn auto_picks_highest_numeric_version() {
    let mut server = Server::new();
    server
        .mock("GET", "/files/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(LISTING)
        .create();
    let package = server
        .mock("GET", "/files/arksigner-pub-2.10.0.deb")
        .with_status(200)
        .with_body("deb-2.10.0")
        .create();

    let temp = tempdir().expect("tempdir");
    let dest = temp.path().join("arksigner.deb");
    let resolver = Resolver::new()
        .unwrap()
        .with_index_url(format!("{}/files/", server.url()))
        .with_destination(&dest);

    let resolved = resolver.resolve("auto").expect("resolve");

    package.assert();
    assert_eq!(resolved.version, Some(Version::new(2, 10, 0)));
    assert!(resolved.origin.ends_with("/files/arksigner-pub-2.10.0.deb"));
    assert_eq!(fs::read_to_string(dest).unwrap(), "deb-2.10.0");
}

#[test]
fn auto_queries_the_index_every_time() {
    let mut server = Server::new();
    let index = server
        .mock("GET", "/files/")
        .with_status(200)
        .with_body(LISTING)
        .expect(2)
        .create();

    let resolver = Resolver::new().unwrap().with_index_url(format!("{}/files/", server.url()));
    resolver.latest_url().expect("first");
    resolver.latest_url().expect("second");

    index.assert();
}

#[test]
fn auto_fails_when_listing_has_no_packages() {
    let mut server = Server::new();
    server
        .mock("GET", "/files/")
        .with_status(200)
        .with_body("<html>nothing here</html>")
        .create();

    let resolver = Resolver::new().unwrap().with_index_url(format!("{}/files/", server.url()));
    let err = resolver.latest_url().unwrap_err();
    assert!(matches!(err, FetchError::NoVersionFound(_)));
}

#[test]
fn auto_fails_when_index_is_unavailable() {
    let mut server = Server::new();
    server.mock("GET", "/files/").with_status(503).create();

    let resolver = Resolver::new().unwrap().with_index_url(format!("{}/files/", server.url()));
    let err = resolver.latest_url().unwrap_err();
    assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
}

#[test]
fn url_download_failure_is_reported() {
    let mut server = Server::new();
    server
        .mock("GET", "/missing.deb")
        .with_status(404)
        .create();

    let temp = tempdir().expect("tempdir");
    let resolver = Resolver::new().unwrap().with_destination(temp.path().join("arksigner.deb"));
    let err = resolver
        .resolve(&format!("{}/missing.deb", server.url()))
        .unwrap_err();

    assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    assert!(!temp.path().join("arksigner.deb").exists());
}
