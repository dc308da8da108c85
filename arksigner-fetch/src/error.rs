use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("{url} returned status {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("invalid --deb: {0}")]
    InvalidReference(String),
    #[error("no arksigner-pub-X.Y.Z.deb found at {0}")]
    NoVersionFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_reference_display() {
        let err = FetchError::InvalidReference("foo.rpm".to_string());
        assert_eq!(err.to_string(), "invalid --deb: foo.rpm");
    }

    #[test]
    fn http_status_display() {
        let err = FetchError::HttpStatus {
            url: "https://example.com/files/".to_string(),
            status: 404,
        };
        assert_eq!(
            err.to_string(),
            "https://example.com/files/ returned status 404"
        );
    }
}
