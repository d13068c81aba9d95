//! Input resolution: normalise a user-supplied path or URL to raw bytes.
//!
//! The splitter works on bytes, not paths, so uploads from a database or
//! network stream need no temp file. For URL inputs we still download fully
//! before splitting — page rasterisation needs random access to the whole
//! document anyway.

use crate::error::DocFieldsError;
use std::path::PathBuf;
use tracing::{debug, info};

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to raw document bytes.
///
/// If the input is a URL, download it; if it is a local file, read it.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<Vec<u8>, DocFieldsError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(input).await
    }
}

async fn read_local(path_str: &str) -> Result<Vec<u8>, DocFieldsError> {
    let path = PathBuf::from(path_str);
    if !path.exists() {
        return Err(DocFieldsError::FileNotFound { path });
    }
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| DocFieldsError::FileNotFound { path: path.clone() })?;
    debug!("Read local document: {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes)
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, DocFieldsError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| DocFieldsError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            DocFieldsError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            DocFieldsError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(DocFieldsError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| DocFieldsError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}

/// Derive an upload filename from the input string (URL path segment or
/// file name), falling back to a generic name.
pub fn derive_filename(input: &str) -> String {
    if is_url(input) {
        if let Ok(parsed) = reqwest::Url::parse(input) {
            if let Some(mut segments) = parsed.path_segments() {
                if let Some(last) = segments.next_back() {
                    if !last.is_empty() {
                        return last.to_string();
                    }
                }
            }
        }
        "downloaded.pdf".to_string()
    } else {
        PathBuf::from(input)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document.pdf".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_from_url() {
        assert_eq!(
            derive_filename("https://example.com/forms/intake.pdf"),
            "intake.pdf"
        );
        assert_eq!(derive_filename("https://example.com/"), "downloaded.pdf");
    }

    #[test]
    fn filename_from_path() {
        assert_eq!(derive_filename("/data/uploads/scan.pdf"), "scan.pdf");
    }

    #[tokio::test]
    async fn missing_local_file() {
        let err = resolve_input("/definitely/not/a/real/file.pdf", 5).await;
        assert!(matches!(err, Err(DocFieldsError::FileNotFound { .. })));
    }
}
