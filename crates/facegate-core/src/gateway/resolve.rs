//! Turning request content into the raw buffer handed to the engine.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::RequestError;
use crate::protocol::ContentKind;

/// Resolve `content` according to the wire `kind`.
///
/// Paths are read from disk; inline content is standard base64. An empty
/// result is rejected since engines cannot process it.
pub async fn resolve_content(kind: i32, content: &str) -> Result<Vec<u8>, RequestError> {
    let buffer = match ContentKind::from_wire(kind) {
        Some(ContentKind::Path) => {
            tokio::fs::read(content)
                .await
                .map_err(|source| RequestError::ResourceNotFound {
                    path: content.to_string(),
                    source,
                })?
        }
        Some(ContentKind::Inline) => STANDARD
            .decode(content)
            .map_err(|e| RequestError::InvalidParameters(format!("bad base64: {e}")))?,
        None => {
            return Err(RequestError::InvalidParameters(format!(
                "unknown content type {kind}"
            )));
        }
    };

    if buffer.is_empty() {
        return Err(RequestError::InvalidParameters("empty content".into()));
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::result_code;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_inline_decodes() {
        let buf = resolve_content(1, "YWJjZA==").await.unwrap();
        assert_eq!(buf, b"abcd");
    }

    #[tokio::test]
    async fn test_inline_invalid_base64() {
        let err = resolve_content(1, "not base64!").await.unwrap_err();
        assert_eq!(err.code(), result_code::INVALID_PARAMETERS);
    }

    #[tokio::test]
    async fn test_inline_empty() {
        let err = resolve_content(1, "").await.unwrap_err();
        assert_eq!(err.code(), result_code::INVALID_PARAMETERS);
    }

    #[tokio::test]
    async fn test_path_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("face.jpg");
        tokio::fs::write(&path, b"\xff\xd8\xff").await.unwrap();

        let buf = resolve_content(0, path.to_str().unwrap()).await.unwrap();
        assert_eq!(buf, b"\xff\xd8\xff");
    }

    #[tokio::test]
    async fn test_path_missing() {
        let err = resolve_content(0, "/nonexistent/face.jpg").await.unwrap_err();
        assert_eq!(err.code(), result_code::RESOURCE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_path_empty_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.jpg");
        tokio::fs::write(&path, b"").await.unwrap();

        let err = resolve_content(0, path.to_str().unwrap()).await.unwrap_err();
        assert_eq!(err.code(), result_code::INVALID_PARAMETERS);
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let err = resolve_content(7, "YWJjZA==").await.unwrap_err();
        assert_eq!(err.code(), result_code::INVALID_PARAMETERS);
    }
}
