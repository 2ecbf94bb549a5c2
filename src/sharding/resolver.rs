//! Weight Resolution
//!
//! The sharding path needs a model's weight file on local disk before a
//! coordinator can load it. Weights live in a content-addressed store:
//! a manifest per (model, tag) names its layers by digest, and the layer
//! tagged as model weights points at a blob file named after that digest.
//! This core resolves; it never downloads. A missing model is the
//! caller's problem to fetch.

use std::path::{Path, PathBuf};

use crate::error::RouteError;

/// Manifest layer media type marking the weights blob
const MODEL_MEDIA_TYPE: &str = "application/vnd.ollama.image.model";

/// Registry path segment used by default-tagged models
const DEFAULT_REGISTRY: &str = "registry.ollama.ai/library";

/// Resolves model names to weight-file paths in the local store
#[derive(Clone, Debug)]
pub struct WeightResolver {
    store_root: PathBuf,
}

impl WeightResolver {
    /// Create a resolver over an explicit store root
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
        }
    }

    /// Resolver over the default per-user store (`~/.ollama/models`)
    #[must_use]
    pub fn default_store() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ollama")
            .join("models");
        Self::new(root)
    }

    /// Store root this resolver reads
    #[must_use]
    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    /// Resolve a model name/tag to its weight blob path
    ///
    /// Fails with [`RouteError::ModelNotFound`] when the manifest or blob
    /// is absent; the message tells the caller to fetch the model first.
    pub async fn resolve(&self, model: &str) -> Result<PathBuf, RouteError> {
        let (name, tag) = split_model(model);
        let manifest_path = self
            .store_root
            .join("manifests")
            .join(DEFAULT_REGISTRY)
            .join(&name)
            .join(&tag);

        let manifest_text = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|_| RouteError::ModelNotFound {
                model: model.to_string(),
                detail: format!("no manifest at {}", manifest_path.display()),
            })?;

        let manifest: serde_json::Value =
            serde_json::from_str(&manifest_text).map_err(|e| RouteError::ModelNotFound {
                model: model.to_string(),
                detail: format!("unreadable manifest: {e}"),
            })?;

        let digest = manifest
            .get("layers")
            .and_then(|layers| layers.as_array())
            .and_then(|layers| {
                layers.iter().find(|layer| {
                    layer
                        .get("mediaType")
                        .and_then(|m| m.as_str())
                        .is_some_and(|m| m == MODEL_MEDIA_TYPE)
                })
            })
            .and_then(|layer| layer.get("digest"))
            .and_then(|d| d.as_str())
            .ok_or_else(|| RouteError::ModelNotFound {
                model: model.to_string(),
                detail: "manifest has no model layer".to_string(),
            })?;

        // Blob filenames flatten "sha256:<hex>" into "sha256-<hex>".
        let blob_name = digest.replace(':', "-");
        let blob_path = self.store_root.join("blobs").join(blob_name);

        match tokio::fs::try_exists(&blob_path).await {
            Ok(true) => {
                tracing::debug!(model, path = %blob_path.display(), "resolved model weights");
                Ok(blob_path)
            }
            _ => Err(RouteError::ModelNotFound {
                model: model.to_string(),
                detail: format!("blob {} missing", blob_path.display()),
            }),
        }
    }
}

fn split_model(model: &str) -> (String, String) {
    match model.split_once(':') {
        Some((name, tag)) if !tag.is_empty() => (name.to_string(), tag.to_string()),
        _ => (model.to_string(), "latest".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_store(root: &Path, model: &str, tag: &str, digest_hex: &str) {
        let manifest_dir = root.join("manifests").join(DEFAULT_REGISTRY).join(model);
        tokio::fs::create_dir_all(&manifest_dir).await.unwrap();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "layers": [
                {
                    "mediaType": "application/vnd.ollama.image.template",
                    "digest": "sha256:aaaa"
                },
                {
                    "mediaType": MODEL_MEDIA_TYPE,
                    "digest": format!("sha256:{digest_hex}")
                }
            ]
        });
        tokio::fs::write(manifest_dir.join(tag), manifest.to_string())
            .await
            .unwrap();

        let blob_dir = root.join("blobs");
        tokio::fs::create_dir_all(&blob_dir).await.unwrap();
        tokio::fs::write(blob_dir.join(format!("sha256-{digest_hex}")), b"weights")
            .await
            .unwrap();
    }

    #[test]
    fn test_split_model() {
        assert_eq!(
            split_model("llama3.1:70b"),
            ("llama3.1".to_string(), "70b".to_string())
        );
        assert_eq!(
            split_model("llama3.1"),
            ("llama3.1".to_string(), "latest".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolve_finds_blob_by_digest() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path(), "llama3.1", "70b", "deadbeef").await;

        let resolver = WeightResolver::new(dir.path());
        let path = resolver.resolve("llama3.1:70b").await.unwrap();
        assert!(path.ends_with("blobs/sha256-deadbeef"));
    }

    #[tokio::test]
    async fn test_resolve_untagged_uses_latest() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path(), "phi", "latest", "cafe").await;

        let resolver = WeightResolver::new(dir.path());
        assert!(resolver.resolve("phi").await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_model_is_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = WeightResolver::new(dir.path());

        let err = resolver.resolve("absent:70b").await.unwrap_err();
        match err {
            RouteError::ModelNotFound { ref model, .. } => assert_eq!(model, "absent:70b"),
            other => panic!("expected ModelNotFound, got {other:?}"),
        }
        assert!(err.to_string().contains("fetch the model first"));
    }

    #[tokio::test]
    async fn test_missing_blob_is_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        write_store(dir.path(), "llama3.1", "70b", "deadbeef").await;
        // Remove the blob but keep the manifest.
        tokio::fs::remove_file(dir.path().join("blobs").join("sha256-deadbeef"))
            .await
            .unwrap();

        let resolver = WeightResolver::new(dir.path());
        assert!(matches!(
            resolver.resolve("llama3.1:70b").await,
            Err(RouteError::ModelNotFound { .. })
        ));
    }
}
