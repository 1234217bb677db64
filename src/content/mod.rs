//! Content sources for mounts
//!
//! A mount's `content` object names where the bytes come from. The variant
//! is picked by looking for a marker field, in order: `taskId`,
//! `namespace`, `url`, `raw`, `base64`.

pub mod download;

use crate::clients::{Index, Queue};
use crate::config::schema::HttpConfig;
use crate::error::{WardenError, WardenResult};
use crate::fsutil;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use tracing::info;

/// An artifact of a specific task
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactContent {
    pub task_id: String,
    pub artifact: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// An artifact of whichever task is indexed under a namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexedContent {
    pub namespace: String,
    pub artifact: String,
}

/// A file served over HTTP(S)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UrlContent {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Literal text
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawContent {
    pub raw: String,
}

/// Literal bytes, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Base64Content {
    pub base64: String,
}

/// Where the bytes of a mount come from
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub enum ContentSource {
    Artifact(ArtifactContent),
    Indexed(IndexedContent),
    Url(UrlContent),
    Raw(RawContent),
    Base64(Base64Content),
}

/// Result of downloading a content source
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub bytes: u64,
    pub sha256: String,
}

impl TryFrom<serde_json::Value> for ContentSource {
    type Error = WardenError;

    fn try_from(value: serde_json::Value) -> WardenResult<Self> {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: &str,
            value: serde_json::Value,
        ) -> WardenResult<T> {
            serde_json::from_value(value).map_err(|e| {
                WardenError::MalformedPayload(format!("invalid {} content: {}", kind, e))
            })
        }

        let marker = ["taskId", "namespace", "url", "raw", "base64"]
            .into_iter()
            .find(|field| value.get(field).is_some());

        match marker {
            Some("taskId") => parse("artifact", value).map(Self::Artifact),
            Some("namespace") => parse("indexed", value).map(Self::Indexed),
            Some("url") => parse("url", value).map(Self::Url),
            Some("raw") => parse("raw", value).map(Self::Raw),
            Some("base64") => parse("base64", value).map(Self::Base64),
            _ => Err(WardenError::Unrecognised {
                what: "content",
                json: value.to_string(),
            }),
        }
    }
}

impl ContentSource {
    /// Parse a content object from a mount declaration
    pub fn from_json(value: &serde_json::Value) -> WardenResult<Self> {
        Self::try_from(value.clone())
    }

    /// Cache key identifying the content. Sources with equal keys have
    /// equal content.
    ///
    /// Indexed content has no key until [`resolve`](Self::resolve)d, since
    /// the indexed task can change between lookups.
    pub fn unique_key(&self) -> Option<String> {
        match self {
            Self::Artifact(a) => Some(format!("artifact:{}:{}", a.task_id, a.artifact)),
            Self::Indexed(_) => None,
            Self::Url(u) => Some(format!("urlcontent:{}", u.url)),
            Self::Raw(r) => Some(format!("Raw content: {}", r.raw)),
            Self::Base64(b) => Some(format!("Base64 content: {}", b.base64)),
        }
    }

    /// SHA256 the content must have, if known up front.
    ///
    /// Literal content is its own checksum.
    pub fn required_sha256(&self) -> Option<String> {
        match self {
            Self::Artifact(a) => a.sha256.clone(),
            Self::Indexed(_) => None,
            Self::Url(u) => u.sha256.clone(),
            Self::Raw(r) => Some(fsutil::sha256_bytes(r.raw.as_bytes())),
            Self::Base64(b) => download::decode_base64(&b.base64)
                .ok()
                .map(|bytes| fsutil::sha256_bytes(&bytes)),
        }
    }

    /// Tasks whose artifacts this content reads; each must be a declared
    /// dependency of the mounting task
    pub fn task_dependencies(&self) -> Vec<String> {
        match self {
            Self::Artifact(a) => vec![a.task_id.clone()],
            _ => Vec::new(),
        }
    }

    /// Scopes needed to read this content. Always empty: the queue and the
    /// index enforce their own scopes.
    pub fn required_scopes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Replace indexed content by the artifact it currently points at
    pub async fn resolve(&self, index: &dyn Index) -> WardenResult<Self> {
        let Self::Indexed(indexed) = self else {
            return Ok(self.clone());
        };
        let task = index
            .find_task(&indexed.namespace)
            .await
            .map_err(|e| WardenError::IndexLookup {
                namespace: indexed.namespace.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self::Artifact(ArtifactContent {
            task_id: task.task_id,
            artifact: indexed.artifact.clone(),
            sha256: None,
        }))
    }

    /// Fetch the content to `dest` and hash it.
    ///
    /// Indexed content must be resolved first.
    pub async fn download(
        &self,
        queue: &dyn Queue,
        http: &HttpConfig,
        dest: &Path,
    ) -> WardenResult<Downloaded> {
        let desc = self.to_string();
        let bytes = match self {
            Self::Artifact(a) => {
                info!("[mounts] Downloading {} to {}", desc, dest.display());
                queue
                    .download_artifact_to_file(&a.task_id, None, &a.artifact, dest)
                    .await?
            }
            Self::Indexed(_) => {
                return Err(WardenError::internal(format!(
                    "{} must be resolved before download",
                    desc
                )))
            }
            Self::Url(u) => download::fetch_url(&u.url, &desc, dest, http).await?,
            Self::Raw(r) => download::write_literal(r.raw.clone().into_bytes(), &desc, dest).await?,
            Self::Base64(b) => {
                let decoded = download::decode_base64(&b.base64)?;
                download::write_literal(decoded, &desc, dest).await?
            }
        };

        let path = dest.to_path_buf();
        let sha256 = tokio::task::spawn_blocking(move || fsutil::sha256_file(&path))
            .await
            .map_err(|e| WardenError::internal(format!("hash task failed: {}", e)))?
            .map_err(|e| {
                WardenError::internal(format!(
                    "cannot calculate SHA256 of file {} that was just downloaded: {}",
                    dest.display(),
                    e
                ))
            })?;

        info!(
            "[mounts] Downloaded {} bytes with SHA256 {} from {} to {}",
            bytes,
            sha256,
            desc,
            dest.display()
        );
        Ok(Downloaded { bytes, sha256 })
    }
}

impl fmt::Display for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artifact(a) => write!(f, "task {} artifact {}", a.task_id, a.artifact),
            Self::Indexed(i) => write!(f, "namespace {} artifact {}", i.namespace, i.artifact),
            Self::Url(u) => write!(f, "url {}", u.url),
            Self::Raw(r) => write!(f, "Raw ({})", r.raw),
            Self::Base64(b) => write!(f, "Base64 ({})", b.base64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::IndexedTask;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedIndex(&'static str);

    #[async_trait]
    impl Index for FixedIndex {
        async fn find_task(&self, namespace: &str) -> WardenResult<IndexedTask> {
            Ok(IndexedTask {
                namespace: namespace.to_string(),
                task_id: self.0.to_string(),
            })
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl Index for BrokenIndex {
        async fn find_task(&self, namespace: &str) -> WardenResult<IndexedTask> {
            Err(WardenError::User(format!("no task indexed at {}", namespace)))
        }
    }

    #[test]
    fn detects_marker_fields() {
        let artifact = ContentSource::from_json(&json!({
            "taskId": "KTBKfEgxR5GdfIIREQIvFQ",
            "artifact": "public/build/tool.tar.gz",
            "sha256": "abc"
        }))
        .unwrap();
        assert_eq!(
            artifact.unique_key().unwrap(),
            "artifact:KTBKfEgxR5GdfIIREQIvFQ:public/build/tool.tar.gz"
        );
        assert_eq!(artifact.required_sha256().as_deref(), Some("abc"));
        assert_eq!(artifact.task_dependencies(), vec!["KTBKfEgxR5GdfIIREQIvFQ"]);

        let url = ContentSource::from_json(&json!({"url": "https://example.com/a"})).unwrap();
        assert_eq!(url.unique_key().unwrap(), "urlcontent:https://example.com/a");
        assert_eq!(url.to_string(), "url https://example.com/a");
        assert!(url.required_sha256().is_none());

        let raw = ContentSource::from_json(&json!({"raw": "hello"})).unwrap();
        assert_eq!(raw.unique_key().unwrap(), "Raw content: hello");
        assert_eq!(raw.to_string(), "Raw (hello)");

        let b64 = ContentSource::from_json(&json!({"base64": "aGVsbG8="})).unwrap();
        assert_eq!(b64.unique_key().unwrap(), "Base64 content: aGVsbG8=");
        assert_eq!(b64.required_sha256(), raw.required_sha256());
    }

    #[test]
    fn rejects_unknown_shapes() {
        let err = ContentSource::from_json(&json!({"ftp": "ftp://example.com"})).unwrap_err();
        assert!(matches!(err, WardenError::Unrecognised { what: "content", .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedPayload);

        let err = ContentSource::from_json(&json!({"taskId": "abc"})).unwrap_err();
        assert!(matches!(err, WardenError::MalformedPayload(_)));
    }

    #[test]
    fn deserializes_inside_other_structs() {
        #[derive(Deserialize)]
        struct Holder {
            content: ContentSource,
        }
        let holder: Holder =
            serde_json::from_value(json!({"content": {"namespace": "a.b.c", "artifact": "x"}}))
                .unwrap();
        assert_eq!(holder.content.to_string(), "namespace a.b.c artifact x");
        assert!(holder.content.unique_key().is_none());
    }

    #[tokio::test]
    async fn resolve_indexed_content() {
        let indexed = ContentSource::Indexed(IndexedContent {
            namespace: "project.releases.latest".to_string(),
            artifact: "public/tool".to_string(),
        });

        let resolved = indexed.resolve(&FixedIndex("fF2lNUvjQXm7vXgy9SPTYA")).await.unwrap();
        assert_eq!(
            resolved.unique_key().unwrap(),
            "artifact:fF2lNUvjQXm7vXgy9SPTYA:public/tool"
        );

        let err = indexed.resolve(&BrokenIndex).await.unwrap_err();
        assert!(matches!(err, WardenError::IndexLookup { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::TaskFailure);
    }
}
