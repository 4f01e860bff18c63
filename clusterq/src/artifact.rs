use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::job::ClaimToken;

/// Opaque reference to a stored blob.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    /// Blob name for the output of one claim. Distinct per attempt, so a
    /// stale run never overwrites the output a newer claim finalized with.
    pub fn for_claim(claim: &ClaimToken) -> Self {
        Self(format!("job_{}_{}.json", claim.job_id, claim.attempt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Narrow interface to the shared artifact area.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist the result blob of one claim of a job and return a reference
    /// to it.
    async fn write_blob(&self, claim: &ClaimToken, bytes: Vec<u8>) -> Result<ArtifactRef>;

    /// Read back a blob written by [`ArtifactStore::write_blob`].
    async fn read_blob(&self, artifact: &ArtifactRef) -> Result<Vec<u8>>;
}

/// Output captured from a payload, stored as the job's result blob.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn from_bytes(stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    pub fn to_blob(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueueError::Artifact(e.to_string()))
    }

    pub fn from_blob(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Artifact(e.to_string()))
    }
}

/// Stores blobs as files under a directory on a shared filesystem.
///
/// References are file names relative to the root, so a reference written
/// on one machine resolves on any other machine mounting the same root.
#[derive(Clone, Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, artifact: &ArtifactRef) -> Result<PathBuf> {
        let name = artifact.as_str();
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(QueueError::Artifact(format!("invalid artifact ref {name:?}")));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write_blob(&self, claim: &ClaimToken, bytes: Vec<u8>) -> Result<ArtifactRef> {
        tokio::fs::create_dir_all(&self.root).await?;
        let artifact = ArtifactRef::for_claim(claim);
        let path = self.root.join(artifact.as_str());
        // Write then rename so readers never observe a partial blob.
        let tmp = self.root.join(format!(".{artifact}.tmp"));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(claim = %claim, path = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(artifact)
    }

    async fn read_blob(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        let path = self.resolve(artifact)?;
        Ok(tokio::fs::read(&path).await?)
    }
}
