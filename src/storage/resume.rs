//! Resume data module
//!
//! Saves and loads the persisted download state of a torrent: the fragment
//! presence and piece verification bitsets plus the download directory.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use super::piece::PieceSnapshot;
use crate::error::TorrentError;

/// Resume data for a torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// Info hash as hex string
    pub info_hash: String,
    /// Directory the files were laid out under
    pub download_dir: String,
    #[serde(flatten)]
    pub snapshot: PieceSnapshot,
}

impl ResumeData {
    pub fn new(info_hash: &[u8; 20], download_dir: impl Into<String>, snapshot: PieceSnapshot) -> Self {
        Self {
            info_hash: hex::encode(info_hash),
            download_dir: download_dir.into(),
            snapshot,
        }
    }

    /// Whether this state belongs to the torrent with `info_hash`
    pub fn matches(&self, info_hash: &[u8; 20]) -> bool {
        self.info_hash.eq_ignore_ascii_case(&hex::encode(info_hash))
    }

    /// Serialize to a writer
    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, self).map_err(TorrentError::from)?;
        Ok(())
    }

    /// Deserialize from a reader
    ///
    /// Bitsets whose byte length disagrees with their bit length are rejected.
    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        let mut data: Self = serde_json::from_reader(reader).map_err(TorrentError::from)?;
        data.snapshot.have = data.snapshot.have.validated()?;
        data.snapshot.verified = data.snapshot.verified.validated()?;
        Ok(data)
    }

    /// Save to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let mut data = Vec::new();
        self.write_to(&mut data)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        Ok(())
    }

    /// Load from file, `None` if there is no file
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path).await?;
        Ok(Some(Self::read_from(data.as_slice())?))
    }
}

/// Resume data manager
#[derive(Debug, Clone)]
pub struct ResumeManager {
    resume_dir: PathBuf,
}

impl ResumeManager {
    /// Create a new resume manager
    pub fn new(resume_dir: PathBuf) -> Self {
        Self { resume_dir }
    }

    pub fn resume_dir(&self) -> &Path {
        &self.resume_dir
    }

    /// Get the resume file path for a torrent
    fn resume_file_path(&self, info_hash: &str) -> PathBuf {
        self.resume_dir.join(format!("{}.resume", info_hash))
    }

    /// Save resume data for a torrent
    pub async fn save_resume_data(&self, resume_data: &ResumeData) -> Result<()> {
        let resume_path = self.resume_file_path(&resume_data.info_hash);
        resume_data.save(&resume_path).await?;
        debug!("Saved resume data to {}", resume_path.display());
        Ok(())
    }

    /// Load resume data for a torrent
    pub async fn load_resume_data(&self, info_hash: &[u8; 20]) -> Result<Option<ResumeData>> {
        let resume_path = self.resume_file_path(&hex::encode(info_hash));
        let Some(data) = ResumeData::load(&resume_path).await? else {
            return Ok(None);
        };
        if !data.matches(info_hash) {
            return Err(TorrentError::validation_error_with_field(
                format!("{} belongs to another torrent", resume_path.display()),
                "info_hash"
            ).into());
        }
        info!("Loaded resume data from {}", resume_path.display());
        Ok(Some(data))
    }

    /// Delete resume data for a torrent
    pub async fn delete_resume_data(&self, info_hash: &[u8; 20]) -> Result<()> {
        let resume_path = self.resume_file_path(&hex::encode(info_hash));
        if resume_path.exists() {
            fs::remove_file(&resume_path).await?;
        }
        Ok(())
    }

    /// Check if resume data exists for a torrent
    pub fn has_resume_data(&self, info_hash: &[u8; 20]) -> bool {
        self.resume_file_path(&hex::encode(info_hash)).exists()
    }
}

impl Default for ResumeManager {
    fn default() -> Self {
        Self::new(PathBuf::from(".resume"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Bitfield;

    fn snapshot() -> PieceSnapshot {
        let mut have = Bitfield::new(7);
        have.set(0);
        have.set(6);
        let mut verified = Bitfield::new(4);
        verified.set(3);
        PieceSnapshot { have, verified }
    }

    #[test]
    fn test_resume_data_write_and_read() {
        let data = ResumeData::new(&[0xab; 20], "/tmp/dl", snapshot());
        let mut buf = Vec::new();
        data.write_to(&mut buf).unwrap();

        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.contains("\"download_dir\":\"/tmp/dl\""));
        assert!(text.contains("\"have\""));

        let loaded = ResumeData::read_from(buf.as_slice()).unwrap();
        assert_eq!(loaded, data);
        assert!(loaded.matches(&[0xab; 20]));
        assert!(!loaded.matches(&[0xac; 20]));
    }

    #[test]
    fn test_resume_data_rejects_truncated_bitset() {
        let json = r#"{"info_hash":"00","download_dir":"d",
            "have":{"len":20,"bits":[255]},
            "verified":{"len":4,"bits":[0]}}"#;
        assert!(ResumeData::read_from(json.as_bytes()).is_err());
    }

    #[test]
    fn test_resume_data_rejects_garbage() {
        let err = ResumeData::read_from(&b"{not json"[..]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_resume_manager_default() {
        let manager = ResumeManager::default();
        assert_eq!(manager.resume_dir(), Path::new(".resume"));
    }

    #[test]
    fn test_resume_manager_resume_file_path() {
        let manager = ResumeManager::new(PathBuf::from("/tmp/resume"));
        let path = manager.resume_file_path("abc123");
        assert_eq!(path, PathBuf::from("/tmp/resume/abc123.resume"));
    }

    #[tokio::test]
    async fn test_resume_manager_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResumeManager::new(dir.path().join("state"));
        let hash = [7u8; 20];

        assert!(manager.load_resume_data(&hash).await.unwrap().is_none());

        let data = ResumeData::new(&hash, "dl", snapshot());
        manager.save_resume_data(&data).await.unwrap();
        assert!(manager.has_resume_data(&hash));

        let loaded = manager.load_resume_data(&hash).await.unwrap().unwrap();
        assert_eq!(loaded.snapshot, data.snapshot);

        manager.delete_resume_data(&hash).await.unwrap();
        assert!(!manager.has_resume_data(&hash));
    }
}
