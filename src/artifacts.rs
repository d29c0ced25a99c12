use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const EXTENSION: &str = "jpg";
const MAX_ID_LEN: usize = 128;

/// Directory of fully reassembled images, one `<image_id>.jpg` per image.
///
/// The presence of a file here is the only completion signal other parts of
/// the system rely on, so files only ever appear through an atomic rename.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory if it does not exist yet.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let dir = Self::new(root);
        fs::create_dir_all(&dir.root)?;
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, image_id: &str) -> Result<PathBuf> {
        validate_id(image_id)?;
        Ok(self.root.join(format!("{image_id}.{EXTENSION}")))
    }

    /// Invalid ids never have an artifact.
    pub fn exists(&self, image_id: &str) -> bool {
        self.path_for(image_id).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn read(&self, image_id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(image_id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ArtifactMissing(image_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write `bytes` as the artifact for `image_id`: temp file, fsync, rename.
    pub fn write(&self, image_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(image_id)?;
        let tmp = self.root.join(format!(".{image_id}.{EXTENSION}.part"));
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(path)
    }
}

/// Image ids become file names, so only a conservative charset is allowed.
pub fn validate_id(image_id: &str) -> Result<()> {
    let ok = !image_id.is_empty()
        && image_id.len() <= MAX_ID_LEN
        && image_id != "."
        && image_id != ".."
        && image_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidImageId(image_id.to_string()))
    }
}
