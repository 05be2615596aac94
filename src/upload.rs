use axum::extract::Multipart;
use axum::extract::multipart::Field;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::ApiError;

pub const ALLOWED_EXTENSIONS: [&str; 2] = ["txt", "md"];
const FILE_FIELD: &str = "file";

/// True when the part after the last `.` is an allowed extension (any case).
pub fn allowed_file(filename: &str) -> bool {
    filename.rsplit_once('.').is_some_and(|(_, ext)| {
        ALLOWED_EXTENSIONS
            .iter()
            .any(|allowed| ext.eq_ignore_ascii_case(allowed))
    })
}

/// Reduces a client-supplied name to a single safe path component.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_whitespace() => Some('_'),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => Some(c),
            _ => None,
        })
        .collect();
    cleaned.trim_start_matches(['.', '_']).to_string()
}

/// Scoped directory for `/upload` bodies. Each upload is staged under a unique
/// name, read back as UTF-8 and removed before the request returns.
#[derive(Debug, Clone)]
pub struct UploadDir {
    root: PathBuf,
}

impl UploadDir {
    pub async fn create(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Streams `field` into a uniquely named file under the upload directory.
    async fn stage(&self, filename: &str, mut field: Field<'_>) -> Result<StagedFile, ApiError> {
        let name = format!("{}-{}", Uuid::new_v4().simple(), sanitize_filename(filename));
        let path = self.root.join(name);

        let (mut file, staged) = StagedFile::create(path).await?;
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::debug!(path = %staged.path.display(), "Upload staged");
        Ok(staged)
    }

    /// Pulls the `file` part out of the form and returns its text content.
    /// Nothing is left on disk whichever way this returns.
    #[tracing::instrument(skip(self, multipart))]
    pub async fn intake(&self, mut multipart: Multipart) -> Result<String, ApiError> {
        while let Some(field) = multipart.next_field().await? {
            if field.name() != Some(FILE_FIELD) {
                continue;
            }

            let Some(filename) = field.file_name().map(str::to_owned) else {
                return Err(ApiError::NoFile);
            };
            if filename.is_empty() {
                return Err(ApiError::EmptyFilename);
            }
            if !allowed_file(&filename) {
                return Err(ApiError::InvalidFileType);
            }

            let staged = self.stage(&filename, field).await?;
            return staged.read_and_remove().await;
        }

        Err(ApiError::NoFile)
    }
}

/// A file in the upload directory that is deleted when this handle goes away.
#[derive(Debug)]
struct StagedFile {
    path: PathBuf,
    removed: bool,
}

impl StagedFile {
    /// The guard only exists once the file does.
    async fn create(path: PathBuf) -> std::io::Result<(tokio::fs::File, Self)> {
        let file = tokio::fs::File::create(&path).await?;
        Ok((
            file,
            Self {
                path,
                removed: false,
            },
        ))
    }

    async fn read_and_remove(mut self) -> Result<String, ApiError> {
        let content = tokio::fs::read_to_string(&self.path).await;

        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), "Failed to remove staged upload: {err}");
        }
        self.removed = true;

        content.map_err(|err| ApiError::FileRead(err.to_string()))
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), "Failed to remove staged upload: {err}");
            }
        }
    }
}
