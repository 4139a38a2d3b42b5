//! Upload batch assembler
//!
//! Collects photos, a description and a meal type into one `/upload-meal`
//! submission. Every photo gets a preview handle: a temporary copy on disk
//! that is deleted when the photo is removed or the batch goes away.

use bytes::Bytes;
use std::io::Write;
use std::path::Path;
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::api::{MealUpload, NutritionApi, UploadFile};
use crate::cache::{SnapshotCache, SnapshotSource};
use crate::error::{ClientError, Result};
use crate::model::MealType;
use crate::session::SessionStore;

#[derive(Debug)]
pub struct UploadBatch {
    files: Vec<UploadFile>,
    previews: Vec<TempPath>,
    pub description: String,
    pub meal_type: MealType,
}

/// A submission that did not go through. The batch is handed back intact so
/// it can be retried.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct UploadRejected {
    pub error: ClientError,
    pub batch: UploadBatch,
}

impl UploadBatch {
    /// Empty batch preset to the suggested meal type
    pub fn open(meal_type: MealType) -> Self {
        Self {
            files: Vec::new(),
            previews: Vec::new(),
            description: String::new(),
            meal_type,
        }
    }

    pub fn files(&self) -> &[UploadFile] {
        &self.files
    }

    pub fn previews(&self) -> impl Iterator<Item = &Path> {
        self.previews.iter().map(AsRef::<Path>::as_ref)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Append photos. Either every file gets a preview and is added, or
    /// nothing is.
    pub fn add_files(&mut self, files: Vec<UploadFile>) -> Result<()> {
        let previews = files
            .iter()
            .map(write_preview)
            .collect::<Result<Vec<_>>>()?;

        debug!(count = files.len(), "Photos added to batch");
        self.files.extend(files);
        self.previews.extend(previews);
        Ok(())
    }

    /// Read a photo from disk and append it.
    pub fn add_path(&mut self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)
            .map_err(|e| ClientError::Storage(format!("{}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "photo".to_string());
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        self.add_files(vec![UploadFile {
            file_name,
            content_type,
            data: Bytes::from(data),
        }])
    }

    /// Remove the photo at `index` and release its preview. Out of range is
    /// a no-op.
    pub fn remove_at(&mut self, index: usize) {
        if index >= self.files.len() {
            return;
        }
        self.files.remove(index);
        let preview = self.previews.remove(index);
        if let Err(e) = preview.close() {
            warn!(error = %e, "Failed to delete photo preview");
        }
    }

    /// Reject a batch with neither photos nor text.
    pub fn validate(&self) -> Result<()> {
        if self.files.is_empty() && self.description.trim().is_empty() {
            return Err(ClientError::Validation(
                "Add a photo or describe the meal".to_string(),
            ));
        }
        Ok(())
    }

    fn to_upload(&self) -> MealUpload {
        MealUpload {
            files: self.files.clone(),
            description: self.description.trim().to_string(),
            meal_type: self.meal_type,
        }
    }

    /// Send the batch. On success the batch is consumed (previews deleted)
    /// and a silent refresh brings in the new meal.
    pub async fn submit(
        self,
        api: &dyn NutritionApi,
        sessions: &SessionStore,
        cache: &SnapshotCache,
    ) -> std::result::Result<(), UploadRejected> {
        if let Err(error) = self.validate() {
            return Err(UploadRejected { error, batch: self });
        }
        let session = match sessions.require() {
            Ok(session) => session,
            Err(error) => return Err(UploadRejected { error, batch: self }),
        };

        let upload = self.to_upload();
        if let Err(e) = api.upload_meal(session.credential(), &upload).await {
            let error = sessions.fail(&session, upload_error(e));
            warn!(error = %error, photos = upload.files.len(), "Meal upload failed; batch kept");
            return Err(UploadRejected { error, batch: self });
        }

        info!(
            photos = upload.files.len(),
            meal_type = %upload.meal_type,
            "Meal uploaded"
        );
        drop(self);

        if let Err(e) = cache.refresh(&SnapshotSource::Session(session.clone()), true).await {
            sessions.fail(&session, e);
        }
        Ok(())
    }
}

fn write_preview(file: &UploadFile) -> Result<TempPath> {
    let extension = Path::new(&file.file_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut tmp = tempfile::Builder::new()
        .prefix("nutrisync-preview-")
        .suffix(&extension)
        .tempfile()
        .map_err(|e| ClientError::Storage(format!("Failed to create preview: {}", e)))?;
    tmp.write_all(&file.data)
        .map_err(|e| ClientError::Storage(format!("Failed to write preview: {}", e)))?;
    Ok(tmp.into_temp_path())
}

fn upload_error(err: ClientError) -> ClientError {
    match err {
        ClientError::RateLimited => ClientError::RateLimited,
        e if e.is_auth() => e,
        e => {
            let detail = e.detail().map(str::to_string).unwrap_or_else(|| e.to_string());
            ClientError::UploadFailed(detail)
        }
    }
}
