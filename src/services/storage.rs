use anyhow::Result;
use chrono::{Duration, Utc};
use thiserror::Error;
use url::Url;

use crate::models::StoredFile;
use crate::services::database::{Database, UploadTicket};

const TICKET_TTL_MINUTES: i64 = 60;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload URL not found")]
    UnknownTicket,

    #[error("Upload URL expired")]
    Expired,

    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),

    #[error("Upload too large: {size} bytes, at most {max} allowed")]
    TooLarge { size: usize, max: usize },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Image blobs plus the single-use upload URLs that feed them.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    db: Database,
    base_url: Url,
    max_size: usize,
}

impl ObjectStore {
    pub fn new(db: Database, base_url: Url, max_size: usize) -> Self {
        Self {
            db,
            base_url,
            max_size,
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    /// Capability URL for a stored file.
    pub fn file_url(&self, file_id: &str) -> String {
        self.url_for(&format!("api/files/{}", file_id))
    }

    /// Issue a one-hour upload URL for `owner_id`.
    pub async fn create_upload_url(&self, owner_id: &str) -> Result<String> {
        let now = Utc::now();
        if let Err(e) = self.db.purge_expired_tickets(now).await {
            tracing::warn!("failed to purge expired upload tickets: {:#}", e);
        }

        let ticket = UploadTicket {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            expires_at: now + Duration::minutes(TICKET_TTL_MINUTES),
        };
        self.db.insert_upload_ticket(&ticket).await?;
        Ok(self.url_for(&format!("api/uploads/{}", ticket.id)))
    }

    /// Store an upload against its ticket. The ticket is consumed even when
    /// the body is rejected.
    pub async fn accept_upload(
        &self,
        ticket_id: &str,
        content_type: Option<&str>,
        data: Vec<u8>,
    ) -> Result<StoredFile, UploadError> {
        let ticket = self
            .db
            .take_upload_ticket(ticket_id)
            .await?
            .ok_or(UploadError::UnknownTicket)?;
        if ticket.expires_at <= Utc::now() {
            return Err(UploadError::Expired);
        }

        let mime_type = content_type
            .map(|c| c.split(';').next().unwrap_or(c).trim().to_ascii_lowercase())
            .unwrap_or_default();
        if !mime_type.starts_with("image/") {
            return Err(UploadError::UnsupportedType(if mime_type.is_empty() {
                "none".to_string()
            } else {
                mime_type
            }));
        }

        self.store(&ticket.owner_id, &mime_type, data).await
    }

    pub async fn store(&self, owner_id: &str, mime_type: &str, data: Vec<u8>) -> Result<StoredFile, UploadError> {
        if data.len() > self.max_size {
            return Err(UploadError::TooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let file = StoredFile {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            mime_type: mime_type.to_string(),
            size: data.len() as i64,
            data,
            created_at: Utc::now(),
        };
        self.db.insert_file(&file).await?;
        tracing::debug!(file_id = %file.id, size = file.size, "stored file");
        Ok(file)
    }

    pub async fn get(&self, file_id: &str) -> Result<Option<StoredFile>> {
        self.db.get_file(file_id).await
    }

    /// The file, provided `owner_id` uploaded it.
    pub async fn owned_file(&self, owner_id: &str, file_id: &str) -> Result<Option<StoredFile>> {
        Ok(self.get(file_id).await?.filter(|f| f.owner_id == owner_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_size: usize) -> ObjectStore {
        ObjectStore::new(
            Database::new_in_memory().unwrap(),
            Url::parse("http://localhost:8080/").unwrap(),
            max_size,
        )
    }

    fn ticket_of(url: &str) -> &str {
        url.rsplit('/').next().unwrap()
    }

    #[tokio::test]
    async fn test_upload_flow() {
        let store = store(1024);
        let url = store.create_upload_url("alice").await.unwrap();
        assert!(url.starts_with("http://localhost:8080/api/uploads/"));

        let file = store
            .accept_upload(ticket_of(&url), Some("image/png"), vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(file.owner_id, "alice");
        assert_eq!(store.file_url(&file.id), format!("http://localhost:8080/api/files/{}", file.id));

        assert!(store.owned_file("alice", &file.id).await.unwrap().is_some());
        assert!(store.owned_file("bob", &file.id).await.unwrap().is_none());

        // Tickets are single use.
        let again = store
            .accept_upload(ticket_of(&url), Some("image/png"), vec![1])
            .await;
        assert!(matches!(again, Err(UploadError::UnknownTicket)));
    }

    #[tokio::test]
    async fn test_rejects_non_images_and_oversize() {
        let store = store(2);
        let url = store.create_upload_url("alice").await.unwrap();
        let result = store
            .accept_upload(ticket_of(&url), Some("text/plain"), vec![1])
            .await;
        assert!(matches!(result, Err(UploadError::UnsupportedType(_))));

        let url = store.create_upload_url("alice").await.unwrap();
        let result = store
            .accept_upload(ticket_of(&url), Some("image/jpeg; charset=binary"), vec![1, 2, 3])
            .await;
        assert!(matches!(result, Err(UploadError::TooLarge { size: 3, max: 2 })));
    }
}
