use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A blob held by the object store. Messages reference it by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub id: String,
    pub owner_id: String,
    pub mime_type: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}
