use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    // Plan and credits are stored but not enforced anywhere yet.
    pub plan: String,
    pub credits: Credits,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Credits {
    pub standard: i64,
    pub premium: i64,
}

impl Credits {
    /// Allowance a new user starts with on the free plan.
    pub const FREE_PLAN: Credits = Credits {
        standard: 20,
        premium: 5,
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    /// `None` means every registered model is enabled.
    #[serde(default)]
    pub enabled_models: Option<Vec<String>>,
    #[serde(default)]
    pub persona_name: Option<String>,
    #[serde(default)]
    pub occupation: Option<String>,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub additional_info: Option<String>,
    #[serde(default)]
    pub visual_theme: Option<String>,
}
