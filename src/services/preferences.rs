use anyhow::{Context, Result};

use super::database::Database;
use crate::models::UserPreferences;
use crate::providers::registry;

#[derive(Debug, Clone)]
pub struct PreferencesService {
    db: Database,
}

impl PreferencesService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stored preferences, or the defaults when none are saved or the
    /// stored value no longer parses.
    pub async fn load(&self, user_id: &str) -> Result<UserPreferences> {
        match self.db.get_preferences(user_id).await? {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(user_id, "discarding unreadable preferences: {}", e);
                UserPreferences::default()
            })),
            None => Ok(UserPreferences::default()),
        }
    }

    pub async fn save(&self, user_id: &str, prefs: &UserPreferences) -> Result<()> {
        let json = serde_json::to_string(prefs).context("Failed to encode preferences")?;
        self.db.set_preferences(user_id, &json).await
    }
}

pub fn is_enabled(prefs: &UserPreferences, model_id: &str) -> bool {
    match &prefs.enabled_models {
        Some(ids) => ids.iter().any(|id| id == model_id),
        None => true,
    }
}

/// Ids in `enabled_models` that are not in the model table.
pub fn unknown_models(prefs: &UserPreferences) -> Vec<String> {
    prefs
        .enabled_models
        .iter()
        .flatten()
        .filter(|id| registry::find_model(id).is_none())
        .cloned()
        .collect()
}

/// System prompt with the user's persona details appended.
pub fn personalize_prompt(base: &str, prefs: &UserPreferences) -> String {
    let mut lines = Vec::new();
    if let Some(name) = prefs.persona_name.as_deref().filter(|s| !s.trim().is_empty()) {
        lines.push(format!("The user would like to be called {}.", name.trim()));
    }
    if let Some(occupation) = prefs.occupation.as_deref().filter(|s| !s.trim().is_empty()) {
        lines.push(format!("The user works as: {}.", occupation.trim()));
    }
    if !prefs.traits.is_empty() {
        lines.push(format!("Respond with these traits: {}.", prefs.traits.join(", ")));
    }
    if let Some(info) = prefs.additional_info.as_deref().filter(|s| !s.trim().is_empty()) {
        lines.push(format!("Additional context about the user: {}", info.trim()));
    }

    if lines.is_empty() {
        base.to_string()
    } else {
        format!("{}\n\n{}", base, lines.join("\n"))
    }
}
