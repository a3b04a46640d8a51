//! Typed shapes of the replicated entity types
//!
//! The web layer writes these; the engine only sees them as [`Record`]s.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::record::{EntityType, Payload, Record};
use crate::error::{Error, Result};
use crate::util::Timestamp;

/// Conversion between a typed entity and its replicated record form.
pub trait Entity: Serialize + DeserializeOwned {
    const ENTITY_TYPE: EntityType;

    /// Business identifier shared by every store.
    fn natural_key(&self) -> String;

    /// Build a fresh record stamped at `now`.
    fn to_record(&self, now: Timestamp) -> Result<Record> {
        let key = self.natural_key();
        Self::ENTITY_TYPE.validate_natural_key(&key)?;
        let payload = match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => map,
            _ => Payload::new(),
        };
        Ok(Record::new(key, payload, now))
    }

    /// Decode the payload of a record of this type.
    fn from_record(record: &Record) -> Result<Self> {
        let entity: Self = serde_json::from_value(serde_json::Value::Object(record.payload.clone()))?;
        if entity.natural_key() != record.natural_key {
            return Err(Error::InvalidInput(format!(
                "{} payload key '{}' does not match record key '{}'",
                Self::ENTITY_TYPE,
                entity.natural_key(),
                record.natural_key
            )));
        }
        Ok(entity)
    }
}

/// Application account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "member".to_string()
}

impl Entity for User {
    const ENTITY_TYPE: EntityType = EntityType::User;

    fn natural_key(&self) -> String {
        self.username.clone()
    }
}

/// Presentation project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub slug: String,
    pub owner: String,
    pub title: String,
    #[serde(default)]
    pub theme: Option<String>,
}

impl Entity for Document {
    const ENTITY_TYPE: EntityType = EntityType::Document;

    fn natural_key(&self) -> String {
        self.slug.clone()
    }
}

/// One page of a document; dependent of [`Document`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slide {
    pub document_slug: String,
    pub position: u32,
    pub layout: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Entity for Slide {
    const ENTITY_TYPE: EntityType = EntityType::Slide;

    fn natural_key(&self) -> String {
        format!("{}/{}", self.document_slug, self.position)
    }
}

/// Reusable deck layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub definition: serde_json::Value,
}

impl Entity for Template {
    const ENTITY_TYPE: EntityType = EntityType::Template;

    fn natural_key(&self) -> String {
        self.key.clone()
    }
}

/// Key-value configuration entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub key: String,
    pub value: serde_json::Value,
}

impl Entity for ConfigItem {
    const ENTITY_TYPE: EntityType = EntityType::ConfigItem;

    fn natural_key(&self) -> String {
        self.key.clone()
    }
}

/// Login session. Ephemeral and never replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token_hash: String,
    pub username: String,
    pub expires_at: Timestamp,
}

impl Entity for Session {
    const ENTITY_TYPE: EntityType = EntityType::Session;

    fn natural_key(&self) -> String {
        self.token_hash.clone()
    }
}
