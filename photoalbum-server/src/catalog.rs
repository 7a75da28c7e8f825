//! Photo records and birthday messages, kept in a single JSON document.
//!
//! Every mutation is applied to a copy, written to disk, and only then
//! swapped in, so a failed write leaves both memory and disk unchanged.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: String,
    pub title: String,
    pub caption: String,
    pub memory_note: String,
    pub date: DateTime<FixedOffset>,
    pub location: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub filename: String,
    pub original_filename: String,
    pub file_size: u64,
    #[serde(default)]
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Descriptive fields supplied with an upload.
#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub title: String,
    pub caption: String,
    pub memory_note: String,
    pub date: DateTime<FixedOffset>,
    pub location: String,
    pub tags: Vec<String>,
}

impl Photo {
    pub fn new(meta: NewPhoto, stored: &crate::storage::StoredImage) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: meta.title,
            caption: meta.caption,
            memory_note: meta.memory_note,
            date: meta.date,
            location: meta.location,
            tags: meta.tags,
            filename: stored.filename.clone(),
            original_filename: stored.original_filename.clone(),
            file_size: stored.size,
            mime_type: stored.mime_type.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial photo update. `None` (absent or `null`) leaves a field alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhotoUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub memory_note: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_date")]
    pub date: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl PhotoUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.caption.is_none()
            && self.memory_note.is_none()
            && self.date.is_none()
            && self.location.is_none()
            && self.tags.is_none()
    }

    /// Apply the present fields; bumps `updated_at` when anything was present.
    pub fn apply_to(self, photo: &mut Photo) {
        if self.is_empty() {
            return;
        }
        if let Some(v) = self.title {
            photo.title = v;
        }
        if let Some(v) = self.caption {
            photo.caption = v;
        }
        if let Some(v) = self.memory_note {
            photo.memory_note = v;
        }
        if let Some(v) = self.date {
            photo.date = v;
        }
        if let Some(v) = self.location {
            photo.location = v;
        }
        if let Some(v) = self.tags {
            photo.tags = v;
        }
        photo.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BirthdayMessage {
    pub id: String,
    pub title: String,
    pub message: String,
    pub date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BirthdayMessageCreate {
    pub title: String,
    pub message: String,
}

impl BirthdayMessage {
    pub fn new(create: BirthdayMessageCreate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: create.title,
            message: create.message,
            date: now,
            created_at: now,
        }
    }
}

/// Messages written by `seed` into an empty catalog.
pub const DEFAULT_MESSAGES: [(&str, &str); 3] = [
    (
        "Happy Birthday, My Love!",
        "Another year of being blessed to have you in my life. You make every day brighter, every moment more meaningful. Here's to creating more beautiful memories together.",
    ),
    (
        "Our Journey So Far",
        "Every photo in this album tells a story of our love. From our first nervous glances to the comfortable silence we share now, each moment has been a gift.",
    ),
    (
        "To Many More Adventures",
        "This album is just the beginning. I can't wait to fill it with more laughter, more adventures, and more reasons to fall in love with you every single day.",
    ),
];

pub fn default_messages() -> Vec<BirthdayMessageCreate> {
    DEFAULT_MESSAGES
        .iter()
        .map(|(title, message)| BirthdayMessageCreate {
            title: title.to_string(),
            message: message.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BirthdayMessageUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl BirthdayMessageUpdate {
    pub fn apply_to(self, msg: &mut BirthdayMessage) {
        if let Some(v) = self.title {
            msg.title = v;
        }
        if let Some(v) = self.message {
            msg.message = v;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    photos: Vec<Photo>,
    #[serde(default)]
    birthday_messages: Vec<BirthdayMessage>,
}

#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    doc: RwLock<Document>,
}

impl Catalog {
    /// Open the catalog at `path`; a missing file starts an empty catalog.
    pub async fn open(path: &Path) -> Result<Self> {
        let doc = if fs::try_exists(path).await.unwrap_or(false) {
            let text = fs::read_to_string(path)
                .await
                .with_context(|| format!("reading catalog {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing catalog {}", path.display()))?
        } else {
            Document::default()
        };
        tracing::info!(path = %path.display(), photos = doc.photos.len(), messages = doc.birthday_messages.len(), "catalog loaded");
        Ok(Self {
            path: path.to_path_buf(),
            doc: RwLock::new(doc),
        })
    }

    /// Atomic write of a document to disk (temp file + rename).
    async fn save(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing tmp catalog {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming tmp catalog to {}", self.path.display()))?;
        Ok(())
    }

    /// Run `f` against a copy of the document and commit it if `f` reports a change.
    async fn mutate<T>(&self, f: impl FnOnce(&mut Document) -> Option<T>) -> Result<Option<T>> {
        let mut guard = self.doc.write().await;
        let mut next = guard.clone();
        let Some(out) = f(&mut next) else {
            return Ok(None);
        };
        self.save(&next).await?;
        *guard = next;
        Ok(Some(out))
    }

    /// All photos, oldest logical date first.
    pub async fn list_photos(&self) -> Vec<Photo> {
        let mut photos = self.doc.read().await.photos.clone();
        photos.sort_by(|a, b| a.date.cmp(&b.date));
        photos
    }

    pub async fn get_photo(&self, id: &str) -> Option<Photo> {
        self.doc.read().await.photos.iter().find(|p| p.id == id).cloned()
    }

    pub async fn insert_photo(&self, photo: Photo) -> Result<Photo> {
        let inserted = self
            .mutate(|doc| {
                doc.photos.push(photo.clone());
                Some(photo)
            })
            .await?;
        inserted.context("photo insert produced no change")
    }

    /// Apply a patch. `None` if no photo has `id`.
    pub async fn update_photo(&self, id: &str, patch: PhotoUpdate) -> Result<Option<Photo>> {
        self.mutate(|doc| {
            let photo = doc.photos.iter_mut().find(|p| p.id == id)?;
            patch.apply_to(photo);
            Some(photo.clone())
        })
        .await
    }

    pub async fn delete_photo(&self, id: &str) -> Result<Option<Photo>> {
        self.mutate(|doc| {
            let idx = doc.photos.iter().position(|p| p.id == id)?;
            Some(doc.photos.remove(idx))
        })
        .await
    }

    /// All messages, newest first.
    pub async fn list_messages(&self) -> Vec<BirthdayMessage> {
        let mut messages = self.doc.read().await.birthday_messages.clone();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages
    }

    pub async fn get_message(&self, id: &str) -> Option<BirthdayMessage> {
        self.doc
            .read()
            .await
            .birthday_messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub async fn insert_message(&self, msg: BirthdayMessage) -> Result<BirthdayMessage> {
        let inserted = self
            .mutate(|doc| {
                doc.birthday_messages.push(msg.clone());
                Some(msg)
            })
            .await?;
        inserted.context("message insert produced no change")
    }

    /// Insert `seeds` only when there are no messages yet. Returns how many
    /// were inserted.
    pub async fn seed_messages(&self, seeds: Vec<BirthdayMessageCreate>) -> Result<usize> {
        let inserted = self
            .mutate(|doc| {
                if !doc.birthday_messages.is_empty() || seeds.is_empty() {
                    return None;
                }
                let count = seeds.len();
                doc.birthday_messages
                    .extend(seeds.into_iter().map(BirthdayMessage::new));
                Some(count)
            })
            .await?;
        Ok(inserted.unwrap_or(0))
    }

    pub async fn update_message(
        &self,
        id: &str,
        patch: BirthdayMessageUpdate,
    ) -> Result<Option<BirthdayMessage>> {
        self.mutate(|doc| {
            let msg = doc.birthday_messages.iter_mut().find(|m| m.id == id)?;
            patch.apply_to(msg);
            Some(msg.clone())
        })
        .await
    }

    pub async fn delete_message(&self, id: &str) -> Result<Option<BirthdayMessage>> {
        self.mutate(|doc| {
            let idx = doc.birthday_messages.iter().position(|m| m.id == id)?;
            Some(doc.birthday_messages.remove(idx))
        })
        .await
    }
}

/// Parse the date formats clients send: RFC 3339 (a trailing `Z` included),
/// a naive date-time taken as UTC, or a bare date at midnight UTC.
pub fn parse_photo_date(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc().fixed_offset());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().fixed_offset())
}

fn deserialize_opt_date<'de, D>(de: D) -> Result<Option<DateTime<FixedOffset>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_photo_date(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid date '{s}'"))),
    }
}
