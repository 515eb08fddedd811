use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric key of an attendance session.
pub type SessionId = i64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("invalid embedding dimension: {got} (expected {expected})")]
    Dimension { expected: usize, got: usize },
    #[error("invalid embedding value (NaN/Inf)")]
    NonFinite,
    #[error("embedding dimension must be non-zero")]
    ZeroDimension,
}

/// A face embedding produced by the external feature extractor.
///
/// Serialises as a bare JSON array of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Check the embedding has exactly `dim` finite components.
    pub fn validate(&self, dim: usize) -> Result<(), EmbeddingError> {
        if self.values.len() != dim {
            return Err(EmbeddingError::Dimension {
                expected: dim,
                got: self.values.len(),
            });
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        Ok(())
    }
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable external key (student number).
    pub identity_id: String,
    pub display_name: String,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
    /// Inactive identities stay enrolled but are never matched.
    pub active: bool,
}

/// One matchable gallery entry.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub display_name: String,
    pub embedding: Embedding,
}

/// The set of active embeddings eligible for matching.
///
/// Entries are keyed by identity id in a `BTreeMap`, so iteration order is
/// the lexicographic order of ids. The matcher relies on this for its
/// tie-break: at equal distance the smaller identity id wins.
#[derive(Debug, Clone, PartialEq)]
pub struct Gallery {
    dim: usize,
    entries: BTreeMap<String, GalleryEntry>,
}

impl Gallery {
    pub fn new(dim: usize) -> Result<Self, EmbeddingError> {
        if dim == 0 {
            return Err(EmbeddingError::ZeroDimension);
        }
        Ok(Self {
            dim,
            entries: BTreeMap::new(),
        })
    }

    /// Build a gallery from a roster, skipping inactive identities.
    pub fn from_identities<'a, I>(dim: usize, identities: I) -> Result<Self, EmbeddingError>
    where
        I: IntoIterator<Item = &'a Identity>,
    {
        let mut gallery = Self::new(dim)?;
        for identity in identities.into_iter().filter(|i| i.active) {
            gallery.insert(
                &identity.identity_id,
                &identity.display_name,
                identity.embedding.clone(),
            )?;
        }
        Ok(gallery)
    }

    /// Insert or replace the entry for `identity_id`.
    pub fn insert(
        &mut self,
        identity_id: &str,
        display_name: &str,
        embedding: Embedding,
    ) -> Result<(), EmbeddingError> {
        embedding.validate(self.dim)?;
        self.entries.insert(
            identity_id.to_string(),
            GalleryEntry {
                display_name: display_name.to_string(),
                embedding,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, identity_id: &str) -> Option<GalleryEntry> {
        self.entries.remove(identity_id)
    }

    pub fn get(&self, identity_id: &str) -> Option<&GalleryEntry> {
        self.entries.get(identity_id)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in identity-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &GalleryEntry)> {
        self.entries.iter().map(|(id, entry)| (id.as_str(), entry))
    }
}
