//! Runtime-adjustable sentence filter

use crate::api::types::{ApiError, ApiResult};
use crate::core::{FilterSet, SentenceType};
use std::sync::{Arc, RwLock};

/// Enabled sentence types, swapped atomically as a whole set
#[derive(Debug)]
pub struct MessageFilter {
    current: RwLock<Arc<FilterSet>>,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self::new(FilterSet::all())
    }
}

impl MessageFilter {
    pub fn new(initial: FilterSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Replace the enabled set
    pub fn set(&self, types: FilterSet) {
        tracing::info!(
            enabled = ?types.iter().map(|t| t.tag()).collect::<Vec<_>>(),
            "Sentence filter updated"
        );
        *self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(types);
    }

    /// Replace the enabled set from three-letter tags; unknown tags leave it unchanged
    pub fn set_tags<S: AsRef<str>>(&self, tags: &[S]) -> ApiResult<()> {
        let mut types = Vec::with_capacity(tags.len());
        for tag in tags {
            let parsed = tag.as_ref().parse::<SentenceType>().map_err(|_| ApiError::UnknownSentenceType {
                tag: tag.as_ref().to_string(),
            })?;
            types.push(parsed);
        }
        self.set(types.into_iter().collect());
        Ok(())
    }

    /// Copy of the enabled set
    pub fn get(&self) -> FilterSet {
        self.snapshot().as_ref().clone()
    }

    /// Shared handle on the enabled set for the decoding loop
    pub fn snapshot(&self) -> Arc<FilterSet> {
        Arc::clone(&self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Every sentence type the codec can decode
    pub fn supported(&self) -> Vec<SentenceType> {
        SentenceType::ALL.to_vec()
    }
}
