//! Fulltext indexer for mail.
//!
//! Tokenizes the subject and the sender into lowercase terms and stores a
//! `term -> identifier` entry per distinct term in `mail.index.fulltext`.
//! Query evaluation intersects term lookups with the candidate set, so the
//! index only ever answers membership questions.

use super::{CustomIndexer, IndexTransaction};
use crate::entity::Entity;
use crate::error::Result;

const FULLTEXT_INDEX: &str = "mail.index.fulltext";

/// Minimum term length; shorter fragments are noise.
const MIN_TERM_LEN: usize = 2;

/// Custom secondary indexer feeding the fulltext database.
#[derive(Debug, Default)]
pub struct FulltextIndexer;

/// Splits text into distinct lowercase terms.
pub fn terms(text: &str) -> Vec<String> {
    let mut out: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TERM_LEN)
        .map(str::to_lowercase)
        .collect();
    out.sort();
    out.dedup();
    out
}

fn entity_terms(entity: &Entity) -> Vec<String> {
    let mut all = Vec::new();
    for property in ["subject", "sender"] {
        if let Some(text) = entity.property(property).and_then(|v| v.as_text()) {
            all.extend(terms(text));
        }
    }
    all.sort();
    all.dedup();
    all
}

impl CustomIndexer for FulltextIndexer {
    fn add(&self, entity: &Entity, txn: &IndexTransaction<'_>) -> Result<()> {
        for term in entity_terms(entity) {
            txn.index_add(FULLTEXT_INDEX, term.as_bytes(), entity.id.as_bytes())?;
        }
        Ok(())
    }

    fn remove(&self, entity: &Entity, txn: &IndexTransaction<'_>) -> Result<()> {
        for term in entity_terms(entity) {
            txn.index_remove(FULLTEXT_INDEX, term.as_bytes(), entity.id.as_bytes())?;
        }
        Ok(())
    }

    fn databases(&self) -> Vec<String> {
        vec![FULLTEXT_INDEX.to_string()]
    }
}
