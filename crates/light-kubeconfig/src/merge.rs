//! Identity-keyed kubeconfig merge
//!
//! Entries of `clusters`, `users` and `contexts` are upserted by their `name`
//! field: a same-named entry is replaced in place, anything else is appended.
//! Entries without a name cannot be matched and are always appended, so
//! merging a document that carries nameless entries twice duplicates them.

use std::path::Path;

use serde_json::Value;
use thiserror::Error;

use crate::document::{
    entry_identity, value_kind, DocumentError, KubeconfigDocument, CURRENT_CONTEXT,
    IDENTITY_SECTIONS,
};

/// Errors that can occur while merging kubeconfig documents
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Tried to insert into {section}, which is a {found} not a list")]
    SectionNotList { section: String, found: &'static str },

    #[error("Incoming kubeconfig has no current-context")]
    MissingCurrentContext,

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Merges kubeconfig documents into a target document
#[derive(Debug, Clone, Default)]
pub struct KubeconfigMerger {
    config: KubeconfigDocument,
}

impl KubeconfigMerger {
    pub fn new(config: KubeconfigDocument) -> Self {
        Self { config }
    }

    /// The merged document so far
    pub fn document(&self) -> &KubeconfigDocument {
        &self.config
    }

    pub fn into_document(self) -> KubeconfigDocument {
        self.config
    }

    /// Upsert a single entry into a list section
    pub fn insert_entry(&mut self, section: &str, new_entry: Value) -> Result<(), MergeError> {
        let entries = self.entries_mut(section)?;
        let same_name = entry_identity(&new_entry)
            .and_then(|name| entries.iter().position(|e| entry_identity(e) == Some(name)));

        match same_name {
            Some(index) => entries[index] = new_entry,
            None => entries.push(new_entry),
        }
        Ok(())
    }

    /// Merge `incoming` into the target document.
    ///
    /// The target is left untouched when the merge fails.
    pub fn merge(&mut self, incoming: &KubeconfigDocument) -> Result<(), MergeError> {
        let current_context = incoming
            .get(CURRENT_CONTEXT)
            .cloned()
            .ok_or(MergeError::MissingCurrentContext)?;

        for section in IDENTITY_SECTIONS {
            let incoming_entries = incoming_section(incoming, section)?;
            if !incoming_entries.is_empty() {
                self.check_section(section)?;
            }
        }

        for section in IDENTITY_SECTIONS {
            for entry in incoming_section(incoming, section)? {
                self.insert_entry(section, entry.clone())?;
            }
        }

        self.config.insert(CURRENT_CONTEXT, current_context);

        for key in incoming.keys() {
            if key == CURRENT_CONTEXT || IDENTITY_SECTIONS.contains(&key) {
                continue;
            }
            if let Some(value) = incoming.get(key) {
                self.config.insert(key, value.clone());
            }
        }

        tracing::debug!(
            "Merged kubeconfig, current-context is now {:?}",
            self.config.current_context()
        );
        Ok(())
    }

    fn check_section(&self, section: &str) -> Result<(), MergeError> {
        match self.config.get(section) {
            None | Some(Value::Null) | Some(Value::Array(_)) => Ok(()),
            Some(other) => Err(MergeError::SectionNotList {
                section: section.to_string(),
                found: value_kind(other),
            }),
        }
    }

    fn entries_mut(&mut self, section: &str) -> Result<&mut Vec<Value>, MergeError> {
        let slot = self.config.slot(section);
        if slot.is_null() {
            *slot = Value::Array(Vec::new());
        }
        match slot {
            Value::Array(entries) => Ok(entries),
            other => Err(MergeError::SectionNotList {
                section: section.to_string(),
                found: value_kind(other),
            }),
        }
    }
}

fn incoming_section<'a>(
    incoming: &'a KubeconfigDocument,
    section: &str,
) -> Result<&'a [Value], MergeError> {
    match incoming.get(section) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(entries)) => Ok(entries.as_slice()),
        Some(other) => Err(MergeError::SectionNotList {
            section: section.to_string(),
            found: value_kind(other),
        }),
    }
}

/// Merge the cluster-local kubeconfig into the system kubeconfig and write the
/// result back over the system kubeconfig.
///
/// A missing system kubeconfig is treated as empty; the cluster kubeconfig must
/// exist.
pub fn merge_and_persist(
    system_path: &Path,
    cluster_path: &Path,
) -> Result<KubeconfigDocument, MergeError> {
    let current = KubeconfigDocument::load_or_default(system_path)?;
    let incoming = KubeconfigDocument::load(cluster_path).map_err(|e| {
        tracing::error!("Failed to load cluster kubeconfig {:?}: {}", cluster_path, e);
        e
    })?;

    let mut merger = KubeconfigMerger::new(current);
    merger.merge(&incoming)?;

    let merged = merger.into_document();
    merged.write_atomic(system_path)?;

    tracing::info!(
        "Merged {:?} into {:?} (current-context {:?})",
        cluster_path,
        system_path,
        merged.current_context()
    );
    Ok(merged)
}
