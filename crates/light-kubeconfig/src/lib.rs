//! Kubeconfig documents
//!
//! This crate loads, merges and atomically persists kubeconfig documents.

pub mod document;
pub mod merge;

pub use document::{DocumentError, KubeconfigDocument};
pub use merge::{merge_and_persist, KubeconfigMerger, MergeError};
