//! Cluster kubeconfig management
//!
//! Cluster kubeconfigs are stored under `<data dir>/clusters/<name>/` and the
//! active one is selected through the `<data dir>/current_cluster` symlink.
//! [`sync_kubeconfig`] folds the active cluster's kubeconfig into the system
//! kubeconfig so regular tooling can reach it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use light_kubeconfig::{merge_and_persist, DocumentError, KubeconfigDocument, MergeError};
use thiserror::Error;

use crate::settings::{Settings, SettingsError};

const CLUSTER_KUBECONFIG: &str = "kubeconfig.yaml";

#[derive(Debug, Error)]
pub enum KubeconfigError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Invalid cluster name: {0:?}")]
    InvalidClusterName(String),

    #[error("Failed to point {link:?} at {target:?}: {source}")]
    Link {
        link: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Merge the active cluster's kubeconfig into the system kubeconfig
pub fn sync_kubeconfig(settings: &Settings) -> Result<KubeconfigDocument, KubeconfigError> {
    let system = settings.system_kubeconfig_path()?;
    let cluster = settings.cluster_kubeconfig_path()?;
    tracing::debug!("Syncing {:?} into {:?}", cluster, system);
    Ok(merge_and_persist(&system, &cluster)?)
}

/// Store a JSON kubeconfig for cluster `name` as YAML and make it the active cluster.
///
/// Returns the path of the written kubeconfig.
pub fn save_cluster_kubeconfig(
    settings: &Settings,
    name: &str,
    kubeconfig_json: &str,
) -> Result<PathBuf, KubeconfigError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(KubeconfigError::InvalidClusterName(name.to_string()));
    }

    let document = KubeconfigDocument::from_json_str(kubeconfig_json)?;
    let cluster_dir = settings.cluster_dir(name)?;
    let path = cluster_dir.join(CLUSTER_KUBECONFIG);
    document.write_atomic(&path)?;

    let link = settings.current_cluster_link()?;
    repoint(&link, &cluster_dir).map_err(|source| {
        tracing::error!("Failed to update {:?}: {}", link, source);
        KubeconfigError::Link {
            link: link.clone(),
            target: cluster_dir.clone(),
            source,
        }
    })?;

    tracing::info!("Saved kubeconfig for cluster {} to {:?}", name, path);
    Ok(path)
}

/// Name of the active cluster, read from the `current_cluster` link
pub fn current_cluster(settings: &Settings) -> Result<Option<String>, KubeconfigError> {
    let link = settings.current_cluster_link()?;
    match fs::read_link(&link) {
        Ok(target) => Ok(target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())),
        Err(_) => Ok(None),
    }
}

fn repoint(link: &Path, target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_dir() => fs::remove_dir_all(link)?,
        Ok(_) => fs::remove_file(link)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    symlink_dir(target, link)
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
