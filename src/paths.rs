//! Host path translation for Docker-in-Docker deployments.
//!
//! When the orchestrator runs inside a container and asks the host daemon
//! for sibling containers, bind-mount sources must be expressed as paths on
//! the real host. A mounted workspace such as `-v /home/u/ws:/workspace`
//! is described by the prefix pair (`/home/u/ws`, `/workspace`).

use std::path::{Path, PathBuf};

/// Translate an orchestrator-local path to the equivalent path on the host.
///
/// Paths outside `container_prefix` are returned unchanged; they are assumed
/// to already be host paths.
pub fn translate(path: &Path, host_prefix: &Path, container_prefix: &Path) -> PathBuf {
    match path.strip_prefix(container_prefix) {
        Ok(relative) if relative.as_os_str().is_empty() => host_prefix.to_path_buf(),
        Ok(relative) => host_prefix.join(relative),
        Err(_) => path.to_path_buf(),
    }
}

/// Whether translation is configured at all.
pub fn should_translate(host_prefix: Option<&str>) -> bool {
    host_prefix.is_some_and(|prefix| !prefix.trim().is_empty())
}

/// Translate `path` when a host prefix is configured, otherwise pass it through.
pub fn translate_if_configured(
    path: &Path,
    host_prefix: Option<&str>,
    container_prefix: &Path,
) -> PathBuf {
    match host_prefix {
        Some(prefix) if should_translate(Some(prefix)) => {
            translate(path, Path::new(prefix.trim()), container_prefix)
        }
        _ => path.to_path_buf(),
    }
}
