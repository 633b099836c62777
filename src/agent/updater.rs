//! Agent self-update: version comparison against the server and a
//! best-effort `git pull` + rebuild. A successful update takes effect on
//! the next daemon restart.

use crate::agent::client::AgentApiClient;
use crate::error::MeshError;
use std::cmp::Ordering;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);
const BUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// Compare two dotted version strings component-wise; missing components
/// count as 0, non-numeric components count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (pa, pb) = (parse(a), parse(b));
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let x = pa.get(i).copied().unwrap_or(0);
        let y = pb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Ask the server for its advertised version; Some(latest) when an update
/// is available.
pub async fn check_for_update(
    client: &AgentApiClient,
    local_version: &str,
) -> Result<Option<String>, MeshError> {
    let latest = client.fetch_version().await?;
    if compare_versions(&latest, local_version) == Ordering::Greater {
        info!("update available: {local_version} -> {latest}");
        Ok(Some(latest))
    } else {
        debug!("agent is up to date ({local_version})");
        Ok(None)
    }
}

/// Pull the latest code and rebuild in the install directory. Returns true
/// on success; the running process keeps its old code until restarted.
pub async fn perform_update(install_dir: &Path) -> bool {
    if !install_dir.join(".git").is_dir() {
        warn!("not a git repo: {}; cannot auto-update", install_dir.display());
        return false;
    }

    let pull = tokio::process::Command::new("git")
        .args(["pull", "--ff-only"])
        .current_dir(install_dir)
        .output();
    let pull = match tokio::time::timeout(GIT_TIMEOUT, pull).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            error!("git pull failed to start: {err}");
            return false;
        }
        Err(_) => {
            error!("git pull timed out");
            return false;
        }
    };
    if !pull.status.success() {
        error!(
            "git pull failed: {}",
            String::from_utf8_lossy(&pull.stderr).trim()
        );
        return false;
    }
    info!("git pull: {}", String::from_utf8_lossy(&pull.stdout).trim());

    let build = tokio::process::Command::new("cargo")
        .args(["build", "--release"])
        .current_dir(install_dir)
        .output();
    let build = match tokio::time::timeout(BUILD_TIMEOUT, build).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            error!("rebuild failed to start: {err}");
            return false;
        }
        Err(_) => {
            error!("rebuild timed out");
            return false;
        }
    };
    if !build.status.success() {
        error!(
            "rebuild failed: {}",
            String::from_utf8_lossy(&build.stderr).trim()
        );
        return false;
    }

    info!("agent updated; restart required to take effect");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_equal() {
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_compare_ordering() {
        assert_eq!(compare_versions("1.2.4", "1.2.3"), Ordering::Greater);
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("0.9", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("2", "1.9.9"), Ordering::Greater);
    }

    #[test]
    fn test_compare_tolerates_garbage() {
        assert_eq!(compare_versions("1.x.3", "1.0.3"), Ordering::Equal);
        assert_eq!(compare_versions("", "0.0.0"), Ordering::Equal);
    }

    #[tokio::test]
    async fn test_perform_update_outside_git_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!perform_update(dir.path()).await);
    }
}
