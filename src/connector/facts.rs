//! Host fact gathering.
//!
//! Facts are probed once per host at startup through the host's connector
//! and cached on the [`Host`] handle; planning and steps read them without
//! further I/O.

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::{CommandSpec, Connector};
use crate::host::{Facts, Host, Inventory, PackageManager};

/// Probes one uname field on the host.
async fn uname(connector: &dyn Connector, flag: &str) -> Result<String> {
    let output = connector
        .exec(&CommandSpec::new("uname", vec![flag.to_string()]))
        .await
        .with_context(|| format!("failed to run uname {}", flag))?;
    if !output.success() {
        anyhow::bail!("uname {} failed: {}", flag, output.status_display());
    }
    Ok(output.stdout_text())
}

/// Detects the package manager family available on the host.
///
/// `command -v` prints the resolved path of the first hit per name, so the
/// first line corresponds to the first candidate found in preference order.
async fn detect_package_manager(connector: &dyn Connector) -> Result<PackageManager> {
    let output = connector
        .exec(&CommandSpec::shell(
            "command -v apt-get dnf yum apk 2>/dev/null | head -n 1",
        ))
        .await
        .context("failed to probe package manager")?;

    let path = output.stdout_text();
    let manager = match path.rsplit('/').next().unwrap_or("") {
        "apt-get" => PackageManager::Apt,
        "dnf" => PackageManager::Dnf,
        "yum" => PackageManager::Yum,
        "apk" => PackageManager::Apk,
        _ => PackageManager::Unknown,
    };
    Ok(manager)
}

/// Gathers facts for a single host.
pub async fn gather_facts(connector: &dyn Connector) -> Result<Facts> {
    let os = uname(connector, "-s").await?;
    let arch = uname(connector, "-m").await?;
    let kernel = uname(connector, "-r").await?;
    let package_manager = detect_package_manager(connector).await?;

    Ok(Facts {
        os,
        arch,
        kernel,
        package_manager,
    })
}

/// Gathers facts for every host of the inventory that does not have them
/// yet.
///
/// Best-effort: a host that cannot be probed (e.g. no transport configured)
/// is logged and left without facts; the failure will resurface with full
/// context on the first step that touches the host.
pub async fn gather_all(inventory: &Inventory) {
    for host in inventory.all_hosts() {
        if let Err(e) = gather_for_host(host).await {
            warn!(host = host.name(), error = %format!("{:#}", e), "failed to gather facts");
        }
    }
}

/// Gathers facts for one host handle, caching the result on it.
///
/// A no-op when the host already carries facts.
pub async fn gather_for_host(host: &Host) -> Result<()> {
    if host.facts().is_some() {
        return Ok(());
    }
    let facts = gather_facts(host.connector().as_ref())
        .await
        .with_context(|| format!("failed to gather facts for host {}", host.name()))?;
    debug!(
        host = host.name(),
        os = %facts.os,
        arch = %facts.arch,
        package_manager = %facts.package_manager,
        "gathered host facts"
    );
    host.set_facts(facts);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::LocalConnector;

    #[tokio::test]
    async fn gather_facts_from_local_machine() {
        let connector = LocalConnector::new();
        let facts = gather_facts(&connector).await.unwrap();
        assert!(!facts.os.is_empty());
        assert!(!facts.arch.is_empty());
        assert!(!facts.kernel.is_empty());
    }
}
