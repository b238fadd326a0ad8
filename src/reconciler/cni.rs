//! Plugin-config reconciler: renders the CNI configuration from templates.
//!
//! Every regular file in the template directory is rendered with the
//! cluster pod CIDR, this node's pod CIDR and the link MTU, then written
//! under the same name into the target directory - but only when the
//! rendered bytes differ from what is already there. The container
//! runtime watches that directory, so spurious rewrites are real churn.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tracing::{debug, info};

use super::{Action, Reconciler};
use crate::error::Errors;
use crate::inventory::{node, NodeInventory};
use crate::kernel::LinkApi;
use crate::template::{self, Bindings};
use crate::Result;

/// Reconciler for the rendered plugin configuration files.
pub struct CniConfigReconciler {
    inventory: Arc<dyn NodeInventory>,
    links: Arc<dyn LinkApi>,
    interface: String,
    node_name: String,
    pod_cidr: Ipv4Net,
    template_dir: PathBuf,
    target_dir: PathBuf,
}

impl CniConfigReconciler {
    /// Create a plugin-config reconciler rendering `template_dir` into
    /// `target_dir`. The target directory must already exist.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inventory: Arc<dyn NodeInventory>,
        links: Arc<dyn LinkApi>,
        interface: String,
        node_name: String,
        pod_cidr: Ipv4Net,
        template_dir: PathBuf,
        target_dir: PathBuf,
    ) -> Self {
        Self {
            inventory,
            links,
            interface,
            node_name,
            pod_cidr,
            template_dir,
            target_dir,
        }
    }

    async fn render_file(
        &self,
        source: &Path,
        file_name: &OsStr,
        bindings: &Bindings,
    ) -> Result<()> {
        let target = self.target_dir.join(file_name);
        let name = file_name.to_string_lossy();

        let content = tokio::fs::read_to_string(source).await?;
        let rendered = template::render(&name, &content, bindings)?;

        let current = match tokio::fs::read(&target).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if current.as_deref() == Some(rendered.as_bytes()) {
            debug!(target = %target.display(), "Plugin config already up to date");
            return Ok(());
        }

        write_config(&target, rendered.as_bytes()).await?;
        info!(target = %target.display(), "Wrote plugin config");

        Ok(())
    }
}

async fn write_config(target: &Path, content: &[u8]) -> io::Result<()> {
    use tokio::io::AsyncWriteExt as _;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(target)
        .await?;
    file.write_all(content).await?;
    file.flush().await
}

#[async_trait]
impl Reconciler for CniConfigReconciler {
    fn name(&self) -> &'static str {
        "cni-config"
    }

    async fn reconcile(&self) -> Result<Action> {
        // The MTU comes from the provisioned link; wait for the interface
        // reconciler to create it.
        let Some(link) = self.links.link_by_name(&self.interface).await? else {
            debug!(interface = %self.interface, "Skipping plugin config reconciling since the link does not exist yet");
            return Ok(Action::done());
        };

        let n = self.inventory.get(&self.node_name).await?;
        let node_pod_cidr = node::pod_cidr(&n)?;

        let bindings = Bindings {
            pod_cidr: self.pod_cidr.to_string(),
            node_pod_cidr: node_pod_cidr.to_string(),
            mtu: link.mtu,
        };

        let mut errs = Errors::new();
        let mut entries = tokio::fs::read_dir(&self.template_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let source = entry.path();

            // Follows symlinks, so a linked template file is rendered and
            // a linked directory is skipped.
            let metadata = tokio::fs::metadata(&source).await?;
            if !metadata.is_file() {
                continue;
            }

            if let Err(err) = self.render_file(&source, &entry.file_name(), &bindings).await {
                errs.push(err);
            }
        }

        errs.into_result()?;
        Ok(Action::done())
    }
}
