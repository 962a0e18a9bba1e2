use eyre::{Result, format_err};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use crate::state::keys;

/// How long a single runtime call may take before the apply fails as
/// transient.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves a pod to the path of its network namespace.
///
/// `Ok(None)` means the runtime has no sandbox for the pod (it is gone);
/// errors are transient and the caller retries on the next snapshot.
pub trait NetnsResolver: Send + Sync + 'static {
    fn netns_path(
        &self,
        pod: &keys::Object,
        pod_uid: &str,
    ) -> impl Future<Output = Result<Option<PathBuf>>> + Send;
}

/// CRI-backed resolver, driving `crictl` against the configured runtime
/// endpoint: `pods` to find the ready sandbox, `inspectp` to read its
/// network namespace path.
pub struct CriResolver {
    runtime_endpoint: String,
    host_prefix: Option<PathBuf>,
}

impl CriResolver {
    pub fn new(runtime_endpoint: String, host_prefix: Option<PathBuf>) -> Self {
        Self {
            runtime_endpoint,
            host_prefix,
        }
    }

    async fn crictl(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = Command::new("crictl");
        cmd.args(["-r", self.runtime_endpoint.as_str()]).args(args);

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| format_err!("crictl {} timed out", args.join(" ")))?
            .map_err(|e| format_err!("crictl failed to start: {e}"))?;

        if !output.status.success() {
            return Err(format_err!(
                "crictl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(output.stdout)
    }

    /// The netns path as seen from this process, behind `--host-prefix` when
    /// the agent runs containerized.
    fn prefixed(&self, path: &str) -> PathBuf {
        match &self.host_prefix {
            Some(prefix) => prefix.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }
}

impl NetnsResolver for CriResolver {
    fn netns_path(
        &self,
        pod: &keys::Object,
        pod_uid: &str,
    ) -> impl Future<Output = Result<Option<PathBuf>>> + Send {
        async move {
            let out = self
                .crictl(&[
                    "pods",
                    "--name",
                    &pod.name,
                    "--namespace",
                    &pod.namespace,
                    "--state",
                    "ready",
                    "-o",
                    "json",
                ])
                .await?;
            let pods: Value = serde_json::from_slice(&out)
                .map_err(|e| format_err!("unexpected crictl pods output: {e}"))?;

            let Some(id) = sandbox_id(&pods, pod_uid) else {
                return Ok(None); // no ready sandbox: the pod is gone
            };

            let out = self.crictl(&["inspectp", id]).await?;
            let sandbox: Value = serde_json::from_slice(&out)
                .map_err(|e| format_err!("unexpected crictl inspectp output: {e}"))?;

            let path = netns_of_sandbox(&sandbox)
                .ok_or_else(|| format_err!("sandbox {id} of pod {pod} has no network namespace"))?;

            Ok(Some(self.prefixed(path)))
        }
    }
}

fn sandbox_id<'a>(pods: &'a Value, pod_uid: &str) -> Option<&'a str> {
    (pods.get("items")?.as_array()?.iter())
        .find(|p| {
            pod_uid.is_empty()
                || p.pointer("/metadata/uid").and_then(Value::as_str) == Some(pod_uid)
        })
        .and_then(|p| p.get("id"))
        .and_then(Value::as_str)
}

fn netns_of_sandbox(sandbox: &Value) -> Option<&str> {
    (sandbox.pointer("/info/runtimeSpec/linux/namespaces")?.as_array()?.iter())
        .find(|ns| ns.get("type").and_then(Value::as_str) == Some("network"))
        .and_then(|ns| ns.get("path"))
        .and_then(Value::as_str)
}
