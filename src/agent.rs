use eyre::Result;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use xxhash_rust::xxh3;

use crate::change;
use crate::cri::NetnsResolver;
use crate::netns;
use crate::netpol::nftables::{self, CommonRules};
use crate::state::{State, keys};
use crate::watcher::Watcher;

/// Bound on one nftables transaction, listing included.
const FILTER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Config {
    pub common_rules: CommonRules,
    /// CNI plugin types eligible for enforcement
    pub valid_plugins: Vec<String>,
}

/// Identity of one installed unit: which policy on which pod.
type UnitKey = (keys::Object, keys::Object);

/// One apply unit: the rendered tables for every selected interface of a
/// pod, plus a content hash for skip-if-unchanged.
struct Unit {
    policy: keys::Object,
    /// (interface name, rendered tables), in attachment order
    tables: Vec<(String, String)>,
    hash: u128,
}

#[derive(Default)]
struct PodWork {
    uid: String,
    cleanups: Vec<keys::Object>,
    applies: Vec<Unit>,
}

enum Outcome {
    Applied(UnitKey, u128),
    Cleaned(UnitKey),
}

/// Main loop: on every state change, compute the desired units for local
/// pods as a pure function of the snapshot, then install what changed and
/// remove what disappeared. One worker per pod: cross-pod work runs in
/// parallel, work for one pod is serialized, cleanups before applies.
pub async fn watch<R: NetnsResolver>(
    _ctx: Arc<crate::Context>,
    cfg: Config,
    resolver: Arc<R>,
    mut watcher: Watcher,
) -> Result<()> {
    let mut applied = change::Tracker::<UnitKey, u128>::new();

    loop {
        let Ok(computed) = watcher
            .next(|state| {
                (state.is_ready()).then(|| compute_pod_units(state, &state.node_name, &cfg))
            })
            .await
        else {
            return Ok(()); // event pump stopped
        };
        let Some(pod_units) = computed else {
            continue; // watches still syncing
        };

        let desired: Set<UnitKey> = (pod_units.iter())
            .flat_map(|(pod, _, units)| {
                units.iter().map(move |u| (pod.clone(), u.policy.clone()))
            })
            .collect();

        let mut work: Map<keys::Object, PodWork> = Map::new();

        for (pod, policy) in applied.stale_keys(&desired) {
            work.entry(pod).or_default().cleanups.push(policy);
        }

        for (pod, uid, units) in pod_units {
            for unit in units {
                if applied.is_current(&(pod.clone(), unit.policy.clone()), &unit.hash) {
                    continue; // already installed as-is
                }
                let pod_work = work.entry(pod.clone()).or_default();
                pod_work.uid = uid.clone();
                pod_work.applies.push(unit);
            }
        }

        if work.is_empty() {
            continue;
        }

        let mut workers = JoinSet::new();
        for (pod, pod_work) in work {
            let resolver = resolver.clone();
            workers.spawn(pod_worker(pod, pod_work, resolver));
        }

        while let Some(res) = workers.join_next().await {
            match res {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            Outcome::Applied(key, hash) => applied.record(key, hash),
                            Outcome::Cleaned(key) => applied.forget(&key),
                        }
                    }
                }
                Err(e) => error!("pod worker failed: {e}"),
            }
        }
    }
}

/// Desired units for every eligible pod on this node, rendered from the
/// snapshot. Pure; equal snapshots give equal units and hashes.
fn compute_pod_units(
    state: &State,
    node_name: &str,
    cfg: &Config,
) -> Vec<(keys::Object, String, Vec<Unit>)> {
    let mut out = Vec::new();

    for (pod_key, pod) in state.pods.iter() {
        if pod.node != node_name || !pod.is_eligible() {
            continue;
        }

        let mut units = Vec::new();
        for (np_key, np) in state.netpols.iter() {
            if !np.applies_to(pod_key, pod) {
                continue;
            }

            let tables: Vec<(String, String)> = (pod.interfaces.iter())
                .filter(|iface| np.networks.contains(&iface.network))
                .filter(|iface| plugin_allowed(state, cfg, &iface.network))
                .map(|iface| {
                    let text =
                        nftables::render(state, pod, np_key, np, iface, &cfg.common_rules);
                    (iface.name.clone(), text)
                })
                .collect();
            if tables.is_empty() {
                continue; // policy covers none of this pod's networks
            }

            let mut hasher = xxh3::Xxh3::new();
            for (_, text) in &tables {
                hasher.update(text.as_bytes());
            }

            units.push(Unit {
                policy: np_key.clone(),
                hash: hasher.digest128(),
                tables,
            });
        }

        if !units.is_empty() {
            out.push((pod_key.clone(), pod.uid.clone(), units));
        }
    }

    out
}

fn plugin_allowed(state: &State, cfg: &Config, network: &str) -> bool {
    let Some((namespace, name)) = network.split_once('/') else {
        return false;
    };
    let key = keys::Object::new(namespace, name);
    let Some(attachment) = state.net_attachments.get(&key) else {
        debug!("no net-attach-def for {network}, not enforcing");
        return false;
    };
    match attachment.plugin {
        Some(ref plugin) => cfg.valid_plugins.iter().any(|p| p == plugin),
        None => false,
    }
}

async fn pod_worker<R: NetnsResolver>(
    pod: keys::Object,
    work: PodWork,
    resolver: Arc<R>,
) -> Vec<Outcome> {
    let mut outcomes = Vec::new();

    let netns_path = match resolver.netns_path(&pod, &work.uid).await {
        Ok(v) => v,
        Err(e) => {
            warn!("resolving netns of {pod} failed (will retry): {e}");
            return outcomes;
        }
    };

    for policy in work.cleanups {
        match netns_path {
            // the netns is gone with the pod, nothing left to remove
            None => outcomes.push(Outcome::Cleaned((pod.clone(), policy))),
            Some(ref path) => {
                let task_path = path.clone();
                let task_policy = policy.clone();
                match run_filter_op(move || netns::cleanup(&task_path, &task_policy)).await {
                    Ok(()) => {
                        info!("removed tables of {policy} from {pod}");
                        outcomes.push(Outcome::Cleaned((pod.clone(), policy)));
                    }
                    Err(e) => error!("cleanup of {policy} in {pod} failed: {e}"),
                }
            }
        }
    }

    let Some(path) = netns_path else {
        return outcomes; // pod gone; nothing to apply to
    };

    'units: for unit in work.applies {
        for (iface, tables) in &unit.tables {
            let task_path = path.clone();
            let task_policy = unit.policy.clone();
            let task_iface = iface.clone();
            let task_tables = tables.clone();
            let res = run_filter_op(move || {
                netns::install(&task_path, &task_policy, &task_iface, &task_tables)
            })
            .await;
            if let Err(e) = res {
                // tables already installed for earlier interfaces stay; the
                // whole unit is retried on the next round
                error!("installing {} on {pod}/{iface} failed: {e}", unit.policy);
                continue 'units;
            }
        }
        info!("applied {} to {pod}", unit.policy);
        outcomes.push(Outcome::Applied((pod.clone(), unit.policy.clone()), unit.hash));
    }

    outcomes
}

/// Run a packet-filter operation on a pinned blocking thread, bounded in
/// time. On timeout we only stop waiting: a transaction already handed to
/// the kernel completes on its own, and the tracker not being updated makes
/// the next round retry.
async fn run_filter_op<F>(op: F) -> std::result::Result<(), String>
where
    F: FnOnce() -> netns::Result<()> + Send + 'static,
{
    match tokio::time::timeout(FILTER_TIMEOUT, tokio::task::spawn_blocking(op)).await {
        Err(_) => Err("timed out".into()),
        Ok(Err(e)) => Err(format!("task failed: {e}")),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Ok(Ok(()))) => Ok(()),
    }
}
