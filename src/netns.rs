use log::debug;
use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::io::Write;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::netpol::nftables;
use crate::state::keys;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("opening netns {0}: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("entering netns: {0}")]
    Enter(nix::Error),
    #[error("nft failed: {0}")]
    NftFailed(std::io::Error),
    #[error("nft: exit code {0}")]
    NftCommandFailed(i32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Scoped network-namespace switch for the current thread. Callers must be
/// on a thread that runs nothing else while switched (spawn_blocking); the
/// original namespace is restored on drop, on all exit paths.
struct NetnsGuard {
    orig: File,
}

impl NetnsGuard {
    fn enter(path: &Path) -> Result<Self> {
        let orig = File::open("/proc/self/ns/net")
            .map_err(|e| Error::Open("/proc/self/ns/net".into(), e))?;
        let target = File::open(path).map_err(|e| Error::Open(path.to_path_buf(), e))?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET).map_err(Error::Enter)?;
        Ok(Self { orig })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        // the thread must not keep running in a pod's namespace
        setns(self.orig.as_fd(), CloneFlags::CLONE_NEWNET).expect("restore host netns");
    }
}

/// Atomically install the rendered tables for one (policy, interface) in the
/// netns at `path`, replacing any prior tables of the same identity. A failed
/// commit leaves the previous state untouched.
pub fn install(path: &Path, policy: &keys::Object, iface: &str, tables: &str) -> Result<()> {
    let script = install_script(policy, iface, tables);
    let _guard = NetnsGuard::enter(path)?;
    run_nft(&script)
}

/// Create/delete/define, in one transaction: creating first makes the delete
/// valid whether or not the table already exists, and a family that rendered
/// nothing this time still gets its stale table removed.
fn install_script(policy: &keys::Object, iface: &str, tables: &str) -> String {
    let name = nftables::table_name(policy, iface);
    let mut script = String::new();
    for family in ["ip", "ip6"] {
        script.push_str(&format!(
            "table {family} {name} {{}}\ndelete table {family} {name}\n"
        ));
    }
    script.push_str(tables);
    script
}

/// Remove every table of `policy` in the netns at `path`. Tables outside the
/// reserved prefix are never touched; nothing matching is a successful no-op.
pub fn cleanup(path: &Path, policy: &keys::Object) -> Result<()> {
    let prefix = nftables::policy_table_prefix(policy);

    let _guard = NetnsGuard::enter(path)?;

    let output = Command::new("nft")
        .args(["list", "tables"])
        .output()
        .map_err(Error::NftFailed)?;
    if !output.status.success() {
        return Err(Error::NftCommandFailed(output.status.code().unwrap_or(-1)));
    }

    let script = cleanup_script(&String::from_utf8_lossy(&output.stdout), &prefix);
    if script.is_empty() {
        return Ok(());
    }
    run_nft(&script)
}

/// `nft list tables` prints one `table <family> <name>` per line.
fn cleanup_script(listing: &str, prefix: &str) -> String {
    let mut script = String::new();
    for line in listing.lines() {
        let mut words = line.split_whitespace();
        if words.next() != Some("table") {
            continue;
        }
        let (Some(family), Some(name)) = (words.next(), words.next()) else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        script.push_str(&format!("delete table {family} {name}\n"));
    }
    script
}

fn run_nft(script: &str) -> Result<()> {
    debug!("nft script:\n{script}");

    let mut child = Command::new("nft")
        .args(["-f", "-"])
        .stdin(Stdio::piped())
        .spawn()
        .map_err(Error::NftFailed)?;

    let mut stdin = child.stdin.take().expect("stdin is piped");
    stdin.write_all(script.as_bytes()).map_err(Error::NftFailed)?;
    drop(stdin);

    let status = child.wait().map_err(Error::NftFailed)?;
    if !status.success() {
        return Err(Error::NftCommandFailed(status.code().unwrap_or(-1)));
    }
    Ok(())
}
