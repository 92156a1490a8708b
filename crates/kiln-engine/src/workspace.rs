//! Workspace provisioner.
//!
//! Two levels of directory under the data root:
//!
//! - `<root>/venvs/<language>/` — per-language base workspaces, created once
//!   at startup and read-mostly afterwards (virtualenv, node_modules, build
//!   dirs, ...). A language whose base setup fails is marked *degraded* and
//!   keeps working against the system toolchain.
//! - `<root>/sessions/<session-id>/` — per-session workspaces, created on
//!   demand and removed when the session is destroyed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use kiln_model::{LanguageId, LanguageSpec};
use tokio::process::Command;
use tokio::sync::Semaphore;

/// Languages provisioned concurrently during startup.
const PROVISION_CONCURRENCY: usize = 3;

/// Wall-clock budget for one package-install or skeleton command.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Default stale-workspace age for [`Provisioner::sweep_stale`].
pub const DEFAULT_SWEEP_AGE: Duration = Duration::from_secs(24 * 3600);

/// Creates and owns base and session workspaces.
pub struct Provisioner {
    root: PathBuf,
    base_ready: Mutex<HashMap<LanguageId, PathBuf>>,
    degraded: Mutex<HashSet<LanguageId>>,
}

impl Provisioner {
    /// Create a provisioner rooted at `root`. No directories are touched yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base_ready: Mutex::new(HashMap::new()),
            degraded: Mutex::new(HashSet::new()),
        }
    }

    /// Root of all per-language base workspaces.
    pub fn base_root(&self) -> PathBuf {
        self.root.join("venvs")
    }

    /// Root of all session workspaces.
    pub fn sessions_root(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Provision every language's base workspace, at most
    /// [`PROVISION_CONCURRENCY`] in flight. One language's failure degrades
    /// that language only; startup continues.
    pub async fn ensure_base_workspaces(self: &Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(PROVISION_CONCURRENCY));
        let mut handles = Vec::new();

        for spec in LanguageSpec::all() {
            let semaphore = semaphore.clone();
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closes");
                let id = spec.id;
                match this.init_base(spec).await {
                    Ok(path) => {
                        this.base_ready
                            .lock()
                            .expect("base map lock poisoned")
                            .insert(id, path);
                        tracing::info!(language = %id, "base workspace ready");
                    }
                    Err(e) => {
                        this.degraded
                            .lock()
                            .expect("degraded set lock poisoned")
                            .insert(id);
                        tracing::warn!(
                            language = %id,
                            error = %e,
                            "base workspace setup failed, language degraded"
                        );
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Initialize one language's base workspace. Idempotent: existing
    /// skeletons are left alone.
    pub(crate) async fn init_base(&self, spec: &LanguageSpec) -> anyhow::Result<PathBuf> {
        let base = self.base_root().join(spec.id.as_str());
        tokio::fs::create_dir_all(&base)
            .await
            .with_context(|| format!("creating base dir for {}", spec.id))?;

        match spec.id {
            LanguageId::Python => {
                if !base.join("bin").exists() {
                    run_setup(
                        Command::new("python3").args(["-m", "venv"]).arg(&base),
                        "python3 -m venv",
                    )
                    .await?;
                }
                if !spec.default_packages.is_empty() {
                    let pip = base.join("bin").join("pip");
                    run_setup(
                        Command::new(pip)
                            .args(["install", "--quiet"])
                            .args(spec.default_packages),
                        "pip install",
                    )
                    .await?;
                }
            }
            LanguageId::Javascript | LanguageId::Typescript => {
                if !base.join("package.json").exists() {
                    run_setup(
                        Command::new("npm").args(["init", "-y"]).current_dir(&base),
                        "npm init",
                    )
                    .await?;
                }
                if !spec.default_packages.is_empty() {
                    run_setup(
                        Command::new("npm")
                            .args(["install", "--no-audit", "--no-fund"])
                            .args(spec.default_packages)
                            .current_dir(&base),
                        "npm install",
                    )
                    .await?;
                }
            }
            LanguageId::Go => {
                tokio::fs::create_dir_all(base.join("gopath")).await?;
                if !base.join("go.mod").exists() {
                    run_setup(
                        Command::new("go")
                            .args(["mod", "init", "kiln/sandbox"])
                            .current_dir(&base),
                        "go mod init",
                    )
                    .await?;
                }
            }
            LanguageId::Rust => {
                tokio::fs::create_dir_all(base.join(".cargo")).await?;
                tokio::fs::create_dir_all(base.join("src")).await?;
                tokio::fs::create_dir_all(base.join("build")).await?;
            }
            LanguageId::Java
            | LanguageId::C
            | LanguageId::Cpp
            | LanguageId::Csharp
            | LanguageId::Swift
            | LanguageId::Objc => {
                tokio::fs::create_dir_all(base.join("src")).await?;
                tokio::fs::create_dir_all(base.join("build")).await?;
                tokio::fs::create_dir_all(base.join("lib")).await?;
                tokio::fs::create_dir_all(base.join("include")).await?;
            }
            LanguageId::Php | LanguageId::Perl | LanguageId::Ruby | LanguageId::Lua => {
                tokio::fs::create_dir_all(base.join("lib")).await?;
            }
        }

        Ok(base)
    }

    /// The base workspace for a language, when it was provisioned cleanly.
    pub fn base_workspace(&self, language: LanguageId) -> Option<PathBuf> {
        self.base_ready
            .lock()
            .expect("base map lock poisoned")
            .get(&language)
            .cloned()
    }

    /// Whether a language's base setup failed at startup.
    pub fn is_degraded(&self, language: LanguageId) -> bool {
        self.degraded
            .lock()
            .expect("degraded set lock poisoned")
            .contains(&language)
    }

    /// All degraded languages, for health reporting.
    pub fn degraded_languages(&self) -> Vec<LanguageId> {
        let mut list: Vec<LanguageId> = self
            .degraded
            .lock()
            .expect("degraded set lock poisoned")
            .iter()
            .copied()
            .collect();
        list.sort();
        list
    }

    /// Create a fresh session workspace and return its path.
    pub async fn session_workspace(&self, session_id: &str) -> anyhow::Result<PathBuf> {
        let dir = self.sessions_root().join(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating session workspace {}", dir.display()))?;
        Ok(dir)
    }

    /// Recursively remove a session workspace. Errors are logged, not
    /// surfaced.
    pub async fn destroy_session_workspace(&self, session_id: &str) {
        let dir = self.sessions_root().join(session_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    session_id,
                    error = %e,
                    "failed to remove session workspace"
                );
            }
        }
    }

    /// Remove session directories whose modification time is older than
    /// `max_age`. Returns how many were removed.
    pub async fn sweep_stale(&self, max_age: Duration) -> usize {
        let root = self.sessions_root();
        let mut removed = 0;

        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(_) => return 0, // no sessions root yet
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let stale = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified
                    .elapsed()
                    .map(|age| age > max_age)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if stale {
                if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                    tracing::warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "failed to remove stale workspace"
                    );
                } else {
                    removed += 1;
                    tracing::info!(path = %entry.path().display(), "removed stale workspace");
                }
            }
        }

        removed
    }
}

/// Run a skeleton/install command with a hard timeout, discarding output on
/// success and surfacing the tail of stderr on failure.
async fn run_setup(command: &mut Command, label: &str) -> anyhow::Result<()> {
    command.stdin(std::process::Stdio::null());
    command.kill_on_drop(true);

    let output = tokio::time::timeout(INSTALL_TIMEOUT, command.output())
        .await
        .map_err(|_| anyhow::anyhow!("{label} timed out after {}s", INSTALL_TIMEOUT.as_secs()))?
        .with_context(|| format!("failed to run {label}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        anyhow::bail!("{label} exited with {}: {tail}", output.status);
    }
    Ok(())
}

/// Mark a path with an old mtime (test support).
#[cfg(test)]
fn backdate(path: &Path, age: Duration) {
    let mtime = std::time::SystemTime::now() - age;
    let times = std::fs::FileTimes::new().set_modified(mtime);
    let file = std::fs::File::open(path).unwrap();
    file.set_times(times).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioner() -> (tempfile::TempDir, Arc<Provisioner>) {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(Provisioner::new(dir.path()));
        (dir, p)
    }

    #[tokio::test]
    async fn session_workspace_is_created_under_sessions_root() {
        let (_dir, p) = provisioner();
        let ws = p.session_workspace("abc123").await.unwrap();
        assert!(ws.ends_with("sessions/abc123"));
        assert!(ws.is_dir());
    }

    #[tokio::test]
    async fn destroy_session_workspace_removes_recursively() {
        let (_dir, p) = provisioner();
        let ws = p.session_workspace("abc123").await.unwrap();
        tokio::fs::write(ws.join("main.py"), "print(1)").await.unwrap();

        p.destroy_session_workspace("abc123").await;
        assert!(!ws.exists());
    }

    #[tokio::test]
    async fn destroy_of_missing_workspace_is_quiet() {
        let (_dir, p) = provisioner();
        p.destroy_session_workspace("never-existed").await;
    }

    #[tokio::test]
    async fn init_base_creates_compiled_language_skeleton() {
        let (_dir, p) = provisioner();
        let spec = LanguageSpec::lookup(LanguageId::Cpp);
        let base = p.init_base(spec).await.unwrap();
        for sub in ["src", "build", "lib", "include"] {
            assert!(base.join(sub).is_dir(), "missing {sub}");
        }
    }

    #[tokio::test]
    async fn init_base_is_idempotent() {
        let (_dir, p) = provisioner();
        let spec = LanguageSpec::lookup(LanguageId::Java);
        let first = p.init_base(spec).await.unwrap();
        let second = p.init_base(spec).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn degraded_language_is_tracked() {
        let (_dir, p) = provisioner();
        assert!(!p.is_degraded(LanguageId::Python));
        p.degraded
            .lock()
            .unwrap()
            .insert(LanguageId::Python);
        assert!(p.is_degraded(LanguageId::Python));
        assert_eq!(p.degraded_languages(), vec![LanguageId::Python]);
    }

    #[tokio::test]
    async fn base_workspace_lookup_reflects_ready_map() {
        let (_dir, p) = provisioner();
        assert!(p.base_workspace(LanguageId::Lua).is_none());
        let spec = LanguageSpec::lookup(LanguageId::Lua);
        let base = p.init_base(spec).await.unwrap();
        p.base_ready
            .lock()
            .unwrap()
            .insert(LanguageId::Lua, base.clone());
        assert_eq!(p.base_workspace(LanguageId::Lua), Some(base));
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_directories() {
        let (_dir, p) = provisioner();
        let old = p.session_workspace("old").await.unwrap();
        let fresh = p.session_workspace("fresh").await.unwrap();

        backdate(&old, Duration::from_secs(48 * 3600));

        let removed = p.sweep_stale(DEFAULT_SWEEP_AGE).await;
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn sweep_without_sessions_root_is_zero() {
        let (_dir, p) = provisioner();
        assert_eq!(p.sweep_stale(DEFAULT_SWEEP_AGE).await, 0);
    }
}
