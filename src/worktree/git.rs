use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::paths::{canonicalize_lenient, is_within};
use super::{validate_name, CreateOptions, Worktree, WorktreeError, WorktreeManager};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const FALLBACK_BASE_BRANCH: &str = "main";

#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Stderr when present, else stdout, else a generic message.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            "Git command failed".to_string()
        }
    }
}

/// Runs git. Separate from the manager so tests can observe invocations.
#[async_trait]
pub trait GitExecutor: Send + Sync {
    async fn run(&self, dir: &Path, args: &[&str], cancel: &CancellationToken) -> Result<GitOutput, WorktreeError>;
}

/// The `git` binary on PATH.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

#[async_trait]
impl GitExecutor for GitCli {
    async fn run(&self, dir: &Path, args: &[&str], cancel: &CancellationToken) -> Result<GitOutput, WorktreeError> {
        if cancel.is_cancelled() {
            return Err(WorktreeError::Cancelled);
        }
        if !dir.exists() {
            return Err(WorktreeError::NotARepository(dir.to_path_buf()));
        }

        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Prevent console window from flashing on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let child = cmd.spawn()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WorktreeError::Cancelled),
            output = child.wait_with_output() => {
                let output = output?;
                Ok(GitOutput {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
        }
    }
}

/// Top level of the repository containing `dir`.
pub async fn repo_root<E: GitExecutor>(git: &E, dir: &Path, cancel: &CancellationToken) -> Result<PathBuf, WorktreeError> {
    let output = git.run(dir, &["rev-parse", "--show-toplevel"], cancel).await?;
    if !output.success {
        return Err(WorktreeError::NotARepository(dir.to_path_buf()));
    }
    Ok(canonicalize_lenient(Path::new(output.stdout.trim())))
}

pub async fn is_git_repository<E: GitExecutor>(git: &E, dir: &Path, cancel: &CancellationToken) -> bool {
    repo_root(git, dir, cancel).await.is_ok()
}

/// One record of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: String,
    pub head: String,
    pub is_bare: bool,
}

pub fn parse_worktree_list(output: &str) -> Result<Vec<WorktreeEntry>, WorktreeError> {
    let malformed = |detail: &str| WorktreeError::Git {
        command: "worktree list".to_string(),
        message: format!("Unexpected git worktree output: {}", detail),
    };

    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }

        if let Some(path) = line.strip_prefix("worktree ") {
            if path.is_empty() {
                return Err(malformed("missing path"));
            }
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: String::new(),
                head: String::new(),
                is_bare: false,
            });
            continue;
        }

        let entry = current.as_mut().ok_or_else(|| malformed(line))?;
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = branch.strip_prefix("refs/heads/").unwrap_or(branch).to_string();
        } else if line == "bare" {
            entry.is_bare = true;
        } else if line == "detached" && entry.branch.is_empty() {
            entry.branch = "detached".to_string();
        }
    }

    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    Ok(entries)
}

/// Worktree manager backed by the git CLI. Worktrees live in
/// `<work_root>/<name>` on branch `<namespace>/<name>` unless told otherwise.
pub struct GitWorktreeManager<E: GitExecutor = GitCli> {
    repo_path: PathBuf,
    work_root: PathBuf,
    branch_namespace: String,
    git: E,
    mutations: Mutex<()>,
}

impl GitWorktreeManager<GitCli> {
    pub fn new(
        repo_path: impl AsRef<Path>,
        work_root: impl AsRef<Path>,
        branch_namespace: impl Into<String>,
    ) -> Result<Self, WorktreeError> {
        Self::with_executor(repo_path, work_root, branch_namespace, GitCli)
    }
}

impl<E: GitExecutor> GitWorktreeManager<E> {
    pub fn with_executor(
        repo_path: impl AsRef<Path>,
        work_root: impl AsRef<Path>,
        branch_namespace: impl Into<String>,
        git: E,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.as_ref();
        if !repo_path.exists() {
            return Err(WorktreeError::NotARepository(repo_path.to_path_buf()));
        }
        std::fs::create_dir_all(work_root.as_ref())?;

        Ok(Self {
            repo_path: canonicalize_lenient(repo_path),
            work_root: canonicalize_lenient(work_root.as_ref()),
            branch_namespace: branch_namespace.into(),
            git,
            mutations: Mutex::new(()),
        })
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn default_branch_for(&self, name: &str) -> String {
        format!("{}/{}", self.branch_namespace, name)
    }

    async fn git(&self, args: &[&str], cancel: &CancellationToken) -> Result<GitOutput, WorktreeError> {
        self.git.run(&self.repo_path, args, cancel).await
    }

    async fn git_ok(&self, args: &[&str], cancel: &CancellationToken) -> Result<String, WorktreeError> {
        let output = self.git(args, cancel).await?;
        if !output.success {
            return Err(WorktreeError::Git {
                command: args.join(" "),
                message: output.diagnostic(),
            });
        }
        Ok(output.stdout)
    }

    async fn entries(&self, cancel: &CancellationToken) -> Result<Vec<WorktreeEntry>, WorktreeError> {
        let output = self.git_ok(&["worktree", "list", "--porcelain"], cancel).await?;
        let mut entries = parse_worktree_list(&output)?;
        for entry in &mut entries {
            entry.path = canonicalize_lenient(&entry.path);
        }
        Ok(entries)
    }

    /// Registered worktree at `path`, provided its `.git` marker still exists.
    async fn registered_at(&self, path: &Path, cancel: &CancellationToken) -> Result<Option<WorktreeEntry>, WorktreeError> {
        if !path.join(".git").exists() {
            return Ok(None);
        }
        let path = canonicalize_lenient(path);
        Ok(self.entries(cancel).await?.into_iter().find(|e| e.path == path))
    }

    async fn prune_logged(&self, cancel: &CancellationToken) {
        if let Err(e) = self.git_ok(&["worktree", "prune"], cancel).await {
            tracing::warn!("git worktree prune failed (continuing): {}", e);
        }
    }

    async fn current_branch(&self, cancel: &CancellationToken) -> String {
        match self.git_ok(&["rev-parse", "--abbrev-ref", "HEAD"], cancel).await {
            Ok(out) => {
                let branch = out.trim();
                if branch.is_empty() || branch == "HEAD" {
                    FALLBACK_BASE_BRANCH.to_string()
                } else {
                    branch.to_string()
                }
            }
            Err(_) => FALLBACK_BASE_BRANCH.to_string(),
        }
    }

    async fn branch_exists(&self, branch: &str, cancel: &CancellationToken) -> Result<bool, WorktreeError> {
        let reference = format!("refs/heads/{}", branch);
        let output = self.git(&["rev-parse", "--verify", "--quiet", &reference], cancel).await?;
        Ok(output.success)
    }

    async fn remove_dir_if_present(path: &Path) -> Result<(), WorktreeError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(path).await?;
        }
        Ok(())
    }

    /// Reuses `branch` if it exists, otherwise branches fresh from `base`.
    async fn add_worktree(&self, path: &Path, branch: &str, base: &str, cancel: &CancellationToken) -> Result<(), WorktreeError> {
        let path_arg = path.to_string_lossy().into_owned();

        if self.branch_exists(branch, cancel).await? {
            match self.git_ok(&["worktree", "add", &path_arg, branch], cancel).await {
                Ok(_) => return Ok(()),
                Err(WorktreeError::Cancelled) => return Err(WorktreeError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        "Could not attach existing branch {} ({}); recreating from {}",
                        branch,
                        e,
                        base
                    );
                    Self::remove_dir_if_present(path).await?;
                    let _ = self.git(&["branch", "-D", branch], cancel).await?;
                }
            }
        }

        self.git_ok(&["worktree", "add", "-b", branch, &path_arg, base], cancel)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<E: GitExecutor> WorktreeManager for GitWorktreeManager<E> {
    async fn create(&self, opts: CreateOptions, cancel: &CancellationToken) -> Result<Worktree, WorktreeError> {
        validate_name(&opts.name)?;
        let _guard = self.mutations.lock().await;

        self.prune_logged(cancel).await;

        let path = self.work_root.join(&opts.name);
        let branch = opts
            .branch
            .clone()
            .unwrap_or_else(|| self.default_branch_for(&opts.name));

        if let Some(existing) = self.registered_at(&path, cancel).await? {
            tracing::info!("Reusing worktree {} at {}", opts.name, existing.path.display());
            let branch = if existing.branch.is_empty() { branch } else { existing.branch };
            return Ok(Worktree {
                name: opts.name,
                path: existing.path,
                branch,
                repo_path: self.repo_path.clone(),
            });
        }

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::warn!("Removing orphaned worktree directory {}", path.display());
            tokio::fs::remove_dir_all(&path).await?;
        }

        let base = match &opts.base_branch {
            Some(base) => base.clone(),
            None => self.current_branch(cancel).await,
        };

        match self.add_worktree(&path, &branch, &base, cancel).await {
            Ok(()) => {}
            Err(WorktreeError::Cancelled) => return Err(WorktreeError::Cancelled),
            Err(first) => {
                tracing::warn!("Worktree add for {} failed, retrying once: {}", opts.name, first);
                self.prune_logged(cancel).await;
                Self::remove_dir_if_present(&path).await?;
                let _ = self.git(&["branch", "-D", &branch], cancel).await?;
                let path_arg = path.to_string_lossy().into_owned();
                self.git_ok(&["worktree", "add", "-b", &branch, &path_arg, &base], cancel)
                    .await?;
            }
        }

        let path = canonicalize_lenient(&path);
        tracing::info!("Created worktree {} at {} on {}", opts.name, path.display(), branch);
        Ok(Worktree {
            name: opts.name,
            path,
            branch,
            repo_path: self.repo_path.clone(),
        })
    }

    async fn delete(&self, name: &str, cancel: &CancellationToken) -> Result<(), WorktreeError> {
        validate_name(name)?;
        let _guard = self.mutations.lock().await;

        let path = self.work_root.join(name);
        let path_arg = path.to_string_lossy().into_owned();
        match self.git_ok(&["worktree", "remove", "--force", &path_arg], cancel).await {
            Ok(_) => {}
            Err(WorktreeError::Cancelled) => return Err(WorktreeError::Cancelled),
            Err(e) => {
                tracing::warn!("git worktree remove failed for {}, removing directory: {}", name, e);
                Self::remove_dir_if_present(&path).await?;
            }
        }

        self.prune_logged(cancel).await;
        tracing::info!("Deleted worktree {}", name);
        Ok(())
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<Worktree>, WorktreeError> {
        let worktrees = self
            .entries(cancel)
            .await?
            .into_iter()
            .filter(|e| !e.is_bare && e.path != self.work_root && is_within(&e.path, &self.work_root))
            .filter_map(|e| {
                let name = e.path.file_name()?.to_string_lossy().into_owned();
                Some(Worktree {
                    name,
                    path: e.path,
                    branch: e.branch,
                    repo_path: self.repo_path.clone(),
                })
            })
            .collect();
        Ok(worktrees)
    }

    async fn get(&self, name: &str, cancel: &CancellationToken) -> Result<Worktree, WorktreeError> {
        self.list(cancel)
            .await?
            .into_iter()
            .find(|w| w.name == name)
            .ok_or_else(|| WorktreeError::NotFound(name.to_string()))
    }

    async fn prune(&self, cancel: &CancellationToken) -> Result<(), WorktreeError> {
        self.git_ok(&["worktree", "prune"], cancel).await.map(|_| ())
    }
}
