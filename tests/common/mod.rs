//! Shared helpers for mergebench integration tests.
//!
//! Everything lives in temp directories. Repositories are built with the
//! `git` CLI and fixed commit dates so history walks are deterministic.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicBool;

use mergebench::discovery::RepoProvider;
use mergebench::exec::CollaboratorError;
use mergebench::model::RepoSlug;
use mergebench_git::GitOid;
use tempfile::TempDir;

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test User")
        .env("GIT_AUTHOR_EMAIL", "test@test.com")
        .env("GIT_COMMITTER_NAME", "Test User")
        .env("GIT_COMMITTER_EMAIL", "test@test.com")
        .output()
        .expect("failed to run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8(out.stdout).unwrap().trim().to_owned()
}

/// A repository under construction. Each commit is one second after the
/// previous one.
pub struct Fixture {
    pub dir: TempDir,
    clock: i64,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        git(dir.path(), &["init", "-q", "-b", "main"]);
        git(dir.path(), &["config", "commit.gpgsign", "false"]);
        Self {
            dir,
            clock: 1_700_000_000,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn dated(&mut self, args: &[&str]) {
        self.clock += 1;
        let date = format!("{} +0000", self.clock);
        let out = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .env("GIT_AUTHOR_NAME", "Test User")
            .env("GIT_AUTHOR_EMAIL", "test@test.com")
            .env("GIT_COMMITTER_NAME", "Test User")
            .env("GIT_COMMITTER_EMAIL", "test@test.com")
            .env("GIT_AUTHOR_DATE", &date)
            .env("GIT_COMMITTER_DATE", &date)
            .output()
            .expect("failed to run git");
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }

    pub fn head(&self) -> GitOid {
        git(self.path(), &["rev-parse", "HEAD"]).parse().unwrap()
    }

    /// Write `file` with `content` and commit it.
    pub fn commit_file(&mut self, file: &str, content: &str) -> GitOid {
        std::fs::write(self.path().join(file), content).unwrap();
        git(self.path(), &["add", file]);
        self.dated(&["commit", "-q", "-m", file]);
        self.head()
    }

    pub fn checkout(&self, branch: &str) {
        git(self.path(), &["checkout", "-q", branch]);
    }

    pub fn branch_at(&self, branch: &str, at: GitOid) {
        git(self.path(), &["checkout", "-q", "-b", branch, &at.to_string()]);
    }

    /// Start an unrelated history on `branch`.
    pub fn orphan(&self, branch: &str) {
        git(self.path(), &["checkout", "-q", "--orphan", branch]);
        git(self.path(), &["rm", "-rq", "--cached", "--ignore-unmatch", "."]);
        git(self.path(), &["clean", "-fdq"]);
    }

    /// Merge `branch` into the current branch with a merge commit.
    pub fn merge(&mut self, branch: &str) -> GitOid {
        self.dated(&[
            "merge",
            "-q",
            "--no-ff",
            "--allow-unrelated-histories",
            "-m",
            &format!("merge {branch}"),
            branch,
        ]);
        self.head()
    }

    pub fn set_ref(&self, name: &str, at: GitOid) {
        git(self.path(), &["update-ref", name, &at.to_string()]);
    }
}

/// The history used across tests:
///
/// ```text
/// A --- B --- C --- M   (main)
///  \               /
///   D ----------- E     (feature)
/// ```
pub struct Diamond {
    pub fixture: Fixture,
    pub a: GitOid,
    pub c: GitOid,
    pub e: GitOid,
    pub m: GitOid,
}

pub fn diamond() -> Diamond {
    let mut fixture = Fixture::new();
    let a = fixture.commit_file("base.txt", "base");
    fixture.commit_file("main1.txt", "b");
    let c = fixture.commit_file("main2.txt", "c");
    fixture.branch_at("feature", a);
    fixture.commit_file("feature.txt", "d");
    let e = fixture.commit_file("feature2.txt", "e");
    fixture.checkout("main");
    let m = fixture.merge("feature");
    Diamond { fixture, a, c, e, m }
}

/// Serves clones that already exist under `root/<owner>__<name>`.
pub struct LocalProvider {
    pub root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_owned() }
    }

    /// Copy `source` into place as the clone of `slug`.
    pub fn install(&self, slug: &RepoSlug, source: &Path) {
        let dest = self.clone_path(slug);
        std::fs::create_dir_all(&self.root).unwrap();
        git(
            &self.root,
            &["clone", "-q", "--mirror", &source.to_string_lossy(), &dest.to_string_lossy()],
        );
    }
}

impl RepoProvider for LocalProvider {
    fn prepare(&self, repo: &RepoSlug, _cancel: &AtomicBool) -> Result<PathBuf, CollaboratorError> {
        let path = self.clone_path(repo);
        if path.exists() {
            Ok(path)
        } else {
            Err(CollaboratorError::Failed {
                program: "clone".to_owned(),
                detail: format!("{repo} is not available"),
            })
        }
    }

    fn clone_path(&self, repo: &RepoSlug) -> PathBuf {
        self.root.join(repo.file_stem())
    }
}

/// Write an executable shell script.
pub fn script(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt as _;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

pub fn slug(s: &str) -> RepoSlug {
    RepoSlug::new(s).unwrap()
}
