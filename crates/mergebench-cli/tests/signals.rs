//! Terminating `mergebench evaluate` mid-merge releases every claimed key.
//!
//! Each test builds an origin repository with one real merge, runs
//! `mergebench discover` against it, then starts `mergebench evaluate` with a
//! merge tool that blocks until killed and signals the process.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) {
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
}

fn commit(dir: &Path, file: &str, body: &str) {
    fs::write(dir.join(file), body).unwrap();
    git(dir, &["add", file]);
    git(dir, &["commit", "-q", "-m", file]);
}

struct Bench {
    dir: TempDir,
    started: PathBuf,
}

impl Bench {
    /// An origin at `origin/octo/widgets` holding one two-sided merge, and a
    /// config whose only tool blocks after touching `started`.
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        let origin = root.join("origin/octo/widgets");
        fs::create_dir_all(&origin).unwrap();
        git(&origin, &["init", "-q", "-b", "main"]);
        git(&origin, &["config", "commit.gpgsign", "false"]);
        commit(&origin, "base.txt", "base\n");
        git(&origin, &["checkout", "-q", "-b", "feature"]);
        commit(&origin, "feature.txt", "feature\n");
        git(&origin, &["checkout", "-q", "main"]);
        commit(&origin, "main.txt", "main\n");
        git(&origin, &["merge", "-q", "--no-ff", "-m", "merge feature", "feature"]);

        let started = root.join("started");
        let tool = root.join("slow-merge.sh");
        fs::write(
            &tool,
            format!("#!/bin/sh\ntouch '{}'\nexec sleep 60\n", started.display()),
        )
        .unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let config = format!(
            r#"[discovery]
repos_dir = "{root}/repos"
ledger_dir = "{root}/merges"
clone_url_template = "{root}/origin/{{owner}}/{{name}}"

[cache]
root = "{root}/cache"
acquire_attempts = 1

[evaluation]
workdir = "{root}/work"
merge_timeout_secs = 120

[[tools]]
name = "slow"
command = "{tool}"
"#,
            root = root.display(),
            tool = tool.display(),
        );
        fs::write(root.join("mergebench.toml"), config).unwrap();

        let bench = Self { dir, started };
        let out = bench
            .command(&["discover", "--repo", "octo/widgets"])
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "discover failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        bench
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_mergebench"));
        cmd.args(args)
            .current_dir(self.root())
            .env("MERGEBENCH_CONFIG", self.root().join("mergebench.toml"))
            .env_remove("MERGEBENCH_CACHE");
        cmd
    }

    /// Start `evaluate` and wait until the merge tool is running.
    fn evaluate_until_merging(&self) -> Child {
        let mut child = self.command(&["evaluate"]).spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(60);
        while !self.started.exists() {
            if let Some(status) = child.try_wait().unwrap() {
                panic!("evaluate exited before merging: {status}");
            }
            assert!(Instant::now() < deadline, "merge tool never started");
            std::thread::sleep(Duration::from_millis(50));
        }
        child
    }

    fn files_in(&self, namespace: &str, suffix: &str) -> Vec<String> {
        match fs::read_dir(self.root().join("cache").join(namespace)) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| n.ends_with(suffix))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn signal(child: &Child, name: &str) {
    let status = Command::new("kill")
        .arg(format!("-{name}"))
        .arg(child.id().to_string())
        .status()
        .unwrap();
    assert!(status.success(), "kill -{name} failed");
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> ExitStatus {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("evaluate did not stop within {limit:?}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn sigterm_during_merge_releases_the_claim() {
    let bench = Bench::new();
    let mut child = bench.evaluate_until_merging();
    assert_eq!(bench.files_in("placeholders", ".json").len(), 1);
    assert_eq!(bench.files_in("locks", ".lock").len(), 1);

    signal(&child, "TERM");
    let status = wait_with_deadline(&mut child, Duration::from_secs(30));

    assert!(!status.success(), "an interrupted run reports failure");
    assert!(bench.files_in("placeholders", ".json").is_empty());
    assert!(bench.files_in("locks", ".lock").is_empty());
    // Cancellation records nothing; the key stays absent.
    assert!(bench.files_in("entries", "").is_empty());
}

#[test]
fn repeated_interrupt_still_releases_the_claim() {
    let bench = Bench::new();
    let mut child = bench.evaluate_until_merging();

    signal(&child, "INT");
    signal(&child, "INT");
    let status = wait_with_deadline(&mut child, Duration::from_secs(30));

    assert!(!status.success());
    assert!(bench.files_in("placeholders", ".json").is_empty());
    assert!(bench.files_in("locks", ".lock").is_empty());
}

#[test]
fn interrupted_key_is_claimable_by_the_next_run() {
    let bench = Bench::new();
    let mut child = bench.evaluate_until_merging();
    signal(&child, "TERM");
    wait_with_deadline(&mut child, Duration::from_secs(30));

    // A rerun reaches the merge tool again instead of seeing the key busy.
    fs::remove_file(&bench.started).unwrap();
    let mut rerun = bench.evaluate_until_merging();
    signal(&rerun, "TERM");
    wait_with_deadline(&mut rerun, Duration::from_secs(30));
}
