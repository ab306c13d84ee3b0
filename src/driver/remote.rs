//! The SSH remote proxy.
//!
//! A remote target behaves like any other driver, but every backend
//! invocation is wrapped into `ssh <host> sh -lc "<command>"`. The proxy is
//! composed, not flagged: the inner driver is the ordinary local driver
//! built over an SSH-backed execution seam, so it never learns it is
//! remote. Binary staging needs two hops (scp to the host, then the native
//! copy primitive into the guest); the proxy overrides the copy operations
//! for that. Credentials are the SSH transport's business, never cached
//! here.

use crate::{
    base::{BaseImage, StorageKind},
    driver::{
        build_with_exec,
        exec::{DefaultExec, Exec, ExecOpts, ExecOutput, InvocationKind},
        BackendInstance, CloneTicket, CreateSpec, Driver, DriverKind, ProbeInfo,
    },
    error::{Error, Result},
};
use async_trait::async_trait;
use log::{debug, warn};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug)]
/// Connection parameters for one remote target, taken from the command's
/// `host=`, `user=` and `sudo=` parameters.
pub struct SshConfig {
    pub host: String,
    pub user: Option<String>,
    /// Retry exec-like invocations once with sudo on "command not found" or
    /// "permission denied".
    pub retry_sudo_exec: bool,
    /// Same for raw file transfers; off by default.
    pub retry_sudo_transfer: bool,
}

impl SshConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            retry_sudo_exec: true,
            retry_sudo_transfer: false,
        }
    }

    pub fn user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn sudo(mut self, enabled: bool) -> Self {
        self.retry_sudo_exec = enabled;
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// Quote one shell word for the remote `sh -lc` line.
fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,{}".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn shell_join(binary: &Path, args: &[String]) -> String {
    let mut parts = vec![shell_quote(&binary.display().to_string())];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

#[derive(Clone, Debug)]
/// An execution seam that runs every command on the remote host.
pub struct SshExec {
    config: SshConfig,
    inner: Box<dyn Exec>,
}

impl SshExec {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            inner: Box::new(DefaultExec),
        }
    }

    pub(crate) fn with_inner(config: SshConfig, inner: Box<dyn Exec>) -> Self {
        Self { config, inner }
    }

    fn ssh_args(&self, command_line: &str) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(user) = &self.config.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        args.push(self.config.host.clone());
        args.push("sh".to_string());
        args.push("-lc".to_string());
        args.push(shell_quote(command_line));
        args
    }

    fn retry_allowed(&self, kind: InvocationKind) -> bool {
        match kind {
            InvocationKind::Exec => self.config.retry_sudo_exec,
            InvocationKind::Transfer => self.config.retry_sudo_transfer,
        }
    }
}

fn wants_sudo_retry(output: &ExecOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    !output.success()
        && (stderr.contains("command not found") || stderr.contains("permission denied"))
}

#[async_trait]
impl Exec for SshExec {
    async fn run(&self, binary: &Path, args: &[String], opts: ExecOpts) -> Result<ExecOutput> {
        let command_line = shell_join(binary, args);
        let output = self
            .inner
            .run(
                Path::new("ssh"),
                &self.ssh_args(&command_line),
                opts.clone(),
            )
            .await?;

        if wants_sudo_retry(&output) && self.retry_allowed(opts.invocation_kind()) {
            warn!(
                "Remote command failed on {}; retrying once with sudo",
                self.config.host
            );
            let sudo_line = format!("sudo {}", command_line);
            return self
                .inner
                .run(Path::new("ssh"), &self.ssh_args(&sudo_line), opts)
                .await;
        }
        Ok(output)
    }
}

#[derive(Debug)]
/// A driver whose every operation happens on another host.
pub struct RemoteDriver {
    kind: DriverKind,
    inner: Arc<dyn Driver>,
    config: SshConfig,
    /// The same SSH seam the inner driver uses; also runs staging cleanup.
    shell: SshExec,
    /// Local-side seam for the scp hop.
    local: Box<dyn Exec>,
}

impl RemoteDriver {
    pub fn new(kind: DriverKind, config: SshConfig) -> Result<Self> {
        Self::with_execs(kind, config, Box::new(DefaultExec), Box::new(DefaultExec))
    }

    /// Seam-injecting constructor shared by production and tests.
    pub fn with_execs(
        kind: DriverKind,
        config: SshConfig,
        remote: Box<dyn Exec>,
        local: Box<dyn Exec>,
    ) -> Result<Self> {
        let shell = SshExec::with_inner(config.clone(), remote);
        let inner = build_with_exec(kind.local_equivalent(), Box::new(shell.clone()))?;
        Ok(Self {
            kind,
            inner,
            config,
            shell,
            local,
        })
    }

    fn staging_path(local: &Path) -> String {
        let file = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload".to_string());
        format!(
            "/tmp/corral-{}-{}-{}",
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::SeqCst),
            file
        )
    }

    async fn scp(&self, from: &str, to: &str) -> Result<()> {
        let args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-q".to_string(),
            from.to_string(),
            to.to_string(),
        ];
        let opts = ExecOpts {
            kind: Some(InvocationKind::Transfer),
            ..ExecOpts::default()
        };
        let output = self.local.run(Path::new("scp"), &args, opts).await?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::new(
                crate::error::ErrorKind::IoError,
                format!("scp {} -> {} failed: {}", from, to, output.stderr.trim()),
            )
            .with_output(output.stdout, output.stderr))
        }
    }

    /// Best-effort removal of a staged file on the remote host.
    async fn remove_staged(&self, path: &str) {
        let _ = self
            .shell
            .run(
                Path::new("rm"),
                &["-f".to_string(), path.to_string()],
                ExecOpts::default(),
            )
            .await;
    }
}

#[async_trait]
impl Driver for RemoteDriver {
    fn kind(&self) -> DriverKind {
        self.kind
    }

    fn stdin_capable(&self) -> bool {
        self.inner.stdin_capable()
    }

    async fn probe(&self) -> Result<ProbeInfo> {
        self.inner.probe().await
    }

    async fn list(&self) -> Result<Vec<BackendInstance>> {
        self.inner.list().await
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        self.inner.create(spec).await
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.inner.start(name).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.inner.stop(name).await
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        self.inner.remove(name, force).await
    }

    async fn exec(&self, name: &str, command: &[String], opts: ExecOpts) -> Result<ExecOutput> {
        self.inner.exec(name, command, opts).await
    }

    /// Two hops: scp the file to the host, then the native copy primitive
    /// moves it into the guest. The host-side staging file is removed either
    /// way.
    async fn copy_to(&self, name: &str, local: &Path, remote: &str) -> Result<()> {
        let staged = Self::staging_path(local);
        debug!("Staging {} on {} as {}", local.display(), self.config.host, staged);
        self.scp(
            &local.display().to_string(),
            &format!("{}:{}", self.config.destination(), staged),
        )
        .await?;

        let result = self.inner.copy_to(name, Path::new(&staged), remote).await;
        self.remove_staged(&staged).await;
        result
    }

    async fn copy_from(&self, name: &str, remote: &str, local: &Path) -> Result<()> {
        let staged = Self::staging_path(local);
        let result = self.inner.copy_from(name, remote, Path::new(&staged)).await;
        if let Err(err) = result {
            self.remove_staged(&staged).await;
            return Err(err);
        }
        let fetched = self
            .scp(
                &format!("{}:{}", self.config.destination(), staged),
                &local.display().to_string(),
            )
            .await;
        self.remove_staged(&staged).await;
        fetched
    }

    async fn logs(&self, name: &str, lines: usize) -> Result<String> {
        self.inner.logs(name, lines).await
    }

    async fn snapshot_base(&self, source: &str, base_name: &str) -> Result<(StorageKind, String)> {
        self.inner.snapshot_base(source, base_name).await
    }

    async fn clone_from_base(&self, base: &BaseImage, name: &str) -> Result<CloneTicket> {
        self.inner.clone_from_base(base, name).await
    }

    async fn delete_base_snapshot(&self, base: &BaseImage) -> Result<()> {
        self.inner.delete_base_snapshot(base).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::exec::tests::MockExec;

    fn config() -> SshConfig {
        SshConfig::new("10.0.0.2").user(Some("admin".to_string()))
    }

    #[tokio::test]
    async fn commands_are_wrapped_in_ssh() {
        let remote = MockExec::new();
        remote.push_ok("");
        let driver = RemoteDriver::with_execs(
            DriverKind::RemoteDocker,
            config(),
            Box::new(remote.clone()),
            Box::new(MockExec::new()),
        )
        .unwrap();

        driver.start("web-1").await.unwrap();
        assert_eq!(
            remote.call_lines()[0],
            "ssh -o BatchMode=yes -l admin 10.0.0.2 sh -lc 'docker start web-1'"
        );
    }

    #[tokio::test]
    async fn sudo_retry_once_for_exec_like_ops() {
        let remote = MockExec::new();
        remote.push_exit(127, "sh: docker: command not found");
        remote.push_ok("");
        let driver = RemoteDriver::with_execs(
            DriverKind::RemoteDocker,
            config(),
            Box::new(remote.clone()),
            Box::new(MockExec::new()),
        )
        .unwrap();

        driver.start("web-1").await.unwrap();
        let lines = remote.call_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("'sudo docker start web-1'"));
    }

    #[tokio::test]
    async fn no_sudo_retry_for_transfers() {
        let remote = MockExec::new();
        remote.push_exit(1, "permission denied");
        let local = MockExec::new();
        let driver = RemoteDriver::with_execs(
            DriverKind::RemoteDocker,
            config(),
            Box::new(remote.clone()),
            Box::new(local.clone()),
        )
        .unwrap();

        let err = driver
            .copy_to("web-1", Path::new("/tmp/rexx"), "/usr/local/bin/rexx")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IoError);
        // one docker cp attempt, one staging cleanup; no sudo retry of the cp
        let docker_calls: Vec<_> = remote
            .call_lines()
            .into_iter()
            .filter(|l| l.contains("docker cp"))
            .collect();
        assert_eq!(docker_calls.len(), 1);
    }

    #[tokio::test]
    async fn copy_to_stages_through_the_host() {
        let remote = MockExec::new();
        let local = MockExec::new();
        let driver = RemoteDriver::with_execs(
            DriverKind::RemoteDocker,
            config(),
            Box::new(remote.clone()),
            Box::new(local.clone()),
        )
        .unwrap();

        driver
            .copy_to("web-1", Path::new("/opt/rexx"), "/usr/local/bin/rexx")
            .await
            .unwrap();

        let scp_line = &local.call_lines()[0];
        assert!(scp_line.starts_with("scp -o BatchMode=yes -q /opt/rexx admin@10.0.0.2:/tmp/corral-"));

        let remote_lines = remote.call_lines();
        assert!(remote_lines[0].contains("docker cp /tmp/corral-"));
        assert!(remote_lines[0].contains("web-1:/usr/local/bin/rexx"));
        // staged file removed afterwards
        assert!(remote_lines[1].contains("rm -f /tmp/corral-"));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("docker"), "docker");
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(
            shell_join(Path::new("docker"), &["exec".to_string(), "a b".to_string()]),
            "docker exec 'a b'"
        );
    }
}
