//! systemd-nspawn machines via `machinectl`.
//!
//! Lifecycle and file transfer go through `machinectl`; exec goes through
//! `systemd-run --machine --pipe`, which accepts stdin; logs come from the
//! machine's journal. `machinectl clone` rides the btrfs snapshot support of
//! /var/lib/machines, so bases are read-only images cloned per instance.

use crate::{
    base::{BaseImage, StorageKind},
    driver::{
        classify_failure,
        exec::{Exec, ExecOpts, ExecOutput, InvocationKind},
        BackendInstance, CloneTicket, CreateSpec, Driver, DriverKind, ProbeInfo,
    },
    error::Result,
    instance::Status,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct NspawnDriver {
    binary: PathBuf,
    exec: Box<dyn Exec>,
}

impl NspawnDriver {
    pub fn new(exec: Box<dyn Exec>) -> Self {
        Self {
            binary: PathBuf::from("machinectl"),
            exec,
        }
    }

    async fn run(&self, action: &str, args: Vec<String>, opts: ExecOpts) -> Result<ExecOutput> {
        let output = self.exec.run(&self.binary, &args, opts).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_failure(DriverKind::Nspawn, action, &output))
        }
    }
}

#[async_trait]
impl Driver for NspawnDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Nspawn
    }

    async fn probe(&self) -> Result<ProbeInfo> {
        match self
            .exec
            .run(&self.binary, &["--version".to_string()], ExecOpts::default())
            .await
        {
            Ok(output) if output.success() => Ok(ProbeInfo {
                available: true,
                version: output.stdout.lines().next().map(str::to_string),
            }),
            Ok(_) | Err(_) => Ok(ProbeInfo {
                available: false,
                version: None,
            }),
        }
    }

    async fn list(&self) -> Result<Vec<BackendInstance>> {
        let output = self
            .run(
                "list",
                vec!["list".to_string(), "--no-legend".to_string()],
                ExecOpts::default(),
            )
            .await?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| {
                let name = line.split_whitespace().next()?;
                Some(BackendInstance {
                    name: name.to_string(),
                    id: name.to_string(),
                    // machinectl list only shows running machines
                    status: Some(Status::Running),
                    image: String::new(),
                })
            })
            .collect())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        // a machine is created by cloning its source image
        self.run(
            "create",
            vec![
                "clone".to_string(),
                spec.image().clone(),
                spec.name().clone(),
            ],
            ExecOpts::default(),
        )
        .await?;
        Ok(spec.name().clone())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run(
            "start",
            vec!["start".to_string(), name.to_string()],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run(
            "stop",
            vec!["poweroff".to_string(), name.to_string()],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        if force {
            // terminate ignores machines that are already gone
            let _ = self
                .run(
                    "remove",
                    vec!["terminate".to_string(), name.to_string()],
                    ExecOpts::default(),
                )
                .await;
        }
        self.run(
            "remove",
            vec!["remove".to_string(), name.to_string()],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }

    async fn exec(&self, name: &str, command: &[String], opts: ExecOpts) -> Result<ExecOutput> {
        let mut args = vec![
            "--machine".to_string(),
            name.to_string(),
            "--pipe".to_string(),
            "--wait".to_string(),
            "--quiet".to_string(),
            "--".to_string(),
        ];
        args.extend(command.iter().cloned());
        self.exec.run(Path::new("systemd-run"), &args, opts).await
    }

    async fn copy_to(&self, name: &str, local: &Path, remote: &str) -> Result<()> {
        let opts = ExecOpts {
            kind: Some(InvocationKind::Transfer),
            ..ExecOpts::default()
        };
        self.run(
            "copy_to",
            vec![
                "copy-to".to_string(),
                name.to_string(),
                local.display().to_string(),
                remote.to_string(),
            ],
            opts,
        )
        .await
        .map(|_| ())
    }

    async fn copy_from(&self, name: &str, remote: &str, local: &Path) -> Result<()> {
        let opts = ExecOpts {
            kind: Some(InvocationKind::Transfer),
            ..ExecOpts::default()
        };
        self.run(
            "copy_from",
            vec![
                "copy-from".to_string(),
                name.to_string(),
                remote.to_string(),
                local.display().to_string(),
            ],
            opts,
        )
        .await
        .map(|_| ())
    }

    async fn logs(&self, name: &str, lines: usize) -> Result<String> {
        let args = vec![
            "-M".to_string(),
            name.to_string(),
            "-n".to_string(),
            lines.to_string(),
            "--no-pager".to_string(),
        ];
        let output = self.exec.run(Path::new("journalctl"), &args, ExecOpts::default()).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify_failure(DriverKind::Nspawn, "logs", &output))
        }
    }

    async fn snapshot_base(&self, source: &str, base_name: &str) -> Result<(StorageKind, String)> {
        self.run(
            "register_base",
            vec![
                "clone".to_string(),
                source.to_string(),
                base_name.to_string(),
            ],
            ExecOpts::default(),
        )
        .await?;
        self.run(
            "register_base",
            vec![
                "read-only".to_string(),
                base_name.to_string(),
                "true".to_string(),
            ],
            ExecOpts::default(),
        )
        .await?;
        Ok((StorageKind::Template, base_name.to_string()))
    }

    async fn clone_from_base(&self, base: &BaseImage, name: &str) -> Result<CloneTicket> {
        self.run(
            "clone_from_base",
            vec![
                "clone".to_string(),
                base.snapshot_ref().clone(),
                name.to_string(),
            ],
            ExecOpts::default(),
        )
        .await?;
        Ok(CloneTicket {
            id: name.to_string(),
            bytes_consumed: None,
        })
    }

    async fn delete_base_snapshot(&self, base: &BaseImage) -> Result<()> {
        self.run(
            "delete_base",
            vec!["remove".to_string(), base.snapshot_ref().clone()],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::exec::tests::MockExec;

    fn driver(mock: &MockExec) -> NspawnDriver {
        NspawnDriver::new(Box::new(mock.clone()))
    }

    #[tokio::test]
    async fn create_clones_the_source_image() {
        let mock = MockExec::new();
        let spec = crate::driver::CreateSpecBuilder::default()
            .name("web-1")
            .image("debian-base")
            .build()
            .unwrap();
        driver(&mock).create(&spec).await.unwrap();
        assert_eq!(mock.call_lines()[0], "machinectl clone debian-base web-1");
    }

    #[tokio::test]
    async fn exec_uses_systemd_run_with_pipe() {
        let mock = MockExec::new();
        driver(&mock)
            .exec(
                "web-1",
                &["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
                ExecOpts::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            mock.call_lines()[0],
            "systemd-run --machine web-1 --pipe --wait --quiet -- sh -c echo hi"
        );
    }

    #[tokio::test]
    async fn base_registration_marks_read_only() {
        let mock = MockExec::new();
        let (kind, snapshot_ref) = driver(&mock).snapshot_base("web-1", "b1").await.unwrap();
        assert_eq!(kind, StorageKind::Template);
        assert_eq!(snapshot_ref, "b1");
        let lines = mock.call_lines();
        assert_eq!(lines[0], "machinectl clone web-1 b1");
        assert_eq!(lines[1], "machinectl read-only b1 true");
    }

    #[tokio::test]
    async fn unknown_machine_maps_to_not_found() {
        let mock = MockExec::new();
        mock.push_exit(1, "Unknown machine ghost");
        let err = driver(&mock).stop("ghost").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn logs_read_the_journal() {
        let mock = MockExec::new();
        mock.push_ok("line1\nline2\n");
        let logs = driver(&mock).logs("web-1", 50).await.unwrap();
        assert_eq!(logs, "line1\nline2\n");
        assert_eq!(
            mock.call_lines()[0],
            "journalctl -M web-1 -n 50 --no-pager"
        );
    }
}
