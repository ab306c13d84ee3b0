//! LXD system containers via the `lxc` client.
//!
//! Bases are instance snapshots (`lxc snapshot`); clones are `lxc copy` of
//! the snapshot, which storage pools with snapshot support back without a
//! bulk copy.

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
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LxdDriver {
    binary: PathBuf,
    exec: Box<dyn Exec>,
}

impl LxdDriver {
    pub fn new(exec: Box<dyn Exec>) -> Self {
        Self {
            binary: PathBuf::from("lxc"),
            exec,
        }
    }

    async fn run(&self, action: &str, args: Vec<String>, opts: ExecOpts) -> Result<ExecOutput> {
        let output = self.exec.run(&self.binary, &args, opts).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_failure(DriverKind::Lxd, action, &output))
        }
    }
}

#[derive(Deserialize)]
struct LxcListEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
}

fn status_of(entry: &LxcListEntry) -> Option<Status> {
    match entry.status.to_lowercase().as_str() {
        "running" => Some(Status::Running),
        "stopped" => Some(Status::Stopped),
        "frozen" => Some(Status::Stopped),
        _ => None,
    }
}

#[async_trait]
impl Driver for LxdDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Lxd
    }

    async fn probe(&self) -> Result<ProbeInfo> {
        match self
            .exec
            .run(&self.binary, &["--version".to_string()], ExecOpts::default())
            .await
        {
            Ok(output) if output.success() => Ok(ProbeInfo {
                available: true,
                version: Some(output.stdout.trim().to_string()),
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
                vec!["list".to_string(), "--format".to_string(), "json".to_string()],
                ExecOpts::default(),
            )
            .await?;
        let entries: Vec<LxcListEntry> =
            serde_json::from_str(output.stdout.trim()).unwrap_or_default();
        Ok(entries
            .iter()
            .map(|entry| BackendInstance {
                name: entry.name.clone(),
                id: entry.name.clone(),
                status: status_of(entry),
                image: String::new(),
            })
            .collect())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        let mut args = vec![
            "init".to_string(),
            spec.image().clone(),
            spec.name().clone(),
        ];
        if spec.memory_bytes() > 0 {
            args.push("--config".to_string());
            args.push(format!("limits.memory={}", spec.memory_bytes()));
        }
        if spec.cpus() > 0.0 {
            args.push("--config".to_string());
            args.push(format!("limits.cpu={}", spec.cpus().ceil() as u64));
        }
        for (key, value) in spec.environment() {
            args.push("--config".to_string());
            args.push(format!("environment.{}={}", key, value));
        }
        if spec.privileged() {
            args.push("--config".to_string());
            args.push("security.privileged=true".to_string());
        }
        self.run("create", args, ExecOpts::default()).await?;

        for (index, volume) in spec.volumes().iter().enumerate() {
            debug!("Attaching volume {} to {}", volume.to_arg(), spec.name());
            self.run(
                "create",
                vec![
                    "config".to_string(),
                    "device".to_string(),
                    "add".to_string(),
                    spec.name().clone(),
                    format!("vol{}", index),
                    "disk".to_string(),
                    format!("source={}", volume.host().display()),
                    format!("path={}", volume.guest()),
                ],
                ExecOpts::default(),
            )
            .await?;
        }
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
            vec!["stop".to_string(), name.to_string()],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["delete".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(name.to_string());
        self.run("remove", args, ExecOpts::default()).await.map(|_| ())
    }

    async fn exec(&self, name: &str, command: &[String], opts: ExecOpts) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), name.to_string(), "--".to_string()];
        args.extend(command.iter().cloned());
        self.exec.run(&self.binary, &args, opts).await
    }

    async fn copy_to(&self, name: &str, local: &Path, remote: &str) -> Result<()> {
        let opts = ExecOpts {
            kind: Some(InvocationKind::Transfer),
            ..ExecOpts::default()
        };
        self.run(
            "copy_to",
            vec![
                "file".to_string(),
                "push".to_string(),
                local.display().to_string(),
                format!("{}{}", name, path_arg(remote)),
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
                "file".to_string(),
                "pull".to_string(),
                format!("{}{}", name, path_arg(remote)),
                local.display().to_string(),
            ],
            opts,
        )
        .await
        .map(|_| ())
    }

    async fn logs(&self, name: &str, lines: usize) -> Result<String> {
        let output = self
            .run(
                "logs",
                vec![
                    "info".to_string(),
                    "--show-log".to_string(),
                    name.to_string(),
                ],
                ExecOpts::default(),
            )
            .await?;
        let all: Vec<&str> = output.stdout.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].join("\n"))
    }

    async fn snapshot_base(&self, source: &str, base_name: &str) -> Result<(StorageKind, String)> {
        self.run(
            "register_base",
            vec![
                "snapshot".to_string(),
                source.to_string(),
                base_name.to_string(),
            ],
            ExecOpts::default(),
        )
        .await?;
        Ok((StorageKind::Template, format!("{}/{}", source, base_name)))
    }

    async fn clone_from_base(&self, base: &BaseImage, name: &str) -> Result<CloneTicket> {
        self.run(
            "clone_from_base",
            vec![
                "copy".to_string(),
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
            vec!["delete".to_string(), base.snapshot_ref().clone()],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }
}

/// `lxc file` wants `instance/path` with no duplicate slash.
fn path_arg(remote: &str) -> String {
    if remote.starts_with('/') {
        remote.to_string()
    } else {
        format!("/{}", remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::exec::tests::MockExec;

    fn driver(mock: &MockExec) -> LxdDriver {
        LxdDriver::new(Box::new(mock.clone()))
    }

    #[tokio::test]
    async fn create_with_limits_and_volume() {
        let mock = MockExec::new();
        let spec = crate::driver::CreateSpecBuilder::default()
            .name("web-1")
            .image("ubuntu:22.04")
            .memory_bytes(1024u64 * 1024 * 1024)
            .cpus(2.0)
            .volumes(vec![crate::instance::VolumeMount::new(
                "/srv/data".into(),
                "/data".to_string(),
            )])
            .build()
            .unwrap();

        driver(&mock).create(&spec).await.unwrap();
        let lines = mock.call_lines();
        assert_eq!(
            lines[0],
            "lxc init ubuntu:22.04 web-1 --config limits.memory=1073741824 --config limits.cpu=2"
        );
        assert_eq!(
            lines[1],
            "lxc config device add web-1 vol0 disk source=/srv/data path=/data"
        );
    }

    #[tokio::test]
    async fn exec_separates_argv() {
        let mock = MockExec::new();
        mock.push_ok("hi\n");
        driver(&mock)
            .exec(
                "web-1",
                &["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
                ExecOpts::default(),
            )
            .await
            .unwrap();
        assert_eq!(mock.call_lines()[0], "lxc exec web-1 -- sh -c echo hi");
    }

    #[tokio::test]
    async fn list_parses_json() {
        let mock = MockExec::new();
        mock.push_ok(r#"[{"name":"web-1","status":"Running"},{"name":"db","status":"Stopped"}]"#);
        let listed = driver(&mock).list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].status, Some(Status::Running));
        assert_eq!(listed[1].status, Some(Status::Stopped));
    }

    #[tokio::test]
    async fn snapshot_and_clone_commands() {
        let mock = MockExec::new();
        let driver = driver(&mock);
        let (kind, snapshot_ref) = driver.snapshot_base("web-1", "b1").await.unwrap();
        assert_eq!(kind, StorageKind::Template);
        assert_eq!(snapshot_ref, "web-1/b1");

        let registry = crate::base::BaseRegistry::default();
        let base = registry
            .register("b1", "web-1", async move { Ok((kind, snapshot_ref)) })
            .await
            .unwrap();
        driver.clone_from_base(&base, "c1").await.unwrap();

        let lines = mock.call_lines();
        assert_eq!(lines[0], "lxc snapshot web-1 b1");
        assert_eq!(lines[1], "lxc copy web-1/b1 c1");
    }

    #[tokio::test]
    async fn file_push_and_pull() {
        let mock = MockExec::new();
        let driver = driver(&mock);
        driver
            .copy_to("web-1", Path::new("/tmp/rexx"), "/usr/local/bin/rexx")
            .await
            .unwrap();
        driver
            .copy_from("web-1", "/etc/os-release", Path::new("/tmp/osr"))
            .await
            .unwrap();
        let lines = mock.call_lines();
        assert_eq!(lines[0], "lxc file push /tmp/rexx web-1/usr/local/bin/rexx");
        assert_eq!(lines[1], "lxc file pull web-1/etc/os-release /tmp/osr");
    }
}
