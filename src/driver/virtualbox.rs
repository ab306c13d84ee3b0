//! VirtualBox VMs via `VBoxManage`.
//!
//! Instances are clones of a golden VM named by `image=`. Bases are VM
//! snapshots; clones from a base are linked clones, so their disks reference
//! the immutable master disk instead of copying it. `guestcontrol run` has
//! no stdin pipe, which forces the payload layer onto its temp-file path.

use crate::{
    base::{BaseImage, StorageKind},
    driver::{
        classify_failure,
        exec::{Exec, ExecOpts, ExecOutput, InvocationKind},
        BackendInstance, CloneTicket, CreateSpec, Driver, DriverKind, ProbeInfo,
    },
    error::{Error, Result},
    instance::Status,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct VirtualBoxDriver {
    binary: PathBuf,
    exec: Box<dyn Exec>,
}

impl VirtualBoxDriver {
    pub fn new(exec: Box<dyn Exec>) -> Self {
        Self {
            binary: PathBuf::from("VBoxManage"),
            exec,
        }
    }

    async fn run(&self, action: &str, args: Vec<String>, opts: ExecOpts) -> Result<ExecOutput> {
        let output = self.exec.run(&self.binary, &args, opts).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_failure(DriverKind::Virtualbox, action, &output))
        }
    }

    fn split_snapshot_ref(base: &BaseImage) -> Result<(String, String)> {
        match base.snapshot_ref().split_once('/') {
            Some((vm, snapshot)) => Ok((vm.to_string(), snapshot.to_string())),
            None => Err(Error::internal(format!(
                "malformed VirtualBox snapshot reference {:?}",
                base.snapshot_ref()
            ))),
        }
    }
}

#[async_trait]
impl Driver for VirtualBoxDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Virtualbox
    }

    fn stdin_capable(&self) -> bool {
        false
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
        let all = self
            .run(
                "list",
                vec!["list".to_string(), "vms".to_string()],
                ExecOpts::default(),
            )
            .await?;
        let running = self
            .run(
                "list",
                vec!["list".to_string(), "runningvms".to_string()],
                ExecOpts::default(),
            )
            .await?;
        let running_names: Vec<String> = parse_vm_list(&running.stdout)
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        Ok(parse_vm_list(&all.stdout)
            .into_iter()
            .map(|(name, uuid)| {
                let status = if running_names.contains(&name) {
                    Some(Status::Running)
                } else {
                    Some(Status::Stopped)
                };
                BackendInstance {
                    name,
                    id: uuid,
                    status,
                    image: String::new(),
                }
            })
            .collect())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        self.run(
            "create",
            vec![
                "clonevm".to_string(),
                spec.image().clone(),
                "--name".to_string(),
                spec.name().clone(),
                "--register".to_string(),
            ],
            ExecOpts::default(),
        )
        .await?;

        let mut modify = vec!["modifyvm".to_string(), spec.name().clone()];
        if spec.memory_bytes() > 0 {
            modify.push("--memory".to_string());
            modify.push((spec.memory_bytes() / (1024 * 1024)).max(1).to_string());
        }
        if spec.cpus() > 0.0 {
            modify.push("--cpus".to_string());
            modify.push((spec.cpus().ceil() as u64).to_string());
        }
        if modify.len() > 2 {
            self.run("create", modify, ExecOpts::default()).await?;
        }
        Ok(spec.name().clone())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run(
            "start",
            vec![
                "startvm".to_string(),
                name.to_string(),
                "--type".to_string(),
                "headless".to_string(),
            ],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run(
            "stop",
            vec![
                "controlvm".to_string(),
                name.to_string(),
                "poweroff".to_string(),
            ],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<()> {
        self.run(
            "remove",
            vec![
                "unregistervm".to_string(),
                name.to_string(),
                "--delete".to_string(),
            ],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }

    async fn exec(&self, name: &str, command: &[String], opts: ExecOpts) -> Result<ExecOutput> {
        let mut args = vec![
            "guestcontrol".to_string(),
            name.to_string(),
            "run".to_string(),
            "--exe".to_string(),
            command
                .first()
                .cloned()
                .unwrap_or_else(|| "/bin/sh".to_string()),
            "--wait-stdout".to_string(),
            "--wait-stderr".to_string(),
            "--".to_string(),
        ];
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
                "guestcontrol".to_string(),
                name.to_string(),
                "copyto".to_string(),
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
                "guestcontrol".to_string(),
                name.to_string(),
                "copyfrom".to_string(),
                remote.to_string(),
                local.display().to_string(),
            ],
            opts,
        )
        .await
        .map(|_| ())
    }

    async fn snapshot_base(&self, source: &str, base_name: &str) -> Result<(StorageKind, String)> {
        self.run(
            "register_base",
            vec![
                "snapshot".to_string(),
                source.to_string(),
                "take".to_string(),
                base_name.to_string(),
            ],
            ExecOpts::default(),
        )
        .await?;
        Ok((StorageKind::Linked, format!("{}/{}", source, base_name)))
    }

    async fn clone_from_base(&self, base: &BaseImage, name: &str) -> Result<CloneTicket> {
        let (vm, snapshot) = Self::split_snapshot_ref(base)?;
        self.run(
            "clone_from_base",
            vec![
                "clonevm".to_string(),
                vm,
                "--snapshot".to_string(),
                snapshot,
                "--options".to_string(),
                "link".to_string(),
                "--name".to_string(),
                name.to_string(),
                "--register".to_string(),
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
        let (vm, snapshot) = Self::split_snapshot_ref(base)?;
        self.run(
            "delete_base",
            vec![
                "snapshot".to_string(),
                vm,
                "delete".to_string(),
                snapshot,
            ],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }
}

/// `VBoxManage list vms` prints `"name" {uuid}` per line.
fn parse_vm_list(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let name = line.split('"').nth(1)?;
            let uuid = line
                .split('{')
                .nth(1)
                .and_then(|rest| rest.strip_suffix('}'))
                .unwrap_or_default();
            Some((name.to_string(), uuid.to_string()))
        })
        .collect()
}
