//! Proxmox LXC containers via `pct`.
//!
//! `pct` addresses containers by numeric VMID; the driver resolves names
//! through `pct list` and allocates the next free VMID on create. Bases are
//! container snapshots, cloned with `pct clone --snapname`, which is
//! copy-on-write on snapshot-capable storage.

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

/// VMIDs below 100 are reserved by Proxmox.
const FIRST_VMID: u64 = 100;

#[derive(Debug)]
pub struct ProxmoxDriver {
    binary: PathBuf,
    exec: Box<dyn Exec>,
}

struct PctRow {
    vmid: u64,
    status: String,
    name: String,
}

impl ProxmoxDriver {
    pub fn new(exec: Box<dyn Exec>) -> Self {
        Self {
            binary: PathBuf::from("pct"),
            exec,
        }
    }

    async fn run(&self, action: &str, args: Vec<String>, opts: ExecOpts) -> Result<ExecOutput> {
        let output = self.exec.run(&self.binary, &args, opts).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_failure(DriverKind::Proxmox, action, &output))
        }
    }

    async fn rows(&self) -> Result<Vec<PctRow>> {
        let output = self
            .run("list", vec!["list".to_string()], ExecOpts::default())
            .await?;
        Ok(parse_pct_list(&output.stdout))
    }

    async fn resolve(&self, name: &str) -> Result<u64> {
        self.rows()
            .await?
            .into_iter()
            .find(|row| row.name == name)
            .map(|row| row.vmid)
            .ok_or_else(|| Error::not_found(format!("no proxmox container named {:?}", name)))
    }

    async fn next_vmid(&self) -> Result<u64> {
        let max = self.rows().await?.iter().map(|row| row.vmid).max();
        Ok(max.map(|m| m + 1).unwrap_or(FIRST_VMID))
    }
}

/// `pct list` prints `VMID Status Lock Name` columns under a header.
fn parse_pct_list(stdout: &str) -> Vec<PctRow> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let vmid = fields.next()?.parse().ok()?;
            let status = fields.next()?.to_string();
            let name = fields.last()?.to_string();
            Some(PctRow { vmid, status, name })
        })
        .collect()
}

fn status_of(status: &str) -> Option<Status> {
    match status.to_lowercase().as_str() {
        "running" => Some(Status::Running),
        "stopped" => Some(Status::Stopped),
        _ => None,
    }
}

#[async_trait]
impl Driver for ProxmoxDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Proxmox
    }

    async fn probe(&self) -> Result<ProbeInfo> {
        match which::which(&self.binary) {
            Ok(path) => Ok(ProbeInfo {
                available: true,
                version: Some(path.display().to_string()),
            }),
            Err(_) => Ok(ProbeInfo {
                available: false,
                version: None,
            }),
        }
    }

    async fn list(&self) -> Result<Vec<BackendInstance>> {
        Ok(self
            .rows()
            .await?
            .into_iter()
            .map(|row| BackendInstance {
                name: row.name,
                id: row.vmid.to_string(),
                status: status_of(&row.status),
                image: String::new(),
            })
            .collect())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        let vmid = self.next_vmid().await?;
        let mut args = vec![
            "create".to_string(),
            vmid.to_string(),
            spec.image().clone(),
            "--hostname".to_string(),
            spec.name().clone(),
        ];
        if spec.memory_bytes() > 0 {
            args.push("--memory".to_string());
            args.push((spec.memory_bytes() / (1024 * 1024)).max(1).to_string());
        }
        if spec.cpus() > 0.0 {
            args.push("--cores".to_string());
            args.push((spec.cpus().ceil() as u64).to_string());
        }
        for (index, volume) in spec.volumes().iter().enumerate() {
            args.push(format!("--mp{}", index));
            args.push(format!(
                "{},mp={}",
                volume.host().display(),
                volume.guest()
            ));
        }
        if spec.privileged() {
            args.push("--unprivileged".to_string());
            args.push("0".to_string());
        }
        self.run("create", args, ExecOpts::default()).await?;
        Ok(vmid.to_string())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let vmid = self.resolve(name).await?;
        self.run(
            "start",
            vec!["start".to_string(), vmid.to_string()],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let vmid = self.resolve(name).await?;
        self.run(
            "stop",
            vec!["stop".to_string(), vmid.to_string()],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let vmid = self.resolve(name).await?;
        let mut args = vec!["destroy".to_string(), vmid.to_string()];
        if force {
            args.push("--force".to_string());
        }
        self.run("remove", args, ExecOpts::default()).await.map(|_| ())
    }

    async fn exec(&self, name: &str, command: &[String], opts: ExecOpts) -> Result<ExecOutput> {
        let vmid = self.resolve(name).await?;
        let mut args = vec!["exec".to_string(), vmid.to_string(), "--".to_string()];
        args.extend(command.iter().cloned());
        self.exec.run(&self.binary, &args, opts).await
    }

    async fn copy_to(&self, name: &str, local: &Path, remote: &str) -> Result<()> {
        let vmid = self.resolve(name).await?;
        let opts = ExecOpts {
            kind: Some(InvocationKind::Transfer),
            ..ExecOpts::default()
        };
        self.run(
            "copy_to",
            vec![
                "push".to_string(),
                vmid.to_string(),
                local.display().to_string(),
                remote.to_string(),
            ],
            opts,
        )
        .await
        .map(|_| ())
    }

    async fn copy_from(&self, name: &str, remote: &str, local: &Path) -> Result<()> {
        let vmid = self.resolve(name).await?;
        let opts = ExecOpts {
            kind: Some(InvocationKind::Transfer),
            ..ExecOpts::default()
        };
        self.run(
            "copy_from",
            vec![
                "pull".to_string(),
                vmid.to_string(),
                remote.to_string(),
                local.display().to_string(),
            ],
            opts,
        )
        .await
        .map(|_| ())
    }

    async fn snapshot_base(&self, source: &str, base_name: &str) -> Result<(StorageKind, String)> {
        let vmid = self.resolve(source).await?;
        self.run(
            "register_base",
            vec![
                "snapshot".to_string(),
                vmid.to_string(),
                base_name.to_string(),
            ],
            ExecOpts::default(),
        )
        .await?;
        Ok((StorageKind::Template, format!("{}@{}", vmid, base_name)))
    }

    async fn clone_from_base(&self, base: &BaseImage, name: &str) -> Result<CloneTicket> {
        let (vmid, snapname) = base
            .snapshot_ref()
            .split_once('@')
            .ok_or_else(|| {
                Error::internal(format!(
                    "malformed proxmox snapshot reference {:?}",
                    base.snapshot_ref()
                ))
            })?;
        let new_vmid = self.next_vmid().await?;
        self.run(
            "clone_from_base",
            vec![
                "clone".to_string(),
                vmid.to_string(),
                new_vmid.to_string(),
                "--snapname".to_string(),
                snapname.to_string(),
                "--hostname".to_string(),
                name.to_string(),
            ],
            ExecOpts::default(),
        )
        .await?;
        Ok(CloneTicket {
            id: new_vmid.to_string(),
            bytes_consumed: None,
        })
    }

    async fn delete_base_snapshot(&self, base: &BaseImage) -> Result<()> {
        let (vmid, snapname) = base
            .snapshot_ref()
            .split_once('@')
            .ok_or_else(|| {
                Error::internal(format!(
                    "malformed proxmox snapshot reference {:?}",
                    base.snapshot_ref()
                ))
            })?;
        self.run(
            "delete_base",
            vec![
                "delsnapshot".to_string(),
                vmid.to_string(),
                snapname.to_string(),
            ],
            ExecOpts::default(),
        )
        .await
        .map(|_| ())
    }
}
