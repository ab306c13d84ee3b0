//! The abstract backend contract and the registry of concrete drivers.
//!
//! A driver translates the engine's uniform operations into invocations of
//! one backend CLI. Drivers are independent structs conforming to the
//! `Driver` trait; nothing backend-specific leaks above it. Capabilities a
//! backend cannot express return `unsupported` from the default trait
//! bodies.

pub mod exec;
pub mod firecracker;
pub mod lxd;
pub mod nspawn;
pub mod oci;
pub mod proxmox;
pub mod qemu;
pub mod remote;
pub mod virtualbox;

use crate::{
    base::{BaseImage, StorageKind},
    error::{Error, Result},
    instance::{Status, VolumeMount},
};
use async_trait::async_trait;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::{info, warn};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex},
};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::sync::OnceCell;

pub use exec::{
    cancellation, CancelHandle, CancelToken, DefaultExec, Exec, ExecOpts, ExecOutput,
    InvocationKind,
};

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
/// Addressable backend targets.
pub enum DriverKind {
    Docker,
    Podman,
    Nspawn,
    Lxd,
    Qemu,
    Firecracker,
    Virtualbox,
    Proxmox,
    RemoteDocker,
}

impl DriverKind {
    /// Targets reached through the SSH proxy.
    pub fn is_remote(self) -> bool {
        matches!(self, DriverKind::RemoteDocker)
    }

    /// The driver that runs on the far side of the proxy.
    pub fn local_equivalent(self) -> DriverKind {
        match self {
            DriverKind::RemoteDocker => DriverKind::Docker,
            other => other,
        }
    }

    /// Case-insensitive lookup of an ADDRESS target name.
    pub fn lookup(target: &str) -> Result<Self> {
        Self::from_str(target.trim()).map_err(|_| {
            Error::invalid_argument(format!(
                "unknown target {:?}; known targets: {}",
                target,
                Self::iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }
}

#[derive(Builder, Clone, Debug, Default, Getters, CopyGetters)]
#[builder(default, pattern = "owned", setter(into), build_fn(error = "crate::error::Error"))]
/// Everything a driver needs to create an instance.
pub struct CreateSpec {
    #[get = "pub"]
    name: String,

    #[get = "pub"]
    image: String,

    #[get_copy = "pub"]
    /// Normalized bytes; 0 means unspecified.
    memory_bytes: u64,

    #[get_copy = "pub"]
    /// 0 means unspecified.
    cpus: f64,

    #[get = "pub"]
    volumes: Vec<VolumeMount>,

    #[get = "pub"]
    environment: BTreeMap<String, String>,

    #[get_copy = "pub"]
    interactive: bool,

    #[get_copy = "pub"]
    privileged: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
/// Result of probing a backend tool.
pub struct ProbeInfo {
    pub available: bool,
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
/// One instance as the backend reports it, for reconciliation.
pub struct BackendInstance {
    pub name: String,
    pub id: String,
    pub status: Option<Status>,
    pub image: String,
}

#[derive(Clone, Debug, Default)]
/// What a completed clone hands back to the bookkeeping layer.
pub struct CloneTicket {
    /// Backend handle of the new instance.
    pub id: String,

    /// Storage consumed by the clone, when the backend can report it.
    pub bytes_consumed: Option<u64>,
}

fn unsupported(kind: DriverKind, op: &str) -> Error {
    Error::unsupported(format!("{} does not support {}", kind, op))
}

/// Map a failed backend invocation onto the error taxonomy, keeping the raw
/// output for diagnostics.
pub(crate) fn classify_failure(kind: DriverKind, action: &str, output: &ExecOutput) -> Error {
    use crate::error::ErrorKind;

    let stderr = output.stderr.to_lowercase();
    let class = if stderr.contains("no such")
        || stderr.contains("not found")
        || stderr.contains("does not exist")
        || stderr.contains("unknown machine")
    {
        ErrorKind::NotFound
    } else if stderr.contains("already exists")
        || stderr.contains("already in use")
        || stderr.contains("name is in use")
        || stderr.contains("conflict")
    {
        ErrorKind::Conflict
    } else if stderr.contains("cannot connect") || stderr.contains("daemon") {
        ErrorKind::BackendUnavailable
    } else {
        ErrorKind::IoError
    };

    let reason = output
        .stderr
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no error output")
        .trim();
    Error::new(
        class,
        format!("{} {} failed (exit {}): {}", kind, action, output.exit_code, reason),
    )
    .with_output(output.stdout.clone(), output.stderr.clone())
}

#[async_trait]
/// The capability set every backend driver exposes. Operations the backend
/// cannot express keep the default body and report `unsupported`.
pub trait Driver: Debug + Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Whether the backend's exec primitive accepts piped stdin. Drivers
    /// without it force the payload layer onto its temp-file fallback.
    fn stdin_capable(&self) -> bool {
        true
    }

    async fn probe(&self) -> Result<ProbeInfo>;

    async fn list(&self) -> Result<Vec<BackendInstance>> {
        Err(unsupported(self.kind(), "list"))
    }

    /// Create an instance and return the backend-assigned handle.
    async fn create(&self, _spec: &CreateSpec) -> Result<String> {
        Err(unsupported(self.kind(), "create"))
    }

    async fn start(&self, _name: &str) -> Result<()> {
        Err(unsupported(self.kind(), "start"))
    }

    async fn stop(&self, _name: &str) -> Result<()> {
        Err(unsupported(self.kind(), "stop"))
    }

    async fn remove(&self, _name: &str, _force: bool) -> Result<()> {
        Err(unsupported(self.kind(), "remove"))
    }

    async fn exec(&self, _name: &str, _command: &[String], _opts: ExecOpts) -> Result<ExecOutput> {
        Err(unsupported(self.kind(), "exec"))
    }

    async fn copy_to(&self, _name: &str, _local: &Path, _remote: &str) -> Result<()> {
        Err(unsupported(self.kind(), "copy_to"))
    }

    async fn copy_from(&self, _name: &str, _remote: &str, _local: &Path) -> Result<()> {
        Err(unsupported(self.kind(), "copy_from"))
    }

    async fn logs(&self, _name: &str, _lines: usize) -> Result<String> {
        Err(unsupported(self.kind(), "logs"))
    }

    /// Take a snapshot of `source` suitable for cheap cloning and return the
    /// storage kind plus the backend handle of the snapshot.
    async fn snapshot_base(&self, _source: &str, _base_name: &str) -> Result<(StorageKind, String)> {
        Err(unsupported(self.kind(), "register_base"))
    }

    /// Create a new instance whose storage references the base's snapshot.
    /// Must not copy bulk bytes on the happy path.
    async fn clone_from_base(&self, _base: &BaseImage, _name: &str) -> Result<CloneTicket> {
        Err(unsupported(self.kind(), "clone_from_base"))
    }

    async fn delete_base_snapshot(&self, _base: &BaseImage) -> Result<()> {
        Err(unsupported(self.kind(), "delete_base"))
    }
}

/// Construct the concrete driver for `kind` over the given execution seam.
/// The remote proxy reuses this with an SSH-backed seam.
pub(crate) fn build_with_exec(kind: DriverKind, exec: Box<dyn Exec>) -> Result<Arc<dyn Driver>> {
    Ok(match kind {
        DriverKind::Docker | DriverKind::Podman => Arc::new(oci::OciDriver::new(kind, exec)?),
        DriverKind::Nspawn => Arc::new(nspawn::NspawnDriver::new(exec)),
        DriverKind::Lxd => Arc::new(lxd::LxdDriver::new(exec)),
        DriverKind::Qemu => Arc::new(qemu::QemuDriver::new(exec)),
        DriverKind::Firecracker => Arc::new(firecracker::FirecrackerDriver::new(exec)),
        DriverKind::Virtualbox => Arc::new(virtualbox::VirtualBoxDriver::new(exec)),
        DriverKind::Proxmox => Arc::new(proxmox::ProxmoxDriver::new(exec)),
        DriverKind::RemoteDocker => {
            return Err(Error::invalid_argument(
                "remote targets need host= and are constructed per command",
            ))
        }
    })
}

fn build(kind: DriverKind) -> Result<Arc<dyn Driver>> {
    build_with_exec(kind, Box::new(DefaultExec))
}

enum Slot {
    Ready(Arc<dyn Driver>),
    Poisoned(String),
}

/// Lazily constructs and caches one driver per local target. The first use
/// probes the backend; a failing probe poisons the slot for the lifetime of
/// the registry.
#[derive(Default)]
pub struct DriverRegistry {
    slots: Mutex<HashMap<DriverKind, Arc<OnceCell<Slot>>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, kind: DriverKind) -> Arc<OnceCell<Slot>> {
        let mut slots = self.slots.lock().expect("driver registry lock");
        Arc::clone(slots.entry(kind).or_insert_with(|| Arc::new(OnceCell::new())))
    }

    /// Pre-fill a slot, bypassing construction and probe. Used by tests and
    /// by embedders that bring their own driver.
    pub fn inject(&self, kind: DriverKind, driver: Arc<dyn Driver>) {
        let cell = self.cell(kind);
        let _ = cell.set(Slot::Ready(driver));
    }

    /// Fetch the driver for a local target, constructing and probing it on
    /// first use.
    pub async fn driver(&self, kind: DriverKind) -> Result<Arc<dyn Driver>> {
        let cell = self.cell(kind);
        let slot = cell
            .get_or_init(|| async {
                match Self::construct(kind).await {
                    Ok(driver) => Slot::Ready(driver),
                    Err(err) => {
                        warn!("Driver {} poisoned: {}", kind, err);
                        Slot::Poisoned(err.to_string())
                    }
                }
            })
            .await;
        match slot {
            Slot::Ready(driver) => Ok(Arc::clone(driver)),
            Slot::Poisoned(message) => Err(Error::backend_unavailable(format!(
                "driver {} is unavailable: {}",
                kind, message
            ))),
        }
    }

    async fn construct(kind: DriverKind) -> Result<Arc<dyn Driver>> {
        let driver = build(kind)?;
        let probe = driver.probe().await?;
        if !probe.available {
            return Err(Error::backend_unavailable(format!(
                "{} backend tooling not found",
                kind
            )));
        }
        info!(
            "Driver {} ready (version {})",
            kind,
            probe.version.as_deref().unwrap_or("unknown")
        );
        Ok(driver)
    }
}
