//! The instance model and the in-process registry tracking it.
//!
//! An instance is one isolation unit (container, VM, microVM) known to the
//! engine. The registry is the engine's view of the world: conflict and
//! capacity checks happen here before a backend is touched, and every
//! successful backend operation updates the registry before its result is
//! returned. Engine state is process-lifetime only.

use crate::{
    driver::DriverKind,
    error::{Error, Result},
};
use derive_builder::Builder;
use getset::{CopyGetters, Getters, Setters};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};
use strum::{AsRefStr, Display, EnumString};

/// Soft default cap on instances per driver.
pub const DEFAULT_MAX_INSTANCES: usize = 20;

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
/// Lifecycle state of an instance.
pub enum Status {
    Created,
    Running,
    Stopped,
    Removed,
    Unknown,
}

impl Status {
    /// State after a `start`. Starting a running instance is idempotent;
    /// anything else off the state machine is a conflict.
    pub fn on_start(self) -> Result<Status> {
        match self {
            Status::Created | Status::Stopped | Status::Running => Ok(Status::Running),
            other => Err(Error::conflict(format!(
                "cannot start an instance in state {}",
                other
            ))),
        }
    }

    /// State after a `stop`. Stopping a stopped instance is idempotent.
    pub fn on_stop(self) -> Result<Status> {
        match self {
            Status::Running | Status::Stopped => Ok(Status::Stopped),
            other => Err(Error::conflict(format!(
                "cannot stop an instance in state {}",
                other
            ))),
        }
    }

    /// `remove` is legal from any non-removed state.
    pub fn on_remove(self) -> Result<Status> {
        match self {
            Status::Removed => Err(Error::conflict("instance is already removed")),
            _ => Ok(Status::Removed),
        }
    }
}

#[derive(Clone, Debug, Eq, Getters, PartialEq, Serialize)]
/// One host→guest bind pair.
pub struct VolumeMount {
    #[get = "pub"]
    host: PathBuf,

    #[get = "pub"]
    guest: String,
}

impl VolumeMount {
    pub fn new(host: PathBuf, guest: String) -> Self {
        Self { host, guest }
    }

    /// Render as the `host:guest` form the backend CLIs take.
    pub fn to_arg(&self) -> String {
        format!("{}:{}", self.host.display(), self.guest)
    }
}

impl FromStr for VolumeMount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((host, guest)) if !host.is_empty() && !guest.is_empty() => Ok(Self {
                host: PathBuf::from(host),
                guest: guest.to_string(),
            }),
            _ => Err(Error::invalid_argument(format!(
                "volume {:?} is not of the form host:guest",
                s
            ))),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Builder, Clone, CopyGetters, Debug, Getters, Serialize, Setters)]
#[builder(default, pattern = "owned", setter(into), build_fn(error = "crate::error::Error"))]
/// One tracked isolation unit.
pub struct Instance {
    #[get = "pub"]
    /// Caller-chosen or auto-generated name, unique per driver.
    name: String,

    #[getset(get = "pub", set = "pub")]
    /// Backend-assigned opaque handle; may equal the name.
    id: String,

    #[get = "pub"]
    /// Origin image or rootfs identifier.
    image: String,

    #[getset(get_copy = "pub", set = "pub")]
    status: Status,

    #[get_copy = "pub"]
    interactive: bool,

    #[get_copy = "pub"]
    /// Normalized memory request in bytes; 0 means unspecified.
    memory_bytes: u64,

    #[get_copy = "pub"]
    /// CPU request; 0 means unspecified.
    cpus: f64,

    #[get = "pub"]
    volumes: Vec<VolumeMount>,

    #[get = "pub"]
    environment: BTreeMap<String, String>,

    #[get_copy = "pub"]
    /// Milliseconds since the Unix epoch.
    created_at: u64,

    #[getset(get_copy = "pub", set = "pub")]
    started_at: Option<u64>,

    #[getset(get_copy = "pub", set = "pub")]
    /// Whether an interpreter binary has been staged into the guest.
    rexx_deployed: bool,

    #[getset(get = "pub", set = "pub")]
    /// Guest path of the staged interpreter binary.
    rexx_path: Option<String>,

    #[get = "pub"]
    /// Name of the base this instance was cloned from, if any.
    base_ref: Option<String>,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: String::new(),
            image: String::new(),
            status: Status::Created,
            interactive: false,
            memory_bytes: 0,
            cpus: 0.0,
            volumes: Vec::new(),
            environment: BTreeMap::new(),
            created_at: now_millis(),
            started_at: None,
            rexx_deployed: false,
            rexx_path: None,
            base_ref: None,
        }
    }
}

impl Instance {
    /// Record the guest path of a staged interpreter.
    pub fn mark_deployed(&mut self, path: impl Into<String>) {
        self.rexx_deployed = true;
        self.rexx_path = Some(path.into());
    }

    /// Forget any staged interpreter.
    pub fn clear_deployed(&mut self) {
        self.rexx_deployed = false;
        self.rexx_path = None;
    }

    pub fn mark_started(&mut self) {
        self.status = Status::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now_millis());
        }
    }

    pub fn rexx_binary_path(&self) -> Option<&Path> {
        self.rexx_path.as_deref().map(Path::new)
    }
}

#[derive(Default)]
struct Table {
    instances: HashMap<String, Instance>,
    counter: u64,
}

/// Per-driver instance tables. All mutations for one driver serialize behind
/// a single lock; the registry exclusively owns the records.
pub struct InstanceRegistry {
    tables: Mutex<HashMap<DriverKind, Table>>,
    max_instances: usize,
}

impl InstanceRegistry {
    pub fn new(max_instances: usize) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            max_instances,
        }
    }

    fn with_table<T>(&self, kind: DriverKind, f: impl FnOnce(&mut Table) -> T) -> T {
        let mut tables = self.tables.lock().expect("instance registry lock");
        f(tables.entry(kind).or_default())
    }

    /// Reserve a slot for a new instance: conflict and capacity checks plus
    /// name generation happen atomically, before the backend is touched. The
    /// placeholder keeps a concurrent `create` with the same name out.
    pub fn begin_create(&self, kind: DriverKind, name: Option<&str>) -> Result<String> {
        self.with_table(kind, |table| {
            if table.instances.len() >= self.max_instances {
                return Err(Error::capacity_exceeded(format!(
                    "instance limit of {} reached for {}",
                    self.max_instances, kind
                )));
            }
            let name = match name {
                Some(name) => {
                    if table.instances.contains_key(name) {
                        return Err(Error::conflict(format!(
                            "instance {:?} already exists",
                            name
                        )));
                    }
                    name.to_string()
                }
                None => loop {
                    table.counter += 1;
                    let candidate = format!("{}-container-{}", kind, table.counter);
                    if !table.instances.contains_key(&candidate) {
                        break candidate;
                    }
                },
            };
            let mut placeholder = Instance::default();
            placeholder.name = name.clone();
            table.instances.insert(name.clone(), placeholder);
            Ok(name)
        })
    }

    /// Replace the placeholder with the real record once the backend
    /// confirmed the create.
    pub fn commit_create(&self, kind: DriverKind, instance: Instance) {
        self.with_table(kind, |table| {
            table
                .instances
                .insert(instance.name().clone(), instance);
        });
    }

    /// Roll a failed create back; the name becomes available again.
    pub fn abort_create(&self, kind: DriverKind, name: &str) {
        self.with_table(kind, |table| {
            table.instances.remove(name);
        });
    }

    pub fn get(&self, kind: DriverKind, name: &str) -> Result<Instance> {
        self.with_table(kind, |table| {
            table.instances.get(name).cloned().ok_or_else(|| {
                Error::not_found(format!("no instance named {:?} for {}", name, kind))
            })
        })
    }

    /// Mutate one instance under the registry lock.
    pub fn update(
        &self,
        kind: DriverKind,
        name: &str,
        f: impl FnOnce(&mut Instance),
    ) -> Result<Instance> {
        self.with_table(kind, |table| match table.instances.get_mut(name) {
            Some(instance) => {
                f(instance);
                Ok(instance.clone())
            }
            None => Err(Error::not_found(format!(
                "no instance named {:?} for {}",
                name, kind
            ))),
        })
    }

    /// Evict an instance; only called after the backend confirmed removal.
    pub fn evict(&self, kind: DriverKind, name: &str) {
        self.with_table(kind, |table| {
            table.instances.remove(name);
        });
    }

    /// Snapshot of all instances for one driver, ordered by name.
    pub fn list(&self, kind: DriverKind) -> Vec<Instance> {
        self.with_table(kind, |table| {
            let mut all: Vec<_> = table.instances.values().cloned().collect();
            all.sort_by(|a, b| a.name().cmp(b.name()));
            all
        })
    }

    pub fn count(&self, kind: DriverKind) -> usize {
        self.with_table(kind, |table| table.instances.len())
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INSTANCES)
    }
}
