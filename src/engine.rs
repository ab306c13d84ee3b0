//! Command dispatch: the engine behind every ADDRESS target.
//!
//! One entry point takes a textual command line, interpolates variables,
//! parses it into a typed operation, runs it through the security gate,
//! routes it to the right driver, and wraps whatever happened into a uniform
//! result object. Dispatch never propagates a failure: errors, including
//! contained panics, come back as structured results.

use crate::{
    base::BaseRegistry,
    checkpoint::CheckpointRecord,
    command::{self, Command, DelimiterStyle},
    driver::{
        remote::{RemoteDriver, SshConfig},
        CancelToken, CreateSpecBuilder, Driver, DriverKind, DriverRegistry, ExecOpts,
    },
    error::{Error, ErrorKind, Result},
    instance::{Instance, InstanceBuilder, InstanceRegistry, Status, VolumeMount},
    lock_map::LockMap,
    payload,
    security::{Security, SecurityPolicy},
};
use getset::{CopyGetters, Getters};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    path::PathBuf,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

/// Aborts the spawned operation when the dispatch future is dropped, so an
/// abandoned caller does not leave a backend invocation running.
struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = std::result::Result<T, tokio::task::JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

const DEFAULT_LOG_LINES: usize = 50;
const MAX_LOG_LINES: usize = 10_000;

#[derive(Clone, Debug, Getters, CopyGetters)]
/// Tuning knobs that are not security policy.
pub struct EngineOptions {
    #[get_copy = "pub"]
    /// Soft instance cap per driver.
    pub max_instances: usize,

    #[get = "pub"]
    /// Default guest path for the staged interpreter.
    pub rexx_path: String,

    #[get_copy = "pub"]
    /// Variable reference style for interpolation.
    pub delimiter: DelimiterStyle,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_instances: crate::instance::DEFAULT_MAX_INSTANCES,
            rexx_path: payload::DEFAULT_REXX_PATH.to_string(),
            delimiter: DelimiterStyle::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
/// The uniform result every dispatched command returns.
pub struct DispatchResult {
    pub success: bool,
    pub operation: String,
    /// Short human string; the error message on failure.
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DispatchResult {
    fn ok(operation: &str, output: impl Into<String>) -> Self {
        Self {
            success: true,
            operation: operation.to_string(),
            output: output.into(),
            error: None,
            error_kind: None,
            fields: Map::new(),
        }
    }

    fn fail(operation: &str, err: &Error) -> Self {
        let mut result = Self {
            success: false,
            operation: operation.to_string(),
            output: err.message().to_string(),
            error: Some(err.message().to_string()),
            error_kind: Some(err.kind()),
            fields: Map::new(),
        };
        // partial output captured before a timeout stays visible
        if let Some(stdout) = err.stdout() {
            result.fields.insert("stdout".to_string(), json!(stdout));
        }
        if let Some(stderr) = err.stderr() {
            result.fields.insert("stderr".to_string(), json!(stderr));
        }
        result
    }

    fn with(mut self, key: &str, value: impl Serialize) -> Self {
        self.fields.insert(
            key.to_string(),
            serde_json::to_value(value).unwrap_or(Value::Null),
        );
        self
    }
}

/// The typed form of one parsed command. Unknown operations never get this
/// far; every variant routing is exhaustive.
#[derive(Debug)]
enum Operation {
    Status,
    List,
    Create {
        name: Option<String>,
        image: String,
        memory_bytes: u64,
        cpus: f64,
        volumes: Vec<VolumeMount>,
        environment: BTreeMap<String, String>,
        interactive: bool,
        privileged: bool,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Remove {
        name: String,
        force: bool,
    },
    Exec {
        name: String,
        command: String,
        timeout: Option<Duration>,
    },
    CopyTo {
        name: String,
        local: PathBuf,
        remote: String,
    },
    CopyFrom {
        name: String,
        remote: String,
        local: PathBuf,
    },
    Logs {
        name: String,
        lines: usize,
    },
    RegisterBase {
        base: String,
        source: String,
        auto_stop: bool,
    },
    CloneFromBase {
        base: String,
        name: String,
    },
    ListBases,
    DeleteBase {
        base: String,
        force: bool,
    },
    DeployRexx {
        name: String,
        binary: PathBuf,
        target: Option<String>,
    },
    ExecuteRexx {
        name: String,
        script: Option<String>,
        script_file: Option<String>,
        timeout: Option<Duration>,
        progress: bool,
    },
    CleanupRexx {
        name: String,
    },
    SecurityAudit,
}

fn required<'c>(cmd: &'c Command, keys: &[&str]) -> Result<&'c str> {
    for key in keys {
        if let Some(value) = cmd.get(key) {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }
    Err(Error::invalid_argument(format!(
        "{} requires the {}= parameter",
        cmd.operation,
        keys.join("= or ")
    )))
}

fn instance_name(cmd: &Command) -> Result<String> {
    required(cmd, &["name", "container"]).map(str::to_string)
}

fn parse_timeout(cmd: &Command) -> Result<Option<Duration>> {
    match cmd.get("timeout") {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| {
                Error::invalid_argument(format!("timeout {:?} is not a millisecond count", raw))
            }),
    }
}

fn parse_volumes(cmd: &Command) -> Result<Vec<VolumeMount>> {
    let mut volumes = Vec::new();
    if let Some(raw) = cmd.get("volumes") {
        for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
            volumes.push(part.trim().parse()?);
        }
    }
    if let Some(raw) = cmd.get("volume") {
        volumes.push(raw.parse()?);
    }
    Ok(volumes)
}

fn parse_environment(cmd: &Command) -> Result<BTreeMap<String, String>> {
    let mut environment = BTreeMap::new();
    let mut insert = |pair: &str| -> Result<()> {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                environment.insert(key.trim().to_string(), value.to_string());
                Ok(())
            }
            _ => Err(Error::invalid_argument(format!(
                "environment entry {:?} is not KEY=VALUE",
                pair
            ))),
        }
    };
    if let Some(raw) = cmd.get("environment") {
        for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
            insert(part.trim())?;
        }
    }
    if let Some(raw) = cmd.get("env") {
        insert(raw)?;
    }
    Ok(environment)
}

impl Operation {
    fn from_command(cmd: &Command) -> Result<Self> {
        let op = cmd.operation.to_lowercase();
        Ok(match op.as_str() {
            "status" | "probe" => Operation::Status,
            "list" => Operation::List,
            "create" => Operation::Create {
                name: cmd.get("name").map(str::to_string),
                image: required(cmd, &["image"])?.to_string(),
                memory_bytes: cmd
                    .get("memory")
                    .map(command::parse_memory)
                    .unwrap_or(0),
                cpus: cmd
                    .get("cpus")
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0.0),
                volumes: parse_volumes(cmd)?,
                environment: parse_environment(cmd)?,
                interactive: cmd.flag("interactive"),
                privileged: cmd.flag("privileged"),
            },
            "start" => Operation::Start {
                name: instance_name(cmd)?,
            },
            "stop" => Operation::Stop {
                name: instance_name(cmd)?,
            },
            "remove" | "destroy" => Operation::Remove {
                name: instance_name(cmd)?,
                force: cmd.flag("force"),
            },
            "exec" | "execute" => Operation::Exec {
                name: instance_name(cmd)?,
                command: required(cmd, &["command"])?.to_string(),
                timeout: parse_timeout(cmd)?,
            },
            "copy_to" => Operation::CopyTo {
                name: instance_name(cmd)?,
                local: PathBuf::from(required(cmd, &["local"])?),
                remote: required(cmd, &["remote"])?.to_string(),
            },
            "copy_from" => Operation::CopyFrom {
                name: instance_name(cmd)?,
                remote: required(cmd, &["remote"])?.to_string(),
                local: PathBuf::from(required(cmd, &["local"])?),
            },
            "logs" => Operation::Logs {
                name: instance_name(cmd)?,
                lines: cmd
                    .get("lines")
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(DEFAULT_LOG_LINES)
                    .clamp(1, MAX_LOG_LINES),
            },
            "register_base" => Operation::RegisterBase {
                base: required(cmd, &["name", "base"])?.to_string(),
                source: required(cmd, &["source", "source_instance", "source_image"])?
                    .to_string(),
                auto_stop: cmd.flag("auto_stop"),
            },
            "clone_from_base" => Operation::CloneFromBase {
                base: required(cmd, &["base"])?.to_string(),
                name: required(cmd, &["name"])?.to_string(),
            },
            "list_bases" => Operation::ListBases,
            "delete_base" => Operation::DeleteBase {
                base: required(cmd, &["name", "base"])?.to_string(),
                force: cmd.flag("force"),
            },
            "deploy_rexx" => Operation::DeployRexx {
                name: instance_name(cmd)?,
                binary: PathBuf::from(required(cmd, &["rexx_binary", "binary"])?),
                target: cmd.get("target_path").map(str::to_string),
            },
            "execute_rexx" => Operation::ExecuteRexx {
                name: instance_name(cmd)?,
                script: cmd.get("script").map(str::to_string),
                script_file: cmd.get("script_file").map(str::to_string),
                timeout: parse_timeout(cmd)?,
                progress: cmd.flag("progress_callback"),
            },
            "cleanup_rexx" => Operation::CleanupRexx {
                name: instance_name(cmd)?,
            },
            "security_audit" => Operation::SecurityAudit,
            "" => return Err(Error::invalid_argument("empty command")),
            unknown => {
                return Err(Error::invalid_argument(format!(
                    "unknown operation {:?}",
                    unknown
                )))
            }
        })
    }
}

struct EngineInner {
    security: Security,
    drivers: DriverRegistry,
    instances: InstanceRegistry,
    bases: Mutex<HashMap<DriverKind, Arc<BaseRegistry>>>,
    locks: LockMap<(DriverKind, String)>,
    options: EngineOptions,
}

#[derive(Clone)]
/// The ADDRESS handler. Cheap to clone; all state is shared.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(policy: SecurityPolicy, options: EngineOptions) -> Result<Self> {
        let security = Security::new(policy)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                security,
                drivers: DriverRegistry::new(),
                instances: InstanceRegistry::new(options.max_instances),
                bases: Mutex::new(HashMap::new()),
                locks: LockMap::default(),
                options,
            }),
        })
    }

    /// Swap in a driver, bypassing construction and probe.
    pub fn inject_driver(&self, kind: DriverKind, driver: Arc<dyn Driver>) {
        self.inner.drivers.inject(kind, driver);
    }

    pub fn security(&self) -> &Security {
        &self.inner.security
    }

    /// Dispatch one command line with no variable pool, progress channel or
    /// cancellation token.
    pub async fn dispatch(&self, target: &str, line: &str) -> DispatchResult {
        self.dispatch_with(target, line, &HashMap::new(), None, None)
            .await
    }

    /// Full-form dispatch: interpolate against `variables`, parse, gate,
    /// route, and return the uniform result. Checkpoints stream to
    /// `progress` when the command asks for them; firing `cancel` stops the
    /// backend invocation (SIGTERM, then SIGKILL) and yields a `cancelled`
    /// failure.
    pub async fn dispatch_with(
        &self,
        target: &str,
        line: &str,
        variables: &HashMap<String, String>,
        progress: Option<mpsc::Sender<CheckpointRecord>>,
        cancel: Option<CancelToken>,
    ) -> DispatchResult {
        let interpolated = command::interpolate(line, variables, self.inner.options.delimiter());
        let cmd = command::parse(&interpolated);
        let op_name = cmd.operation.to_lowercase();
        let label = if op_name.is_empty() {
            "dispatch"
        } else {
            op_name.as_str()
        };

        let engine = self.clone();
        let target = target.to_string();
        let label_owned = label.to_string();
        // the op runs in its own task so a panic is contained to the command;
        // dropping this future aborts the task (and its children)
        let handle = AbortOnDrop(tokio::spawn(async move {
            engine.run(&target, cmd, progress, cancel).await
        }));
        match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                warn!("Operation {} panicked: {}", label_owned, join_err);
                DispatchResult::fail(
                    &label_owned,
                    &Error::internal(format!("operation {} failed internally", label_owned)),
                )
            }
        }
    }

    async fn run(
        &self,
        target: &str,
        cmd: Command,
        progress: Option<mpsc::Sender<CheckpointRecord>>,
        cancel: Option<CancelToken>,
    ) -> DispatchResult {
        let op_name = cmd.operation.to_lowercase();
        let label = if op_name.is_empty() {
            "dispatch".to_string()
        } else {
            op_name
        };

        if let Some(token) = &cancel {
            if token.is_cancelled() {
                return DispatchResult::fail(
                    &label,
                    &Error::cancelled("operation cancelled before dispatch"),
                );
            }
        }

        let kind = match DriverKind::lookup(target) {
            Ok(kind) => kind,
            Err(err) => return DispatchResult::fail(&label, &err),
        };
        let operation = match Operation::from_command(&cmd) {
            Ok(operation) => operation,
            Err(err) => return DispatchResult::fail(&label, &err),
        };
        debug!("Dispatching {} against {}", label, kind);

        let driver = match self.driver_for(kind, &cmd).await {
            Ok(driver) => driver,
            Err(err) => return DispatchResult::fail(&label, &err),
        };

        match self
            .route(kind, driver.as_ref(), operation, progress, cancel)
            .await
        {
            Ok(result) => result,
            Err(err) => DispatchResult::fail(&label, &err),
        }
    }

    /// Pick the driver: cached local drivers from the registry, a fresh SSH
    /// proxy whenever `host=` is in play.
    async fn driver_for(&self, kind: DriverKind, cmd: &Command) -> Result<Arc<dyn Driver>> {
        match cmd.get("host") {
            Some(host) => {
                let config = SshConfig::new(host)
                    .user(cmd.get("user").map(str::to_string))
                    .sudo(cmd.get("sudo").map(|v| v == "true").unwrap_or(true));
                Ok(Arc::new(RemoteDriver::new(kind, config)?))
            }
            None if kind.is_remote() => Err(Error::invalid_argument(format!(
                "target {} requires host=",
                kind
            ))),
            None => self.inner.drivers.driver(kind).await,
        }
    }

    fn bases(&self, kind: DriverKind) -> Arc<BaseRegistry> {
        let mut bases = self.inner.bases.lock().expect("base table lock");
        Arc::clone(bases.entry(kind).or_default())
    }

    /// Best-effort resync of one instance's registry state with what the
    /// backend reports, used after a failed mutation.
    async fn reconcile(&self, kind: DriverKind, driver: &dyn Driver, name: &str) {
        if let Ok(listed) = driver.list().await {
            if let Some(backend) = listed.into_iter().find(|i| i.name == name) {
                if let Some(status) = backend.status {
                    let _ = self.inner.instances.update(kind, name, |instance| {
                        instance.set_status(status);
                    });
                }
            }
        }
    }

    fn require_running(instance: &Instance, what: &str) -> Result<()> {
        if instance.status() == Status::Running {
            Ok(())
        } else {
            Err(Error::conflict(format!(
                "{} requires a running instance, but {:?} is {}",
                what,
                instance.name(),
                instance.status()
            )))
        }
    }

    async fn route(
        &self,
        kind: DriverKind,
        driver: &dyn Driver,
        operation: Operation,
        progress: Option<mpsc::Sender<CheckpointRecord>>,
        cancel: Option<CancelToken>,
    ) -> Result<DispatchResult> {
        let instances = &self.inner.instances;
        let security = &self.inner.security;

        match operation {
            Operation::Status => {
                let probe = driver.probe().await?;
                Ok(DispatchResult::ok(
                    "status",
                    format!(
                        "{} is {}",
                        kind,
                        if probe.available { "available" } else { "unavailable" }
                    ),
                )
                .with("available", probe.available)
                .with("version", probe.version)
                .with("instances", instances.count(kind)))
            }

            Operation::List => {
                let listed = instances.list(kind);
                let count = listed.len();
                Ok(
                    DispatchResult::ok("list", format!("{} instance(s)", count))
                        .with("instances", &listed)
                        .with("count", count),
                )
            }

            Operation::Create {
                name,
                image,
                memory_bytes,
                cpus,
                volumes,
                environment,
                interactive,
                privileged,
            } => {
                security.check_image(&image)?;
                security.check_memory(memory_bytes)?;
                if cpus > 0.0 {
                    security.check_cpus(cpus)?;
                }
                security.check_privileged(privileged)?;
                security.check_volumes(&volumes)?;

                let name = instances.begin_create(kind, name.as_deref())?;
                let _guard = self.inner.locks.lock((kind, name.clone())).await;

                let spec = CreateSpecBuilder::default()
                    .name(name.clone())
                    .image(image.clone())
                    .memory_bytes(memory_bytes)
                    .cpus(cpus)
                    .volumes(volumes.clone())
                    .environment(environment.clone())
                    .interactive(interactive)
                    .privileged(privileged)
                    .build()?;

                let id = match driver.create(&spec).await {
                    Ok(id) => id,
                    Err(err) => {
                        instances.abort_create(kind, &name);
                        return Err(err);
                    }
                };

                let instance = InstanceBuilder::default()
                    .name(name.clone())
                    .id(id.clone())
                    .image(image)
                    .status(Status::Created)
                    .interactive(interactive)
                    .memory_bytes(memory_bytes)
                    .cpus(cpus)
                    .volumes(volumes)
                    .environment(environment)
                    .build()?;
                instances.commit_create(kind, instance);

                Ok(
                    DispatchResult::ok("create", format!("Created container {}", name))
                        .with("container", &name)
                        .with("id", id)
                        .with("status", Status::Created),
                )
            }

            Operation::Start { name } => {
                let _guard = self.inner.locks.lock((kind, name.clone())).await;
                let instance = instances.get(kind, &name)?;
                let next = instance.status().on_start()?;
                if instance.status() == Status::Running {
                    // repeat start is a success, not a backend trip
                    return Ok(DispatchResult::ok(
                        "start",
                        format!("{} is already running", name),
                    )
                    .with("container", &name)
                    .with("status", next));
                }
                if let Err(err) = driver.start(&name).await {
                    self.reconcile(kind, driver, &name).await;
                    return Err(err);
                }
                instances.update(kind, &name, Instance::mark_started)?;
                Ok(
                    DispatchResult::ok("start", format!("Started {}", name))
                        .with("container", &name)
                        .with("status", Status::Running),
                )
            }

            Operation::Stop { name } => {
                let _guard = self.inner.locks.lock((kind, name.clone())).await;
                let instance = instances.get(kind, &name)?;
                let next = instance.status().on_stop()?;
                if instance.status() == Status::Stopped {
                    return Ok(DispatchResult::ok(
                        "stop",
                        format!("{} is already stopped", name),
                    )
                    .with("container", &name)
                    .with("status", next));
                }
                if let Err(err) = driver.stop(&name).await {
                    self.reconcile(kind, driver, &name).await;
                    return Err(err);
                }
                instances.update(kind, &name, |i| {
                    i.set_status(Status::Stopped);
                })?;
                Ok(
                    DispatchResult::ok("stop", format!("Stopped {}", name))
                        .with("container", &name)
                        .with("status", Status::Stopped),
                )
            }

            Operation::Remove { name, force } => {
                let _guard = self.inner.locks.lock((kind, name.clone())).await;
                let instance = instances.get(kind, &name)?;
                instance.status().on_remove()?;
                if let Err(err) = driver.remove(&name, force).await {
                    self.reconcile(kind, driver, &name).await;
                    return Err(err);
                }
                if let Some(base) = instance.base_ref() {
                    self.bases(kind).release(base);
                }
                instances.evict(kind, &name);
                Ok(
                    DispatchResult::ok("remove", format!("Removed {}", name))
                        .with("container", &name)
                        .with("status", Status::Removed),
                )
            }

            Operation::Exec {
                name,
                command: guest_command,
                timeout,
            } => {
                let violations = security.check_command(&guest_command);
                if !violations.is_empty() {
                    return Err(Error::policy_denied(violations.join("; ")));
                }
                let _guard = self.inner.locks.lock((kind, name.clone())).await;
                let instance = instances.get(kind, &name)?;
                Self::require_running(&instance, "exec")?;

                let output = driver
                    .exec(
                        &name,
                        &[
                            "sh".to_string(),
                            "-c".to_string(),
                            guest_command.clone(),
                        ],
                        ExecOpts {
                            timeout,
                            cancel,
                            ..ExecOpts::default()
                        },
                    )
                    .await?;
                Ok(DispatchResult::ok(
                    "exec",
                    format!("Command exited with {}", output.exit_code),
                )
                .with("container", &name)
                .with("stdout", &output.stdout)
                .with("stderr", &output.stderr)
                .with("exit_code", output.exit_code))
            }

            Operation::CopyTo { name, local, remote } => {
                let _guard = self.inner.locks.lock((kind, name.clone())).await;
                let instance = instances.get(kind, &name)?;
                Self::require_running(&instance, "copy_to")?;
                driver.copy_to(&name, &local, &remote).await?;
                Ok(DispatchResult::ok(
                    "copy_to",
                    format!("Copied {} to {}:{}", local.display(), name, remote),
                )
                .with("container", &name))
            }

            Operation::CopyFrom { name, remote, local } => {
                let _guard = self.inner.locks.lock((kind, name.clone())).await;
                let instance = instances.get(kind, &name)?;
                Self::require_running(&instance, "copy_from")?;
                driver.copy_from(&name, &remote, &local).await?;
                Ok(DispatchResult::ok(
                    "copy_from",
                    format!("Copied {}:{} to {}", name, remote, local.display()),
                )
                .with("container", &name))
            }

            Operation::Logs { name, lines } => {
                let _guard = self.inner.locks.lock((kind, name.clone())).await;
                let instance = instances.get(kind, &name)?;
                Self::require_running(&instance, "logs")?;
                let output = driver.logs(&name, lines).await?;
                Ok(
                    DispatchResult::ok("logs", format!("{} log lines", output.lines().count()))
                        .with("container", &name)
                        .with("logs", output),
                )
            }

            Operation::RegisterBase {
                base,
                source,
                auto_stop,
            } => {
                // a registered instance source must be stopped first
                if let Ok(instance) = instances.get(kind, &source) {
                    if instance.status() == Status::Running {
                        if !auto_stop {
                            return Err(Error::invalid_argument(format!(
                                "source instance {:?} is running; stop it or pass auto_stop=true",
                                source
                            )));
                        }
                        let _guard = self.inner.locks.lock((kind, source.clone())).await;
                        driver.stop(&source).await?;
                        instances.update(kind, &source, |i| {
                            i.set_status(Status::Stopped);
                        })?;
                    }
                }

                let registered = self
                    .bases(kind)
                    .register(&base, &source, driver.snapshot_base(&source, &base))
                    .await?;
                Ok(DispatchResult::ok(
                    "register_base",
                    format!("Registered base {} from {}", base, source),
                )
                .with("base", &registered)
                .with("storage_kind", registered.storage_kind()))
            }

            Operation::CloneFromBase { base, name } => {
                let meta = self.bases(kind).get(&base)?;
                let name = instances.begin_create(kind, Some(name.as_str()))?;
                let started = Instant::now();

                let outcome = BaseRegistry::clone_from(
                    &self.bases(kind),
                    &base,
                    driver.clone_from_base(&meta, &name),
                )
                .await;
                let (ticket, updated) = match outcome {
                    Ok(result) => result,
                    Err(err) => {
                        instances.abort_create(kind, &name);
                        return Err(err);
                    }
                };
                let clone_time_ms = started.elapsed().as_millis() as u64;

                let instance = InstanceBuilder::default()
                    .name(name.clone())
                    .id(ticket.id.clone())
                    .image(meta.source().clone())
                    .status(Status::Created)
                    .base_ref(Some(base.clone()))
                    .build()?;
                instances.commit_create(kind, instance);

                let mut result = DispatchResult::ok(
                    "clone_from_base",
                    format!("Cloned {} from base {} in {}ms", name, base, clone_time_ms),
                )
                .with("container", &name)
                .with("base", &base)
                .with("clone_time_ms", clone_time_ms)
                .with("clone_count", updated.clone_count());
                if let Some(bytes) = ticket.bytes_consumed {
                    result = result.with("bytes_consumed", bytes);
                }
                Ok(result)
            }

            Operation::ListBases => {
                let bases = self.bases(kind).list();
                let count = bases.len();
                Ok(
                    DispatchResult::ok("list_bases", format!("{} base(s)", count))
                        .with("bases", &bases)
                        .with("count", count),
                )
            }

            Operation::DeleteBase { base, force } => {
                let meta = self.bases(kind).get(&base)?;
                self.bases(kind)
                    .delete(&base, force, driver.delete_base_snapshot(&meta))
                    .await?;
                Ok(DispatchResult::ok(
                    "delete_base",
                    format!("Deleted base {}", base),
                ))
            }

            Operation::DeployRexx {
                name,
                binary,
                target,
            } => {
                let _guard = self.inner.locks.lock((kind, name.clone())).await;
                let instance = instances.get(kind, &name)?;
                Self::require_running(&instance, "deploy_rexx")?;

                let guest_path =
                    payload::target_path(target.as_deref(), self.inner.options.rexx_path());
                let outcome =
                    payload::deploy(driver, security, &name, &binary, &guest_path, cancel).await?;
                instances.update(kind, &name, |i| i.mark_deployed(&guest_path))?;

                Ok(DispatchResult::ok(
                    "deploy_rexx",
                    format!(
                        "Deployed interpreter to {}:{} ({} bytes in {}ms)",
                        name, guest_path, outcome.bytes, outcome.elapsed_ms
                    ),
                )
                .with("container", &name)
                .with("rexx_path", &outcome.remote_path)
                .with("bytes", outcome.bytes)
                .with("elapsed_ms", outcome.elapsed_ms)
                .with("throughput_mb_s", outcome.throughput_mb_s))
            }

            Operation::ExecuteRexx {
                name,
                script,
                script_file,
                timeout,
                progress: wants_progress,
            } => {
                let _guard = self.inner.locks.lock((kind, name.clone())).await;
                let instance = instances.get(kind, &name)?;
                Self::require_running(&instance, "execute_rexx")?;
                if !instance.rexx_deployed() {
                    return Err(Error::invalid_argument(format!(
                        "interpreter not deployed in {:?}; run deploy_rexx first",
                        name
                    )));
                }
                let rexx_path = instance
                    .rexx_path()
                    .clone()
                    .unwrap_or_else(|| self.inner.options.rexx_path().clone());

                let script =
                    payload::resolve_script(script.as_deref(), script_file.as_deref()).await?;
                let sink = if wants_progress { progress } else { None };
                let output = payload::execute(
                    driver,
                    security,
                    &name,
                    &rexx_path,
                    &script,
                    timeout,
                    sink,
                    cancel,
                )
                .await?;

                let mut result = DispatchResult::ok(
                    "execute_rexx",
                    format!("Script exited with {}", output.exit_code),
                )
                .with("container", &name)
                .with("stdout", &output.stdout)
                .with("stderr", &output.stderr)
                .with("exit_code", output.exit_code);
                if wants_progress {
                    result = result.with("checkpoints", crate::checkpoint::scan(&output.stdout));
                }
                Ok(result)
            }

            Operation::CleanupRexx { name } => {
                let _guard = self.inner.locks.lock((kind, name.clone())).await;
                let instance = instances.get(kind, &name)?;
                if let Some(rexx_path) = instance.rexx_path().clone() {
                    payload::cleanup(driver, &name, &rexx_path).await?;
                }
                instances.update(kind, &name, Instance::clear_deployed)?;
                Ok(DispatchResult::ok(
                    "cleanup_rexx",
                    format!("Removed interpreter from {}", name),
                )
                .with("container", &name)
                .with("rexx_deployed", false))
            }

            Operation::SecurityAudit => {
                let events = security.audit().snapshot();
                let count = events.len();
                Ok(DispatchResult::ok(
                    "security_audit",
                    format!("{} audit event(s)", count),
                )
                .with("events", &events)
                .with("count", count)
                .with("policies", security.policy()))
            }
        }
    }
}
