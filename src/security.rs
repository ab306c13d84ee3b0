//! The security gate: policy enforcement for everything that reaches a
//! backend, plus the audit trail of what was checked and what was refused.
//!
//! A gate is immutable once constructed. Checks return structured failures
//! (`policy_denied`) rather than panicking, so dispatch stays healthy; only
//! a misconfigured policy fails construction.

use crate::{
    command::format_memory,
    error::{Error, Result},
    instance::VolumeMount,
};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};
use strum::{AsRefStr, Display, EnumString};

/// Maximum number of audit events retained; the oldest are evicted.
pub const AUDIT_CAPACITY: usize = 1000;

/// Marker substring accepted in interpreter binary names under `moderate`.
const BINARY_MARKER: &str = "rexx";

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
/// How strictly the gate treats requests.
pub enum PolicyMode {
    /// Every check allows; violations are still recorded for observability.
    Permissive,
    /// Resource ceilings and path containment enforced (the default).
    Moderate,
    /// Additionally: image allow-list, exact trusted binaries, no privileged.
    Strict,
}

impl Default for PolicyMode {
    fn default() -> Self {
        PolicyMode::Moderate
    }
}

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
/// Classification of an audit event.
pub enum EventKind {
    SecurityViolation,
    CommandBlocked,
    BinaryValidation,
    ImageRejected,
    PrivilegedDenied,
}

#[derive(Clone, Debug, Serialize)]
/// One immutable audit record.
pub struct AuditEvent {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub event_kind: EventKind,
    pub details: BTreeMap<String, String>,
    pub mode: PolicyMode,
}

/// Bounded ring buffer of audit events. Append is globally serialized;
/// readers copy under the lock and release before serializing.
#[derive(Debug, Default)]
pub struct AuditLog {
    events: Mutex<VecDeque<AuditEvent>>,
}

impl AuditLog {
    fn record(&self, mode: PolicyMode, event_kind: EventKind, details: BTreeMap<String, String>) {
        let event = AuditEvent {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            event_kind,
            details,
            mode,
        };
        let mut events = self.events.lock().expect("audit log lock");
        if events.len() == AUDIT_CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Copy out the current events, oldest first.
    pub fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit log lock").iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("audit log lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

lazy_static! {
    static ref DEFAULT_BANNED_PATTERNS: Vec<&'static str> = vec![
        // recursive delete against absolute paths
        r"rm\s+-[a-zA-Z]*[rR][a-zA-Z]*\s+/",
        // raw disk reads/writes
        r"dd\s+if=",
        // backgrounding
        r"&\s*$",
        // chained removal
        r";\s*rm\s",
        // writes into /dev
        r">\s*/dev/",
        // filesystem creation
        r"mkfs(\.\w+)?\s",
        // fork bomb
        r":\(\)\s*\{",
    ];
    static ref DEFAULT_BANNED_SUBSTRINGS: Vec<&'static str> =
        vec!["rm -rf /", "rm -fr /", "> /dev/sda", "shutdown -", "reboot -f"];
}

#[derive(Builder, Clone, CopyGetters, Debug, Getters, Serialize)]
#[builder(default, pattern = "owned", setter(into), build_fn(error = "crate::error::Error"))]
/// Immutable per-gate policy.
pub struct SecurityPolicy {
    #[get_copy = "pub"]
    mode: PolicyMode,

    #[get_copy = "pub"]
    /// Ceiling for per-instance memory requests, in bytes.
    max_memory_bytes: u64,

    #[get_copy = "pub"]
    /// Ceiling for per-instance CPU requests.
    max_cpus: f64,

    #[get_copy = "pub"]
    /// Whether `privileged=true` creates are allowed under `moderate`.
    allow_privileged: bool,

    #[get = "pub"]
    /// Absolute host-path prefixes from which volumes may be mounted.
    allowed_volume_paths: Vec<PathBuf>,

    #[get = "pub"]
    /// Images consulted in `strict` mode.
    allowed_images: BTreeSet<String>,

    #[get = "pub"]
    /// Interpreter binaries accepted without further checks.
    trusted_binaries: BTreeSet<PathBuf>,

    #[get = "pub"]
    /// Literal fragments refused inside guest commands.
    banned_command_substrings: Vec<String>,

    #[get = "pub"]
    /// Regular expressions refused inside guest commands.
    banned_command_patterns: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            mode: PolicyMode::default(),
            max_memory_bytes: 8 * 1024 * 1024 * 1024,
            max_cpus: 8.0,
            allow_privileged: false,
            allowed_volume_paths: Vec::new(),
            allowed_images: BTreeSet::new(),
            trusted_binaries: BTreeSet::new(),
            banned_command_substrings: DEFAULT_BANNED_SUBSTRINGS
                .iter()
                .map(ToString::to_string)
                .collect(),
            banned_command_patterns: DEFAULT_BANNED_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// The gate itself: policy, compiled patterns, and the audit log.
#[derive(Debug)]
pub struct Security {
    policy: SecurityPolicy,
    patterns: Vec<Regex>,
    workdir: PathBuf,
    audit: AuditLog,
}

impl Security {
    /// Build a gate from a policy. Fails on unparseable patterns or
    /// nonsensical limits; a broken policy must not come up half-armed.
    pub fn new(policy: SecurityPolicy) -> Result<Self> {
        if !policy.max_cpus().is_finite() || policy.max_cpus() < 0.0 {
            return Err(Error::invalid_argument(format!(
                "max_cpus must be a non-negative finite number, got {}",
                policy.max_cpus()
            )));
        }
        for path in policy.allowed_volume_paths() {
            if !path.is_absolute() {
                return Err(Error::invalid_argument(format!(
                    "allowed volume path {} is not absolute",
                    path.display()
                )));
            }
        }
        let patterns = policy
            .banned_command_patterns()
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    Error::invalid_argument(format!("banned command pattern {:?}: {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let workdir = std::env::current_dir()?;

        Ok(Self {
            policy,
            patterns,
            workdir,
            audit: AuditLog::default(),
        })
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn mode(&self) -> PolicyMode {
        self.policy.mode()
    }

    fn details(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Scan a guest-bound command for banned fragments. Returns the list of
    /// violations; an empty list means allow. In `permissive` mode the
    /// violations are recorded but the command is allowed anyway.
    pub fn check_command(&self, text: &str) -> Vec<String> {
        let mut violations = Vec::new();
        for fragment in self.policy.banned_command_substrings() {
            if text.contains(fragment.as_str()) {
                violations.push(format!("command contains banned fragment {:?}", fragment));
            }
        }
        for (source, regex) in self
            .policy
            .banned_command_patterns()
            .iter()
            .zip(self.patterns.iter())
        {
            if regex.is_match(text) {
                violations.push(format!("command matches dangerous pattern {:?}", source));
            }
        }

        if !violations.is_empty() {
            warn!("Blocked command: {}", violations.join("; "));
            self.audit.record(
                self.mode(),
                EventKind::CommandBlocked,
                Self::details(&[("command", text), ("violations", &violations.join("; "))]),
            );
            if self.mode() == PolicyMode::Permissive {
                return Vec::new();
            }
        }
        violations
    }

    /// Enforce the memory ceiling on a create request.
    pub fn check_memory(&self, requested_bytes: u64) -> Result<()> {
        if requested_bytes <= self.policy.max_memory_bytes() {
            return Ok(());
        }
        let message = format!(
            "Memory limit {} exceeds maximum allowed {}",
            format_memory(requested_bytes),
            format_memory(self.policy.max_memory_bytes())
        );
        self.audit.record(
            self.mode(),
            EventKind::SecurityViolation,
            Self::details(&[("check", "memory"), ("message", &message)]),
        );
        if self.mode() == PolicyMode::Permissive {
            return Ok(());
        }
        Err(Error::policy_denied(message))
    }

    /// Enforce the CPU ceiling on a create request.
    pub fn check_cpus(&self, requested: f64) -> Result<()> {
        if requested <= self.policy.max_cpus() {
            return Ok(());
        }
        let message = format!(
            "CPU limit {} exceeds maximum allowed {}",
            requested,
            self.policy.max_cpus()
        );
        self.audit.record(
            self.mode(),
            EventKind::SecurityViolation,
            Self::details(&[("check", "cpus"), ("message", &message)]),
        );
        if self.mode() == PolicyMode::Permissive {
            return Ok(());
        }
        Err(Error::policy_denied(message))
    }

    /// Decide whether a privileged instance may be created.
    pub fn check_privileged(&self, requested: bool) -> Result<()> {
        if !requested {
            return Ok(());
        }
        let refused = match self.mode() {
            PolicyMode::Permissive => false,
            PolicyMode::Moderate => !self.policy.allow_privileged(),
            PolicyMode::Strict => true,
        };
        if !refused {
            return Ok(());
        }
        let message = format!(
            "privileged containers are not allowed under {} policy",
            self.mode()
        );
        self.audit.record(
            self.mode(),
            EventKind::PrivilegedDenied,
            Self::details(&[("message", &message)]),
        );
        Err(Error::policy_denied(message))
    }

    /// In `strict` mode, the image must be allow-listed.
    pub fn check_image(&self, image: &str) -> Result<()> {
        if self.mode() != PolicyMode::Strict || self.policy.allowed_images().contains(image) {
            return Ok(());
        }
        let message = format!("image {:?} is not on the allow-list", image);
        self.audit.record(
            self.mode(),
            EventKind::ImageRejected,
            Self::details(&[("image", image)]),
        );
        Err(Error::policy_denied(message))
    }

    fn canonical(path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    fn host_path_allowed(&self, host: &Path) -> bool {
        let canonical = Self::canonical(host);
        let listed = self
            .policy
            .allowed_volume_paths()
            .iter()
            .any(|prefix| canonical.starts_with(prefix));
        match self.mode() {
            PolicyMode::Permissive => true,
            PolicyMode::Moderate => listed || canonical.starts_with(&self.workdir),
            PolicyMode::Strict => listed,
        }
    }

    /// Check every `host:guest` bind pair of a create request.
    pub fn check_volumes(&self, volumes: &[VolumeMount]) -> Result<()> {
        for volume in volumes {
            if self.host_path_allowed(volume.host()) {
                continue;
            }
            let message = format!(
                "volume host path {} is outside the allowed paths",
                volume.host().display()
            );
            self.audit.record(
                self.mode(),
                EventKind::SecurityViolation,
                Self::details(&[("check", "volume"), ("message", &message)]),
            );
            if self.mode() == PolicyMode::Permissive {
                continue;
            }
            return Err(Error::policy_denied(message));
        }
        Ok(())
    }

    /// Validate an interpreter binary before it is staged into a guest. A
    /// `binary_validation` event is recorded regardless of the outcome.
    pub fn check_binary(&self, binary: &Path) -> Result<()> {
        let canonical = Self::canonical(binary);
        let trusted = self.policy.trusted_binaries().contains(&canonical)
            || self.policy.trusted_binaries().contains(binary);
        let allowed = match self.mode() {
            PolicyMode::Permissive => true,
            PolicyMode::Moderate => {
                trusted
                    || canonical.starts_with(&self.workdir)
                    || binary
                        .file_name()
                        .map(|n| n.to_string_lossy().to_lowercase().contains(BINARY_MARKER))
                        .unwrap_or(false)
            }
            PolicyMode::Strict => trusted,
        };

        self.audit.record(
            self.mode(),
            EventKind::BinaryValidation,
            Self::details(&[
                ("binary", &binary.display().to_string()),
                ("allowed", if allowed { "true" } else { "false" }),
            ]),
        );
        debug!("Binary validation for {}: {}", binary.display(), allowed);

        if allowed {
            Ok(())
        } else {
            Err(Error::policy_denied(format!(
                "binary {} is not trusted under {} policy",
                binary.display(),
                self.mode()
            )))
        }
    }
}
