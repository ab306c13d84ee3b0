//! Configuration related structures

use crate::{
    command::parse_memory,
    engine::EngineOptions,
    error::Result,
    security::{PolicyMode, SecurityPolicy, SecurityPolicyBuilder},
};
use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Builder, Clone, CopyGetters, Debug, Getters, Parser)]
#[builder(default, pattern = "owned", setter(into), build_fn(error = "crate::error::Error"))]
#[command(
    name = "corral",
    version,
    about = "Uniform orchestration over containers, VMs and microVMs",
    after_help = "One command per invocation, or --stdin for a line protocol:\n  corral docker \"create image=debian:stable name=web-1\""
)]
/// Runtime configuration, from flags and environment.
pub struct Config {
    #[get_copy = "pub"]
    #[arg(
        short = 'l',
        long = "log-level",
        env = "CORRAL_LOG_LEVEL",
        default_value = "info",
        value_name = "LEVEL"
    )]
    /// The logging level of the application
    log_level: LevelFilter,

    #[get_copy = "pub"]
    #[arg(
        long = "policy-mode",
        env = "CORRAL_POLICY_MODE",
        default_value = "moderate",
        value_name = "MODE"
    )]
    /// Security policy mode: permissive, moderate or strict
    policy_mode: PolicyMode,

    #[get = "pub"]
    #[arg(
        long = "max-memory",
        env = "CORRAL_MAX_MEMORY",
        default_value = "8g",
        value_name = "SIZE"
    )]
    /// Per-instance memory ceiling, e.g. 512m or 8g
    max_memory: String,

    #[get_copy = "pub"]
    #[arg(long = "max-cpus", env = "CORRAL_MAX_CPUS", default_value_t = 8.0)]
    /// Per-instance CPU ceiling
    max_cpus: f64,

    #[get_copy = "pub"]
    #[arg(long = "max-instances", env = "CORRAL_MAX_INSTANCES", default_value_t = 20)]
    /// Soft cap on instances per driver
    max_instances: usize,

    #[get_copy = "pub"]
    #[arg(long = "allow-privileged")]
    /// Permit privileged instances under the moderate policy
    allow_privileged: bool,

    #[get = "pub"]
    #[arg(long = "allowed-volume-path", value_name = "PATH")]
    /// Absolute host path prefixes volumes may come from (repeatable)
    allowed_volume_paths: Vec<PathBuf>,

    #[get = "pub"]
    #[arg(long = "allowed-image", value_name = "IMAGE")]
    /// Images permitted in strict mode (repeatable)
    allowed_images: Vec<String>,

    #[get = "pub"]
    #[arg(long = "trusted-binary", value_name = "PATH")]
    /// Interpreter binaries accepted for deployment (repeatable)
    trusted_binaries: Vec<PathBuf>,

    #[get = "pub"]
    #[arg(
        long = "rexx-path",
        env = "CORRAL_REXX_PATH",
        default_value = crate::payload::DEFAULT_REXX_PATH,
        value_name = "PATH"
    )]
    /// Default guest path for the staged interpreter
    rexx_path: String,

    #[get_copy = "pub"]
    #[arg(long = "stdin")]
    /// Read "<target> <command...>" lines from stdin instead of argv
    stdin_mode: bool,

    #[get = "pub"]
    #[arg(value_name = "TARGET")]
    /// ADDRESS target, e.g. docker, lxd, qemu
    target: Option<String>,

    #[get = "pub"]
    #[arg(value_name = "COMMAND", trailing_var_arg = true)]
    /// The command line to dispatch
    command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            policy_mode: PolicyMode::default(),
            max_memory: "8g".to_string(),
            max_cpus: 8.0,
            max_instances: 20,
            allow_privileged: false,
            allowed_volume_paths: Vec::new(),
            allowed_images: Vec::new(),
            trusted_binaries: Vec::new(),
            rexx_path: crate::payload::DEFAULT_REXX_PATH.to_string(),
            stdin_mode: false,
            target: None,
            command: Vec::new(),
        }
    }
}

impl Config {
    /// Assemble the security policy this configuration describes.
    pub fn policy(&self) -> Result<SecurityPolicy> {
        let max_memory_bytes = match parse_memory(self.max_memory()) {
            0 => SecurityPolicy::default().max_memory_bytes(),
            bytes => bytes,
        };
        Ok(SecurityPolicyBuilder::default()
            .mode(self.policy_mode())
            .max_memory_bytes(max_memory_bytes)
            .max_cpus(self.max_cpus())
            .allow_privileged(self.allow_privileged())
            .allowed_volume_paths(self.allowed_volume_paths().clone())
            .allowed_images(self.allowed_images().iter().cloned().collect::<std::collections::BTreeSet<_>>())
            .trusted_binaries(
                self.trusted_binaries()
                    .iter()
                    .cloned()
                    .collect::<std::collections::BTreeSet<_>>(),
            )
            .build()?)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_instances: self.max_instances(),
            rexx_path: self.rexx_path().clone(),
            ..EngineOptions::default()
        }
    }
}
