//! OCI container backends: `docker` and `podman`.
//!
//! Both CLIs speak the same surface for everything this driver needs, so a
//! single implementation is parameterized by the binary. Bases are committed
//! images; clones are containers created from them, which the overlay
//! filesystem backs without copying the image.

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
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct OciDriver {
    kind: DriverKind,
    binary: PathBuf,
    exec: Box<dyn Exec>,
}

impl OciDriver {
    pub fn new(kind: DriverKind, exec: Box<dyn Exec>) -> Result<Self> {
        let binary = match kind {
            DriverKind::Docker => "docker",
            DriverKind::Podman => "podman",
            other => {
                return Err(Error::invalid_argument(format!(
                    "{} is not an OCI target",
                    other
                )))
            }
        };
        Ok(Self {
            kind,
            binary: PathBuf::from(binary),
            exec,
        })
    }

    async fn run(&self, action: &str, args: Vec<String>, opts: ExecOpts) -> Result<ExecOutput> {
        let output = self.exec.run(&self.binary, &args, opts).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_failure(self.kind, action, &output))
        }
    }

    async fn run_simple(&self, action: &str, args: &[&str]) -> Result<ExecOutput> {
        self.run(
            action,
            args.iter().map(ToString::to_string).collect(),
            ExecOpts::default(),
        )
        .await
    }

    fn image_ref(base_name: &str) -> String {
        format!("corral/{}:base", base_name)
    }
}

#[derive(Deserialize)]
/// One line of `ps --format {{json .}}` output.
struct PsLine {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Image", default)]
    image: String,
}

fn state_to_status(state: &str) -> Option<Status> {
    match state.to_lowercase().as_str() {
        "created" => Some(Status::Created),
        "running" | "restarting" | "paused" => Some(Status::Running),
        "exited" | "stopped" | "dead" => Some(Status::Stopped),
        "removing" => Some(Status::Removed),
        _ => None,
    }
}

#[async_trait]
impl Driver for OciDriver {
    fn kind(&self) -> DriverKind {
        self.kind
    }

    async fn probe(&self) -> Result<ProbeInfo> {
        match self.exec
            .run(
                &self.binary,
                &["--version".to_string()],
                ExecOpts::default(),
            )
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
                vec![
                    "ps".to_string(),
                    "--all".to_string(),
                    "--format".to_string(),
                    "{{json .}}".to_string(),
                ],
                ExecOpts::default(),
            )
            .await?;
        let mut instances = Vec::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<PsLine>(line) {
                Ok(ps) => instances.push(BackendInstance {
                    name: ps.names,
                    id: ps.id,
                    status: state_to_status(&ps.state),
                    image: ps.image,
                }),
                Err(err) => debug!("Skipping unparseable ps line {:?}: {}", line, err),
            }
        }
        Ok(instances)
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name().clone(),
        ];
        if spec.memory_bytes() > 0 {
            args.push("--memory".to_string());
            args.push(spec.memory_bytes().to_string());
        }
        if spec.cpus() > 0.0 {
            args.push("--cpus".to_string());
            args.push(spec.cpus().to_string());
        }
        for volume in spec.volumes() {
            args.push("--volume".to_string());
            args.push(volume.to_arg());
        }
        for (key, value) in spec.environment() {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        if spec.interactive() {
            args.push("--interactive".to_string());
            args.push("--tty".to_string());
        }
        if spec.privileged() {
            args.push("--privileged".to_string());
        }
        args.push(spec.image().clone());

        let output = self.run("create", args, ExecOpts::default()).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run_simple("start", &["start", name]).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run_simple("stop", &["stop", name]).await.map(|_| ())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(name.to_string());
        self.run("remove", args, ExecOpts::default()).await.map(|_| ())
    }

    async fn exec(&self, name: &str, command: &[String], opts: ExecOpts) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string()];
        if opts.stdin.is_some() {
            args.push("--interactive".to_string());
        }
        args.push(name.to_string());
        args.extend(command.iter().cloned());
        // a failing guest command is an outcome, not a driver error
        self.exec.run(&self.binary, &args, opts).await
    }

    async fn copy_to(&self, name: &str, local: &Path, remote: &str) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            local.display().to_string(),
            format!("{}:{}", name, remote),
        ];
        let opts = ExecOpts {
            kind: Some(InvocationKind::Transfer),
            ..ExecOpts::default()
        };
        self.run("copy_to", args, opts).await.map(|_| ())
    }

    async fn copy_from(&self, name: &str, remote: &str, local: &Path) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            format!("{}:{}", name, remote),
            local.display().to_string(),
        ];
        let opts = ExecOpts {
            kind: Some(InvocationKind::Transfer),
            ..ExecOpts::default()
        };
        self.run("copy_from", args, opts).await.map(|_| ())
    }

    async fn logs(&self, name: &str, lines: usize) -> Result<String> {
        let output = self
            .run(
                "logs",
                vec![
                    "logs".to_string(),
                    "--tail".to_string(),
                    lines.to_string(),
                    name.to_string(),
                ],
                ExecOpts::default(),
            )
            .await?;
        // container stdout and stderr both count as log output
        Ok(format!("{}{}", output.stdout, output.stderr))
    }

    async fn snapshot_base(&self, source: &str, base_name: &str) -> Result<(StorageKind, String)> {
        let image_ref = Self::image_ref(base_name);
        self.run(
            "register_base",
            vec!["commit".to_string(), source.to_string(), image_ref.clone()],
            ExecOpts::default(),
        )
        .await?;
        Ok((StorageKind::Template, image_ref))
    }

    async fn clone_from_base(&self, base: &BaseImage, name: &str) -> Result<CloneTicket> {
        let output = self
            .run(
                "clone_from_base",
                vec![
                    "create".to_string(),
                    "--name".to_string(),
                    name.to_string(),
                    base.snapshot_ref().clone(),
                ],
                ExecOpts::default(),
            )
            .await?;
        Ok(CloneTicket {
            id: output.stdout.trim().to_string(),
            bytes_consumed: None,
        })
    }

    async fn delete_base_snapshot(&self, base: &BaseImage) -> Result<()> {
        self.run(
            "delete_base",
            vec!["rmi".to_string(), base.snapshot_ref().clone()],
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
    use crate::instance::VolumeMount;
    use std::collections::BTreeMap;

    fn driver(mock: &MockExec) -> OciDriver {
        OciDriver::new(DriverKind::Docker, Box::new(mock.clone())).unwrap()
    }

    #[tokio::test]
    async fn create_builds_full_command_line() {
        let mock = MockExec::new();
        mock.push_ok("abc123\n");
        let spec = crate::driver::CreateSpecBuilder::default()
            .name("web-1")
            .image("debian:stable")
            .memory_bytes(512u64 * 1024 * 1024)
            .cpus(1.5)
            .volumes(vec![VolumeMount::new("/data".into(), "/mnt".to_string())])
            .environment(
                [("A".to_string(), "1".to_string())]
                    .into_iter()
                    .collect::<BTreeMap<_, _>>(),
            )
            .privileged(true)
            .build()
            .unwrap();

        let id = driver(&mock).create(&spec).await.unwrap();
        assert_eq!(id, "abc123");
        assert_eq!(
            mock.call_lines()[0],
            "docker create --name web-1 --memory 536870912 --cpus 1.5 \
             --volume /data:/mnt --env A=1 --privileged debian:stable"
        );
    }

    #[tokio::test]
    async fn list_parses_json_lines() {
        let mock = MockExec::new();
        mock.push_ok(
            "{\"ID\":\"aaa\",\"Names\":\"web-1\",\"State\":\"running\",\"Image\":\"debian\"}\n\
             {\"ID\":\"bbb\",\"Names\":\"web-2\",\"State\":\"exited\",\"Image\":\"debian\"}\n",
        );
        let listed = driver(&mock).list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "web-1");
        assert_eq!(listed[0].status, Some(Status::Running));
        assert_eq!(listed[1].status, Some(Status::Stopped));
        assert_eq!(mock.call_lines()[0], "docker ps --all --format {{json .}}");
    }

    #[tokio::test]
    async fn missing_container_maps_to_not_found() {
        let mock = MockExec::new();
        mock.push_exit(1, "Error: No such container: ghost");
        let err = driver(&mock).stop("ghost").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(err.stderr().unwrap().contains("No such container"));
    }

    #[tokio::test]
    async fn duplicate_name_maps_to_conflict() {
        let mock = MockExec::new();
        mock.push_exit(
            125,
            "docker: Error response from daemon: Conflict. The container name \"/web-1\" is already in use",
        );
        let spec = crate::driver::CreateSpecBuilder::default()
            .name("web-1")
            .image("debian:stable")
            .build()
            .unwrap();
        let err = driver(&mock).create(&spec).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn exec_passes_stdin_interactively() {
        let mock = MockExec::new();
        mock.push_ok("hi\n");
        let opts = ExecOpts {
            stdin: Some(b"input".to_vec()),
            ..ExecOpts::default()
        };
        let output = driver(&mock)
            .exec("web-1", &["sh".to_string(), "-c".to_string(), "cat".to_string()], opts)
            .await
            .unwrap();
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(
            mock.call_lines()[0],
            "docker exec --interactive web-1 sh -c cat"
        );
        assert_eq!(mock.calls()[0].2.as_deref(), Some(b"input".as_ref()));
    }

    #[tokio::test]
    async fn exec_nonzero_exit_is_not_an_error() {
        let mock = MockExec::new();
        mock.push_exit(2, "");
        let output = driver(&mock)
            .exec("web-1", &["false".to_string()], ExecOpts::default())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 2);
    }

    #[tokio::test]
    async fn base_snapshot_and_clone() {
        let mock = MockExec::new();
        mock.push_ok("sha256:fff\n").push_ok("cloned-id\n");
        let driver = driver(&mock);

        let (kind, snapshot_ref) = driver.snapshot_base("web-1", "b1").await.unwrap();
        assert_eq!(kind, StorageKind::Template);
        assert_eq!(snapshot_ref, "corral/b1:base");

        let registry = crate::base::BaseRegistry::default();
        let base = registry
            .register("b1", "web-1", async move { Ok((kind, snapshot_ref)) })
            .await
            .unwrap();
        let ticket = driver.clone_from_base(&base, "c1").await.unwrap();
        assert_eq!(ticket.id, "cloned-id");
        assert_eq!(
            mock.call_lines()[1],
            "docker create --name c1 corral/b1:base"
        );
    }

    #[tokio::test]
    async fn copy_to_is_a_transfer() {
        let mock = MockExec::new();
        driver(&mock)
            .copy_to("web-1", Path::new("/tmp/rexx"), "/usr/local/bin/rexx")
            .await
            .unwrap();
        assert_eq!(
            mock.call_lines()[0],
            "docker cp /tmp/rexx web-1:/usr/local/bin/rexx"
        );
    }
}
