//! QEMU/KVM full virtual machines.
//!
//! Instances are qcow2 overlays on top of a backing image plus a daemonized
//! `qemu-system` process per running VM, tracked through pidfiles in the
//! driver's state directory. Cloning never copies the disk: a clone is a
//! fresh overlay whose `backing_file` is the base image, so N clones consume
//! N × delta storage, not N × base size.
//!
//! Guest-side exec and file transfer need an agent and are out of scope for
//! this backend; those capabilities report `unsupported`.

use crate::{
    base::{BaseImage, StorageKind},
    driver::{
        classify_failure,
        exec::{Exec, ExecOpts, ExecOutput},
        CloneTicket, CreateSpec, Driver, DriverKind, ProbeInfo,
    },
    error::{Error, Result},
};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_MEMORY_MB: u64 = 512;

#[derive(Debug)]
pub struct QemuDriver {
    system_binary: PathBuf,
    img_binary: PathBuf,
    exec: Box<dyn Exec>,
    state_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
/// Per-VM launch parameters persisted next to the overlay, since `start`
/// only receives the instance name.
struct VmSpec {
    overlay: PathBuf,
    memory_mb: u64,
    cpus: u64,
}

impl QemuDriver {
    pub fn new(exec: Box<dyn Exec>) -> Self {
        let state_dir = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".corral")
            .join("qemu");
        Self {
            system_binary: PathBuf::from("qemu-system-x86_64"),
            img_binary: PathBuf::from("qemu-img"),
            exec,
            state_dir,
        }
    }

    #[cfg(test)]
    fn with_state_dir(mut self, state_dir: PathBuf) -> Self {
        self.state_dir = state_dir;
        self
    }

    fn overlay_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.qcow2", name))
    }

    fn spec_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", name))
    }

    fn pidfile_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.pid", name))
    }

    async fn load_spec(&self, name: &str) -> Result<VmSpec> {
        let raw = tokio::fs::read_to_string(self.spec_path(name))
            .await
            .map_err(|_| Error::not_found(format!("no qemu instance named {:?}", name)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn create_overlay(&self, backing: &str, overlay: &Path) -> Result<()> {
        let args = vec![
            "create".to_string(),
            "-q".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            "-F".to_string(),
            "qcow2".to_string(),
            "-b".to_string(),
            backing.to_string(),
            overlay.display().to_string(),
        ];
        let output = self.exec.run(&self.img_binary, &args, ExecOpts::default()).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_failure(DriverKind::Qemu, "create overlay", &output))
        }
    }

    async fn read_pid(&self, name: &str) -> Option<i32> {
        let raw = tokio::fs::read_to_string(self.pidfile_path(name)).await.ok()?;
        raw.trim().parse().ok()
    }

    fn signal(pid: i32, signal: libc::c_int) -> bool {
        unsafe { libc::kill(pid, signal) == 0 }
    }
}

#[async_trait]
impl Driver for QemuDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Qemu
    }

    fn stdin_capable(&self) -> bool {
        false
    }

    async fn probe(&self) -> Result<ProbeInfo> {
        if which::which(&self.system_binary).is_err() || which::which(&self.img_binary).is_err() {
            return Ok(ProbeInfo {
                available: false,
                version: None,
            });
        }
        match self
            .exec
            .run(&self.system_binary, &["--version".to_string()], ExecOpts::default())
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

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let overlay = self.overlay_path(spec.name());
        if tokio::fs::metadata(&overlay).await.is_ok() {
            return Err(Error::conflict(format!(
                "qemu instance {:?} already has a disk",
                spec.name()
            )));
        }
        self.create_overlay(spec.image(), &overlay).await?;

        let memory_mb = match spec.memory_bytes() {
            0 => DEFAULT_MEMORY_MB,
            bytes => (bytes / (1024 * 1024)).max(1),
        };
        let cpus = match spec.cpus() {
            c if c > 0.0 => c.ceil() as u64,
            _ => 1,
        };
        let vm = VmSpec {
            overlay: overlay.clone(),
            memory_mb,
            cpus,
        };
        tokio::fs::write(self.spec_path(spec.name()), serde_json::to_string(&vm)?).await?;
        info!("Created qemu overlay {}", overlay.display());
        Ok(overlay.display().to_string())
    }

    async fn start(&self, name: &str) -> Result<()> {
        if let Some(pid) = self.read_pid(name).await {
            if Self::signal(pid, 0) {
                debug!("qemu instance {:?} already running (pid {})", name, pid);
                return Ok(());
            }
        }
        let vm = self.load_spec(name).await?;
        let args = vec![
            "-name".to_string(),
            format!("guest={}", name),
            "-m".to_string(),
            vm.memory_mb.to_string(),
            "-smp".to_string(),
            vm.cpus.to_string(),
            "-drive".to_string(),
            format!("file={},format=qcow2,if=virtio", vm.overlay.display()),
            "-display".to_string(),
            "none".to_string(),
            "-daemonize".to_string(),
            "-pidfile".to_string(),
            self.pidfile_path(name).display().to_string(),
        ];
        let output = self.exec.run(&self.system_binary, &args, ExecOpts::default()).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_failure(DriverKind::Qemu, "start", &output))
        }
    }

    async fn stop(&self, name: &str) -> Result<()> {
        match self.read_pid(name).await {
            Some(pid) => {
                Self::signal(pid, libc::SIGTERM);
                let _ = tokio::fs::remove_file(self.pidfile_path(name)).await;
                Ok(())
            }
            None => {
                // never started or already down; stopping is idempotent
                self.load_spec(name).await.map(|_| ())
            }
        }
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        if let Some(pid) = self.read_pid(name).await {
            if Self::signal(pid, 0) && !force {
                return Err(Error::conflict(format!(
                    "qemu instance {:?} is running; stop it or pass force=true",
                    name
                )));
            }
            Self::signal(pid, libc::SIGKILL);
        }
        let vm = self.load_spec(name).await?;
        let _ = tokio::fs::remove_file(&vm.overlay).await;
        let _ = tokio::fs::remove_file(self.pidfile_path(name)).await;
        tokio::fs::remove_file(self.spec_path(name)).await?;
        Ok(())
    }

    async fn snapshot_base(&self, source: &str, _base_name: &str) -> Result<(StorageKind, String)> {
        // an instance's overlay or any qcow2 path can back clones; the file
        // is left untouched and treated as read-only from here on
        let backing = match self.load_spec(source).await {
            Ok(vm) => vm.overlay.display().to_string(),
            Err(_) if Path::new(source).exists() => source.to_string(),
            Err(err) => return Err(err),
        };
        Ok((StorageKind::Qcow2, backing))
    }

    async fn clone_from_base(&self, base: &BaseImage, name: &str) -> Result<CloneTicket> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let overlay = self.overlay_path(name);
        if tokio::fs::metadata(&overlay).await.is_ok() {
            return Err(Error::conflict(format!(
                "qemu instance {:?} already has a disk",
                name
            )));
        }
        self.create_overlay(base.snapshot_ref(), &overlay).await?;
        let vm = VmSpec {
            overlay: overlay.clone(),
            memory_mb: DEFAULT_MEMORY_MB,
            cpus: 1,
        };
        if let Err(err) =
            tokio::fs::write(self.spec_path(name), serde_json::to_string(&vm)?).await
        {
            // roll the overlay back rather than leave an orphaned disk
            let _ = tokio::fs::remove_file(&overlay).await;
            return Err(err.into());
        }

        // overlay starts at metadata size only; that is the CoW dividend
        let bytes_consumed = tokio::fs::metadata(&overlay).await.map(|m| m.len()).ok();
        Ok(CloneTicket {
            id: overlay.display().to_string(),
            bytes_consumed,
        })
    }

    async fn delete_base_snapshot(&self, base: &BaseImage) -> Result<()> {
        let path = PathBuf::from(base.snapshot_ref());
        if path.starts_with(&self.state_dir) {
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::exec::tests::MockExec;

    fn driver(mock: &MockExec, dir: &Path) -> QemuDriver {
        QemuDriver::new(Box::new(mock.clone())).with_state_dir(dir.to_path_buf())
    }

    #[tokio::test]
    async fn create_builds_an_overlay_and_persists_the_spec() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        let spec = crate::driver::CreateSpecBuilder::default()
            .name("vm-1")
            .image("/images/debian.qcow2")
            .memory_bytes(1024u64 * 1024 * 1024)
            .cpus(2.0)
            .build()
            .unwrap();

        let driver = driver(&mock, tmp.path());
        let id = driver.create(&spec).await.unwrap();
        assert!(id.ends_with("vm-1.qcow2"));
        assert_eq!(
            mock.call_lines()[0],
            format!(
                "qemu-img create -q -f qcow2 -F qcow2 -b /images/debian.qcow2 {}",
                tmp.path().join("vm-1.qcow2").display()
            )
        );

        let vm = driver.load_spec("vm-1").await.unwrap();
        assert_eq!(vm.memory_mb, 1024);
        assert_eq!(vm.cpus, 2);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        let driver = driver(&mock, tmp.path());
        std::fs::write(tmp.path().join("vm-1.qcow2"), b"disk").unwrap();

        let spec = crate::driver::CreateSpecBuilder::default()
            .name("vm-1")
            .image("/images/debian.qcow2")
            .build()
            .unwrap();
        let err = driver.create(&spec).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn start_uses_the_persisted_spec() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        let driver = driver(&mock, tmp.path());
        let overlay = tmp.path().join("vm-1.qcow2");
        let vm = VmSpec {
            overlay: overlay.clone(),
            memory_mb: 2048,
            cpus: 4,
        };
        std::fs::write(
            tmp.path().join("vm-1.json"),
            serde_json::to_string(&vm).unwrap(),
        )
        .unwrap();

        driver.start("vm-1").await.unwrap();
        let line = &mock.call_lines()[0];
        assert!(line.starts_with("qemu-system-x86_64 -name guest=vm-1 -m 2048 -smp 4"));
        assert!(line.contains(&format!("file={},format=qcow2,if=virtio", overlay.display())));
        assert!(line.contains("-daemonize"));
    }

    #[tokio::test]
    async fn clone_reports_overlay_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        let driver = driver(&mock, tmp.path());

        let registry = crate::base::BaseRegistry::default();
        let base = registry
            .register("b1", "/images/debian.qcow2", async {
                Ok((StorageKind::Qcow2, "/images/debian.qcow2".to_string()))
            })
            .await
            .unwrap();

        // the mock does not create files; fake the overlay the CLI would make
        std::fs::write(tmp.path().join("c1.qcow2"), vec![0u8; 196_608]).unwrap();
        let err = driver.clone_from_base(&base, "c1").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);

        let ticket = driver.clone_from_base(&base, "c2").await.unwrap();
        assert!(ticket.id.ends_with("c2.qcow2"));
        assert_eq!(
            mock.call_lines()[0],
            format!(
                "qemu-img create -q -f qcow2 -F qcow2 -b /images/debian.qcow2 {}",
                tmp.path().join("c2.qcow2").display()
            )
        );
    }

    #[tokio::test]
    async fn exec_is_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        let err = driver(&mock, tmp.path())
            .exec("vm-1", &["true".to_string()], ExecOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn remove_cleans_all_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        let driver = driver(&mock, tmp.path());
        let overlay = tmp.path().join("vm-1.qcow2");
        std::fs::write(&overlay, b"disk").unwrap();
        let vm = VmSpec {
            overlay: overlay.clone(),
            memory_mb: 512,
            cpus: 1,
        };
        std::fs::write(
            tmp.path().join("vm-1.json"),
            serde_json::to_string(&vm).unwrap(),
        )
        .unwrap();

        driver.remove("vm-1", false).await.unwrap();
        assert!(!overlay.exists());
        assert!(!tmp.path().join("vm-1.json").exists());
    }
}
