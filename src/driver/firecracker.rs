//! Firecracker microVMs via `firectl`.
//!
//! A microVM is a kernel plus an ext4 rootfs. Instances get their own rootfs
//! produced with `cp --reflink=auto`, which is copy-on-write on reflink
//! filesystems, and run as a detached `firectl` process tracked by pidfile.
//! No guest agent is in scope, so exec and file transfer are `unsupported`.

use crate::{
    base::{BaseImage, StorageKind},
    driver::{
        classify_failure,
        exec::{Exec, ExecOpts},
        CloneTicket, CreateSpec, Driver, DriverKind, ProbeInfo,
    },
    error::{Error, Result},
};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_MEMORY_MB: u64 = 128;

#[derive(Debug)]
pub struct FirecrackerDriver {
    binary: PathBuf,
    kernel: PathBuf,
    exec: Box<dyn Exec>,
    state_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct MicroVmSpec {
    rootfs: PathBuf,
    memory_mb: u64,
    cpus: u64,
}

impl FirecrackerDriver {
    pub fn new(exec: Box<dyn Exec>) -> Self {
        let state_dir = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".corral")
            .join("firecracker");
        let kernel = std::env::var("CORRAL_FIRECRACKER_KERNEL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("vmlinux"));
        Self {
            binary: PathBuf::from("firectl"),
            kernel,
            exec,
            state_dir,
        }
    }

    #[cfg(test)]
    fn with_state_dir(mut self, state_dir: PathBuf) -> Self {
        self.state_dir = state_dir;
        self
    }

    fn rootfs_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.ext4", name))
    }

    fn spec_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", name))
    }

    fn pidfile_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.pid", name))
    }

    async fn load_spec(&self, name: &str) -> Result<MicroVmSpec> {
        let raw = tokio::fs::read_to_string(self.spec_path(name))
            .await
            .map_err(|_| Error::not_found(format!("no firecracker instance named {:?}", name)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Reflink copy of a rootfs; falls back to a real copy on filesystems
    /// without reflink support.
    async fn copy_rootfs(&self, source: &str, dest: &Path) -> Result<()> {
        let args = vec![
            "--reflink=auto".to_string(),
            source.to_string(),
            dest.display().to_string(),
        ];
        let output = self.exec.run(Path::new("cp"), &args, ExecOpts::default()).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_failure(DriverKind::Firecracker, "copy rootfs", &output))
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
impl Driver for FirecrackerDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Firecracker
    }

    fn stdin_capable(&self) -> bool {
        false
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

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let rootfs = self.rootfs_path(spec.name());
        if tokio::fs::metadata(&rootfs).await.is_ok() {
            return Err(Error::conflict(format!(
                "firecracker instance {:?} already has a rootfs",
                spec.name()
            )));
        }
        self.copy_rootfs(spec.image(), &rootfs).await?;

        let vm = MicroVmSpec {
            rootfs: rootfs.clone(),
            memory_mb: match spec.memory_bytes() {
                0 => DEFAULT_MEMORY_MB,
                bytes => (bytes / (1024 * 1024)).max(1),
            },
            cpus: match spec.cpus() {
                c if c > 0.0 => c.ceil() as u64,
                _ => 1,
            },
        };
        tokio::fs::write(self.spec_path(spec.name()), serde_json::to_string(&vm)?).await?;
        info!("Created firecracker rootfs {}", rootfs.display());
        Ok(rootfs.display().to_string())
    }

    async fn start(&self, name: &str) -> Result<()> {
        if let Some(pid) = self.read_pid(name).await {
            if Self::signal(pid, 0) {
                return Ok(());
            }
        }
        let vm = self.load_spec(name).await?;
        let log = self.state_dir.join(format!("{}.log", name));
        // firectl has no daemon mode; detach it and capture the pid
        let detach = format!(
            "setsid {} --kernel={} --root-drive={} --ncpus={} --memory={} </dev/null >{} 2>&1 & echo $!",
            self.binary.display(),
            self.kernel.display(),
            vm.rootfs.display(),
            vm.cpus,
            vm.memory_mb,
            log.display(),
        );
        let output = self
            .exec
            .run(
                Path::new("sh"),
                &["-c".to_string(), detach],
                ExecOpts::default(),
            )
            .await?;
        if !output.success() {
            return Err(classify_failure(DriverKind::Firecracker, "start", &output));
        }
        tokio::fs::write(self.pidfile_path(name), output.stdout.trim()).await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        match self.read_pid(name).await {
            Some(pid) => {
                Self::signal(pid, libc::SIGTERM);
                let _ = tokio::fs::remove_file(self.pidfile_path(name)).await;
                Ok(())
            }
            None => self.load_spec(name).await.map(|_| ()),
        }
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        if let Some(pid) = self.read_pid(name).await {
            if Self::signal(pid, 0) && !force {
                return Err(Error::conflict(format!(
                    "firecracker instance {:?} is running; stop it or pass force=true",
                    name
                )));
            }
            Self::signal(pid, libc::SIGKILL);
        }
        let vm = self.load_spec(name).await?;
        let _ = tokio::fs::remove_file(&vm.rootfs).await;
        let _ = tokio::fs::remove_file(self.pidfile_path(name)).await;
        let _ = tokio::fs::remove_file(self.state_dir.join(format!("{}.log", name))).await;
        tokio::fs::remove_file(self.spec_path(name)).await?;
        Ok(())
    }

    async fn snapshot_base(&self, source: &str, _base_name: &str) -> Result<(StorageKind, String)> {
        let backing = match self.load_spec(source).await {
            Ok(vm) => vm.rootfs.display().to_string(),
            Err(_) if Path::new(source).exists() => source.to_string(),
            Err(err) => return Err(err),
        };
        Ok((StorageKind::Template, backing))
    }

    async fn clone_from_base(&self, base: &BaseImage, name: &str) -> Result<CloneTicket> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let rootfs = self.rootfs_path(name);
        if tokio::fs::metadata(&rootfs).await.is_ok() {
            return Err(Error::conflict(format!(
                "firecracker instance {:?} already has a rootfs",
                name
            )));
        }
        self.copy_rootfs(base.snapshot_ref(), &rootfs).await?;
        let vm = MicroVmSpec {
            rootfs: rootfs.clone(),
            memory_mb: DEFAULT_MEMORY_MB,
            cpus: 1,
        };
        if let Err(err) =
            tokio::fs::write(self.spec_path(name), serde_json::to_string(&vm)?).await
        {
            let _ = tokio::fs::remove_file(&rootfs).await;
            return Err(err.into());
        }
        Ok(CloneTicket {
            id: rootfs.display().to_string(),
            // reflink copies report apparent size, not blocks; no number
            bytes_consumed: None,
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

    fn driver(mock: &MockExec, dir: &Path) -> FirecrackerDriver {
        FirecrackerDriver::new(Box::new(mock.clone())).with_state_dir(dir.to_path_buf())
    }

    #[tokio::test]
    async fn create_reflinks_the_rootfs() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        let spec = crate::driver::CreateSpecBuilder::default()
            .name("mv-1")
            .image("/images/alpine.ext4")
            .build()
            .unwrap();
        driver(&mock, tmp.path()).create(&spec).await.unwrap();
        assert_eq!(
            mock.call_lines()[0],
            format!(
                "cp --reflink=auto /images/alpine.ext4 {}",
                tmp.path().join("mv-1.ext4").display()
            )
        );
    }

    #[tokio::test]
    async fn start_detaches_and_records_the_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        mock.push_ok("4242\n");
        let driver = driver(&mock, tmp.path());
        let vm = MicroVmSpec {
            rootfs: tmp.path().join("mv-1.ext4"),
            memory_mb: 128,
            cpus: 1,
        };
        std::fs::write(
            tmp.path().join("mv-1.json"),
            serde_json::to_string(&vm).unwrap(),
        )
        .unwrap();

        driver.start("mv-1").await.unwrap();
        let line = &mock.call_lines()[0];
        assert!(line.starts_with("sh -c setsid firectl --kernel="));
        assert!(line.contains("--ncpus=1 --memory=128"));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("mv-1.pid")).unwrap(),
            "4242"
        );
    }

    #[tokio::test]
    async fn exec_is_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        let err = driver(&mock, tmp.path())
            .exec("mv-1", &["true".to_string()], ExecOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn stop_without_state_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        let err = driver(&mock, tmp.path()).stop("ghost").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
