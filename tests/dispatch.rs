//! Integration coverage for the public dispatch surface: a custom driver is
//! injected through the library API, exactly as an embedder would.

use async_trait::async_trait;
use corral::{
    cancellation,
    driver::{CreateSpec, Driver, DriverKind, ExecOpts, ExecOutput, ProbeInfo},
    engine::EngineOptions,
    Engine, ErrorKind, SecurityPolicy,
};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

#[derive(Debug, Default)]
struct RecordingDriver {
    created: Mutex<Vec<String>>,
}

#[async_trait]
impl Driver for RecordingDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Docker
    }

    async fn probe(&self) -> corral::Result<ProbeInfo> {
        Ok(ProbeInfo {
            available: true,
            version: Some("recording 1.0".to_string()),
        })
    }

    async fn create(&self, spec: &CreateSpec) -> corral::Result<String> {
        self.created.lock().unwrap().push(spec.name().clone());
        Ok(format!("id-{}", spec.name()))
    }

    async fn start(&self, _name: &str) -> corral::Result<()> {
        Ok(())
    }

    async fn stop(&self, _name: &str) -> corral::Result<()> {
        Ok(())
    }

    async fn remove(&self, _name: &str, _force: bool) -> corral::Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        _name: &str,
        command: &[String],
        _opts: ExecOpts,
    ) -> corral::Result<ExecOutput> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("ran: {}\n", command.join(" ")),
            stderr: String::new(),
        })
    }
}

fn engine() -> (Engine, Arc<RecordingDriver>) {
    let engine = Engine::new(SecurityPolicy::default(), EngineOptions::default()).unwrap();
    let driver = Arc::new(RecordingDriver::default());
    engine.inject_driver(DriverKind::Docker, driver.clone());
    (engine, driver)
}

#[tokio::test]
async fn embedder_driver_round_trip() {
    let (engine, driver) = engine();

    let created = engine
        .dispatch("docker", "create image=debian:stable name=web-1")
        .await;
    assert!(created.success);
    assert_eq!(created.fields["id"], json!("id-web-1"));
    assert_eq!(driver.created.lock().unwrap().as_slice(), ["web-1"]);

    engine.dispatch("docker", "start name=web-1").await;
    let exec = engine
        .dispatch("docker", "exec name=web-1 command=\"echo hi\"")
        .await;
    assert!(exec.success);
    assert_eq!(exec.fields["stdout"], json!("ran: sh -c echo hi\n"));

    let removed = engine.dispatch("docker", "remove name=web-1").await;
    assert!(removed.success);
    let listed = engine.dispatch("docker", "list").await;
    assert_eq!(listed.fields["count"], json!(0));
}

#[tokio::test]
async fn unsupported_capability_surfaces_cleanly() {
    let (engine, _driver) = engine();
    engine.dispatch("docker", "create image=i name=web-1").await;
    engine.dispatch("docker", "start name=web-1").await;

    // RecordingDriver does not implement logs; the default body answers
    let logs = engine.dispatch("docker", "logs name=web-1").await;
    assert!(!logs.success);
    assert_eq!(logs.error_kind, Some(ErrorKind::Unsupported));
}

#[tokio::test]
async fn cancelled_dispatch_reports_cancelled() {
    let (engine, driver) = engine();
    let (handle, token) = cancellation();
    handle.cancel();

    let result = engine
        .dispatch_with(
            "docker",
            "create image=debian:stable name=web-1",
            &HashMap::new(),
            None,
            Some(token),
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    assert!(driver.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn results_serialize_for_the_wire() {
    let (engine, _driver) = engine();
    let result = engine.dispatch("docker", "status").await;
    let wire = serde_json::to_string(&result).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&wire).unwrap();
    assert_eq!(parsed["success"], json!(true));
    assert_eq!(parsed["available"], json!(true));
    assert_eq!(parsed["version"], json!("recording 1.0"));
}
