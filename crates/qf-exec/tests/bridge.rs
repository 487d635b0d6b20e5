#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use qf_core::{Artifacts, BackendKind, CalcName, Calculation, WorkflowType};
use qf_exec::{CommandRemoteService, ExecError, JobDescriptor, RemoteConfig, RemoteService, RemoteStatus};

const BRIDGE: &str = r#"#!/bin/sh
case "$1" in
  submit) grep -q '"label": "br"' "$2" && echo job-42 ;;
  query) echo "FINISHED 0" ;;
  fetch) echo "/data/retrieved/$2" ;;
  cancel) echo "not allowed" >&2; exit 3 ;;
esac
"#;

fn service(dir: &std::path::Path) -> CommandRemoteService {
    let bridge = dir.join("bridge.sh");
    fs::write(&bridge, BRIDGE).unwrap();
    let mut perms = fs::metadata(&bridge).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&bridge, perms).unwrap();
    CommandRemoteService::new(bridge, dir.join("descriptors"))
}

#[tokio::test]
async fn bridge_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path());

    let calc = Calculation::new(
        CalcName::parse("br").unwrap(),
        WorkflowType::Mctdh,
        Artifacts::new("/in/a.inp", "/in/a.op"),
        PathBuf::from("/runs/br"),
        BackendKind::Remote,
    );
    let descriptor = JobDescriptor::for_calculation(&calc, &RemoteConfig::default());

    let job = service.submit(&descriptor).await.unwrap();
    assert_eq!(job, "job-42");
    assert!(
        dir.path()
            .join("descriptors")
            .join(format!("{}.json", descriptor.submission_id))
            .is_file()
    );

    assert_eq!(service.query(&job).await.unwrap(), RemoteStatus::Finished(Some(0)));
    assert_eq!(
        service.fetch(&job).await.unwrap(),
        PathBuf::from("/data/retrieved/job-42")
    );

    let err = service.cancel(&job).await.unwrap_err();
    assert!(matches!(err, ExecError::Remote(ref msg) if msg.contains("not allowed")));
}
