#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use qf_core::{Artifacts, BackendHandle, BackendKind, CalcName, Calculation, WorkflowType};
use qf_exec::{ExecError, ExecutionBackend, JobStatus, LocalBackend, LocalConfig, LogStream};

const INPUT: &str = "RUN-SECTION\n  name = ho_out\nend-run-section\nOPERATOR-SECTION\n  opname = ho\nend-operator-section\n";

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("ho.inp"), INPUT).unwrap();
        fs::write(root.join("ho.op"), "OPERATOR\n").unwrap();
        Self { _dir: dir, root }
    }

    fn backend(&self, body: &str) -> LocalBackend {
        let solver = write_script(&self.root, "fake_quantics", body);
        LocalBackend::new(LocalConfig {
            solver: solver.to_string_lossy().into_owned(),
            extra_args: Vec::new(),
            log_capacity: 100,
        })
    }

    fn calc(&self, name: &str) -> Calculation {
        Calculation::new(
            CalcName::parse(name).unwrap(),
            WorkflowType::Mctdh,
            Artifacts::new(self.root.join("ho.inp"), self.root.join("ho.op")),
            self.root.join("runs").join(name),
            BackendKind::Local,
        )
    }
}

const POLL: Duration = Duration::from_millis(20);

#[tokio::test]
async fn successful_run_reports_output() {
    let fx = Fixture::new();
    let backend = fx.backend(
        "echo \"args $1 $2\"\n\
         echo \"Total energy 1.25\"\n\
         echo 'note' >&2\n\
         test -f ho.op || exit 9\n\
         mkdir -p ho_out && touch ho_out/output ho_out/log\n\
         exit 0",
    );
    let calc = fx.calc("ok");

    let handle = backend.submit(&calc).await.unwrap();
    assert_eq!(handle.kind, BackendKind::Local);
    assert_eq!(backend.wait(&handle, POLL).await.unwrap(), JobStatus::Succeeded);
    assert_eq!(backend.poll(&handle).await.unwrap(), JobStatus::Succeeded);

    let output = backend.fetch_output(&handle).await.unwrap();
    assert_eq!(output.directory, calc.working_directory.join("ho_out"));
    assert_eq!(output.files, vec!["log", "output"]);
    assert_eq!(output.total_energy, Some(1.25));

    let log = fs::read_to_string(calc.working_directory.join("quantics.log")).unwrap();
    assert!(log.contains("Total energy 1.25"));

    let logs = backend.logs(&handle).unwrap();
    let mut cursor = logs.cursor();
    let mut stdout = Vec::new();
    while let Some(line) = cursor.next().await {
        if line.stream == LogStream::Stdout {
            stdout.push(line.text);
        }
    }
    assert_eq!(stdout, vec!["args -mnd input.inp", "Total energy 1.25"]);
    assert_eq!(logs.tail(LogStream::Stderr, 5), vec!["note"]);
}

#[tokio::test]
async fn nonzero_exit_fails_with_stderr_tail() {
    let fx = Fixture::new();
    let backend = fx.backend("echo 'boom: bad basis' >&2\nexit 1");
    let handle = backend.submit(&fx.calc("bad")).await.unwrap();

    assert_eq!(backend.wait(&handle, POLL).await.unwrap(), JobStatus::Failed);
    let detail = backend.failure_detail(&handle).await.unwrap();
    assert_eq!(detail.exit_code, Some(1));
    assert!(detail.message.contains("boom: bad basis"), "{}", detail.message);
}

#[tokio::test]
async fn missing_solver_is_a_submission_error() {
    let fx = Fixture::new();
    let backend = LocalBackend::new(LocalConfig {
        solver: fx.root.join("no_such_solver").to_string_lossy().into_owned(),
        ..LocalConfig::default()
    });
    let err = backend.submit(&fx.calc("nosolver")).await.unwrap_err();
    assert!(matches!(err, ExecError::Submission(_)), "{err}");
}

#[tokio::test]
async fn cancel_kills_running_job() {
    let fx = Fixture::new();
    let backend = fx.backend("exec sleep 30");
    let handle = backend.submit(&fx.calc("long")).await.unwrap();

    assert_eq!(backend.poll(&handle).await.unwrap(), JobStatus::Running);
    assert!(matches!(
        backend.fetch_output(&handle).await,
        Err(ExecError::NotReady(_))
    ));

    backend.cancel(&handle).await.unwrap();
    assert_eq!(backend.poll(&handle).await.unwrap(), JobStatus::Failed);
    assert!(matches!(backend.cancel(&handle).await, Err(ExecError::Cancel(_))));
    assert!(backend.fetch_output(&handle).await.is_ok());
}

/// Reaped, or a zombie waiting for its reaper.
#[cfg(target_os = "linux")]
fn process_gone(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next()) == Some("Z"),
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn cancel_reaches_background_children() {
    use std::time::Instant;

    let fx = Fixture::new();
    let backend = fx.backend("sleep 30 &
echo $! > helper.pid
echo started
wait");
    let calc = fx.calc("wrapper");
    let handle = backend.submit(&calc).await.unwrap();
    assert!(handle.pid.is_some());

    let pid_file = calc.working_directory.join("helper.pid");
    let deadline = Instant::now() + Duration::from_secs(5);
    let helper = loop {
        if let Ok(text) = fs::read_to_string(&pid_file)
            && let Ok(pid) = text.trim().parse::<u32>()
        {
            break pid;
        }
        assert!(Instant::now() < deadline, "wrapper never started its helper");
        tokio::time::sleep(POLL).await;
    };

    let started = Instant::now();
    backend.cancel(&handle).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2), "cancel took {:?}", started.elapsed());
    assert_eq!(backend.poll(&handle).await.unwrap(), JobStatus::Failed);

    let deadline = Instant::now() + Duration::from_secs(2);
    while !process_gone(helper) {
        assert!(Instant::now() < deadline, "helper {helper} survived the cancel");
        tokio::time::sleep(POLL).await;
    }
}

#[tokio::test]
async fn jobs_are_tracked_independently_of_pids() {
    let fx = Fixture::new();
    let backend = fx.backend("mkdir -p ho_out && touch ho_out/output");
    let first = backend.submit(&fx.calc("first")).await.unwrap();
    let second = backend.submit(&fx.calc("second")).await.unwrap();
    assert_ne!(first.token, second.token);
    assert_ne!(Some(first.token.clone()), first.pid.map(|pid| pid.to_string()));

    assert_eq!(backend.wait(&first, POLL).await.unwrap(), JobStatus::Succeeded);
    assert_eq!(backend.wait(&second, POLL).await.unwrap(), JobStatus::Succeeded);

    // Releasing one job leaves the other reachable, even when it reuses a pid.
    let mut reused = first.clone();
    reused.pid = second.pid;
    backend.release(&reused);
    assert!(matches!(
        backend.poll(&first).await,
        Err(ExecError::UnknownHandle(_))
    ));
    assert_eq!(backend.poll(&second).await.unwrap(), JobStatus::Succeeded);
    assert!(backend.fetch_output(&second).await.is_ok());
    assert!(backend.logs(&second).is_some());
}

#[tokio::test]
async fn unknown_handle() {
    let backend = LocalBackend::new(LocalConfig::default());
    let handle = BackendHandle::new(BackendKind::Local, "999999");
    assert!(matches!(
        backend.poll(&handle).await,
        Err(ExecError::UnknownHandle(_))
    ));
}
