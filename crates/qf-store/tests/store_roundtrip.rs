use std::path::PathBuf;

use qf_core::{
    AnalysisRequest, Artifacts, BackendHandle, BackendKind, CalcName, CalcState, Calculation,
    WorkflowType,
};
use qf_store::{CalculationStore, Registry, StoreError};

fn calc(name: &str) -> Calculation {
    let mut calc = Calculation::new(
        CalcName::parse(name).unwrap(),
        WorkflowType::DdVmcg,
        Artifacts::new("/data/x.inp", "/data/x.op").with_database("/data/db"),
        PathBuf::from("/runs").join(name),
        BackendKind::Remote,
    );
    calc.analysis_requests
        .push(AnalysisRequest::parse("rdcheck etot").unwrap());
    calc
}

#[test]
fn record_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalculationStore::new(dir.path().join("records")).unwrap();

    let mut original = calc("dd1");
    original.apply_transition(CalcState::Submitted).unwrap();
    original.handle = Some(BackendHandle::new(BackendKind::Remote, "4711"));

    store.save(&original).unwrap();
    assert!(store.has_record("dd1"));
    assert_eq!(store.load("dd1").unwrap(), original);
}

#[test]
fn missing_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalculationStore::new(dir.path().to_path_buf()).unwrap();
    assert!(matches!(
        store.load("nope"),
        Err(StoreError::RecordNotFound { .. })
    ));
}

#[test]
fn registry_persists_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let records = dir.path().join("records");

    {
        let registry = Registry::open(CalculationStore::new(records.clone()).unwrap()).unwrap();
        registry.insert(calc("one")).unwrap();
        registry.insert(calc("two")).unwrap();
        registry
            .update("two", |c| c.apply_transition(CalcState::Submitted).map(|_| ()))
            .unwrap();
        registry.remove("one").unwrap();
    }

    let reopened = Registry::open(CalculationStore::new(records).unwrap()).unwrap();
    assert_eq!(reopened.len(), 1);
    let two = reopened.get("two").unwrap();
    assert_eq!(two.state, CalcState::Submitted);
    assert_eq!(two.history.len(), 1);
}

#[test]
fn corrupt_records_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalculationStore::new(dir.path().to_path_buf()).unwrap();
    store.save(&calc("good")).unwrap();
    std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();

    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name.as_str(), "good");
}

#[test]
fn stale_registry_never_replaces_a_terminal_record() {
    let dir = tempfile::tempdir().unwrap();
    let records = dir.path().join("records");
    let open = || Registry::open(CalculationStore::new(records.clone()).unwrap()).unwrap();

    let supervising = open();
    supervising.insert(calc("shared")).unwrap();
    supervising
        .update("shared", |c| {
            c.apply_transition(CalcState::Submitted)?;
            c.apply_transition(CalcState::Running).map(|_| ())
        })
        .unwrap();

    // A second process loads the running record and stops it.
    let other = open();
    other
        .update("shared", |c| c.apply_transition(CalcState::Stopped).map(|_| ()))
        .unwrap();

    // The supervising copy is still RUNNING in memory; finishing it is refused
    // and the stopped record is adopted instead.
    let (finished, adopted) = supervising
        .update_tracked("shared", |c| {
            if c.state.is_terminal() {
                return Ok(false);
            }
            c.apply_transition(CalcState::Finished).map(|_| true)
        })
        .unwrap();
    assert!(!finished);
    assert_eq!(adopted.len(), 1);
    assert_eq!(adopted[0].from, CalcState::Running);
    assert_eq!(adopted[0].to, CalcState::Stopped);
    assert_eq!(supervising.get("shared").unwrap().state, CalcState::Stopped);

    let on_disk = CalculationStore::new(records.clone()).unwrap().load("shared").unwrap();
    assert_eq!(on_disk.state, CalcState::Stopped);
    assert_eq!(on_disk.history.len(), 3);
}
