//! Authoritative table of calculations keyed by name.
//!
//! The outer lock guards membership; each calculation sits behind its own
//! mutex so updates to one name never block another. When a store is
//! attached, every committed mutation is persisted before it becomes visible,
//! and a record advanced on disk by another process is adopted before any
//! update is applied, so a terminal state written elsewhere is never replaced.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use qf_core::{Calculation, CoreError, CoreResult, StateChange};
use tracing::info;

use crate::store::CalculationStore;
use crate::{StoreError, StoreResult};

type Entry = Arc<Mutex<Calculation>>;

#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<BTreeMap<String, Entry>>,
    store: Option<CalculationStore>,
}

impl Registry {
    /// In-memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backed by `store`, pre-populated with every record it holds.
    pub fn open(store: CalculationStore) -> StoreResult<Self> {
        let entries = store
            .list()?
            .into_iter()
            .map(|calc| (calc.name.to_string(), Arc::new(Mutex::new(calc))))
            .collect();
        Ok(Self {
            entries: RwLock::new(entries),
            store: Some(store),
        })
    }

    fn entry(&self, name: &str) -> StoreResult<Entry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(name.to_string()).into())
    }

    fn persist(&self, calc: &Calculation) -> StoreResult<()> {
        match &self.store {
            Some(store) => store.save(calc),
            None => Ok(()),
        }
    }

    /// Register a new calculation; names are unique for the registry's lifetime.
    pub fn insert(&self, calc: Calculation) -> StoreResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = calc.name.to_string();
        if entries.contains_key(&key) {
            return Err(CoreError::DuplicateName(key).into());
        }
        self.persist(&calc)?;
        entries.insert(key, Arc::new(Mutex::new(calc)));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(name)
    }

    /// Snapshot of one calculation.
    pub fn get(&self, name: &str) -> StoreResult<Calculation> {
        let entry = self.entry(name)?;
        let calc = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(calc.clone())
    }

    /// Apply `f` to a working copy and commit it only if `f` succeeds.
    ///
    /// The per-entry lock is held for the whole call, so updates to a single
    /// calculation are totally ordered.
    pub fn update<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Calculation) -> CoreResult<R>,
    ) -> StoreResult<R> {
        self.update_tracked(name, f).map(|(out, _)| out)
    }

    /// `update`, also returning the transitions adopted from a newer record
    /// on disk before `f` ran.
    pub fn update_tracked<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Calculation) -> CoreResult<R>,
    ) -> StoreResult<(R, Vec<StateChange>)> {
        let entry = self.entry(name)?;
        let mut calc = entry.lock().unwrap_or_else(PoisonError::into_inner);
        let adopted = self.adopt_newer_record(&mut calc)?;
        let mut draft = calc.clone();
        let out = f(&mut draft)?;
        if draft != *calc {
            self.persist(&draft)?;
            *calc = draft;
        }
        Ok((out, adopted))
    }

    /// Replace `calc` with its stored record when that record has moved further
    /// through the state machine.
    fn adopt_newer_record(&self, calc: &mut Calculation) -> StoreResult<Vec<StateChange>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        if calc.state.is_terminal() {
            return Ok(Vec::new());
        }
        let stored = match store.load(calc.name.as_str()) {
            Ok(stored) => stored,
            Err(StoreError::RecordNotFound { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        if stored.history.len() <= calc.history.len() {
            return Ok(Vec::new());
        }

        let adopted = stored.history[calc.history.len()..].to_vec();
        info!(calc = %calc.name, state = %stored.state, "adopting record advanced by another process");
        *calc = stored;
        Ok(adopted)
    }

    /// Snapshots of every calculation, sorted by name.
    pub fn list(&self) -> Vec<Calculation> {
        self.filter(|_| true)
    }

    pub fn filter(&self, mut keep: impl FnMut(&Calculation) -> bool) -> Vec<Calculation> {
        let entries: Vec<Entry> = {
            let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            map.values().cloned().collect()
        };
        entries
            .iter()
            .filter_map(|entry| {
                let calc = entry.lock().unwrap_or_else(PoisonError::into_inner);
                keep(&calc).then(|| calc.clone())
            })
            .collect()
    }

    /// Remove the calculation if `allow` accepts it, deleting its record.
    pub fn remove_if(
        &self,
        name: &str,
        allow: impl FnOnce(&Calculation) -> CoreResult<()>,
    ) -> StoreResult<Calculation> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Core(CoreError::NotFound(name.to_string())))?;
        let calc = entry.lock().unwrap_or_else(PoisonError::into_inner).clone();
        allow(&calc)?;
        if let Some(store) = &self.store {
            store.delete(name)?;
        }
        entries.remove(name);
        Ok(calc)
    }

    pub fn remove(&self, name: &str) -> StoreResult<Calculation> {
        self.remove_if(name, |_| Ok(()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
