//! Insertion-ordered set of the processes a supervisor run manages.
//!
//! Membership is fixed once built. A slot's entity is swapped only by restart,
//! which holds that slot's lock for the whole stop-and-replace sequence.

use std::sync::Arc;

use anyhow::{bail, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::process::{Process, ProcessSpec};

struct Slot {
    name: String,
    current: RwLock<Arc<Process>>,
    restart: Mutex<()>,
}

pub struct Registry {
    slots: Vec<Slot>,
}

impl Registry {
    /// Builds the registry from parsed specs, keeping only the names in `only`
    /// when it is non-empty. List order is preserved.
    pub fn build<F>(specs: Vec<ProcessSpec>, only: &[String], mut make: F) -> Result<Self>
    where
        F: FnMut(ProcessSpec) -> Process,
    {
        for name in only {
            if !specs.iter().any(|spec| &spec.name == name) {
                warn!(process = %name, "requested process is not in the process list");
            }
        }
        let processes = specs
            .into_iter()
            .filter(|spec| only.is_empty() || only.contains(&spec.name))
            .map(&mut make)
            .collect();
        Self::new(processes)
    }

    pub fn new(processes: Vec<Process>) -> Result<Self> {
        let mut slots: Vec<Slot> = Vec::with_capacity(processes.len());
        for process in processes {
            if slots.iter().any(|slot| slot.name == process.name()) {
                bail!("duplicate process name: {}", process.name());
            }
            slots.push(Slot {
                name: process.name().to_string(),
                current: RwLock::new(Arc::new(process)),
                restart: Mutex::new(()),
            });
        }
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.name.as_str())
    }

    pub fn max_name_len(&self) -> usize {
        self.names().map(str::len).max().unwrap_or(0)
    }

    fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|slot| slot.name == name)
    }

    /// Current entity registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Process>> {
        self.slot(name).map(|slot| Arc::clone(&slot.current.read()))
    }

    /// Current entities in registry order.
    pub fn snapshot(&self) -> Vec<Arc<Process>> {
        self.slots
            .iter()
            .map(|slot| Arc::clone(&slot.current.read()))
            .collect()
    }

    /// Takes the exclusive restart lock of one slot.
    pub async fn lock(&self, name: &str) -> Option<SlotGuard<'_>> {
        let slot = self.slot(name)?;
        let guard = slot.restart.lock().await;
        Some(SlotGuard {
            slot,
            _guard: guard,
        })
    }

    pub fn all_terminal(&self) -> bool {
        self.snapshot()
            .iter()
            .all(|process| process.status().is_terminal())
    }

    /// Resolves once every current entity is terminal.
    pub async fn wait_all_terminal(&self) {
        let processes = self.snapshot();
        join_all(processes.iter().map(|process| process.wait_terminal())).await;
    }
}

/// Exclusive access to one slot while it is being restarted.
pub struct SlotGuard<'a> {
    slot: &'a Slot,
    _guard: MutexGuard<'a, ()>,
}

impl SlotGuard<'_> {
    pub fn current(&self) -> Arc<Process> {
        Arc::clone(&self.slot.current.read())
    }

    /// Puts `process` into the slot and hands it back shared.
    pub fn replace(&self, process: Process) -> Arc<Process> {
        let process = Arc::new(process);
        *self.slot.current.write() = Arc::clone(&process);
        process
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::testing::FakeHost;
    use crate::mux::{Multiplexer, SessionId};
    use crate::process::tests::spec;
    use crate::process::ProcessStatus;

    fn build(names: &[&str], only: &[&str]) -> Result<Registry> {
        let host: Arc<dyn Multiplexer> = Arc::new(FakeHost::new());
        let session = SessionId::generate("test");
        let specs = names.iter().map(|name| spec(name, "true")).collect();
        let only: Vec<String> = only.iter().map(|name| name.to_string()).collect();
        Registry::build(specs, &only, |spec| {
            Process::new(spec, session.clone(), Arc::clone(&host))
        })
    }

    #[test]
    fn keeps_list_order() {
        let registry = build(&["web", "worker", "clock"], &[]).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["web", "worker", "clock"]);
        assert_eq!(registry.max_name_len(), 6);
    }

    #[test]
    fn filters_by_allow_list_in_list_order() {
        let registry = build(&["web", "worker", "clock"], &["clock", "web", "ghost"]).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["web", "clock"]);
        assert!(registry.get("worker").is_none());
    }

    #[test]
    fn rejects_duplicates() {
        assert!(build(&["web", "web"], &[]).is_err());
    }

    #[tokio::test]
    async fn replace_keeps_slot_and_count() {
        let registry = build(&["web", "worker"], &[]).unwrap();
        let before = registry.get("web").unwrap();
        let worker = registry.get("worker").unwrap();

        {
            let guard = registry.lock("web").await.unwrap();
            let fresh = guard.current().renew();
            let fresh = guard.replace(fresh);
            assert!(Arc::ptr_eq(&fresh, &registry.get("web").unwrap()));
        }

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), ["web", "worker"]);
        assert!(!Arc::ptr_eq(&before, &registry.get("web").unwrap()));
        assert!(Arc::ptr_eq(&worker, &registry.get("worker").unwrap()));
        assert!(registry.lock("ghost").await.is_none());
    }

    #[tokio::test]
    async fn all_terminal_after_stopping_pending() {
        let registry = build(&["web", "worker"], &[]).unwrap();
        assert!(!registry.all_terminal());
        for process in registry.snapshot() {
            process.stop();
        }
        assert!(registry.all_terminal());
        registry.wait_all_terminal().await;
        assert_eq!(
            registry.get("web").unwrap().status(),
            ProcessStatus::Killed
        );
    }
}
