//! Live code redefinition
//!
//! [`LiveRedefiner`] replaces code units inside a running process through a
//! debugger-style connection. The connection itself is a capability
//! ([`VmConnector`] / [`VmSession`]) so the wire protocol stays outside this
//! crate.
//!
//! A redefinition is all-or-nothing: every unit is resolved before anything
//! is submitted, and the whole set goes out in one batch. Before attaching,
//! the breadcrumb recorded in the target (CRC-32 of the redefinition agent
//! that first attached in this process lifetime) is compared against the
//! current agent; a mismatch refuses the swap.

use crate::core::error::RedefineError;
use crate::core::units::CodeUnit;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Live in-process handle of a loaded unit
pub type UnitHandle = u64;

/// One element of a redefinition batch
#[derive(Debug, Clone)]
pub struct Redefinition {
    pub handle: UnitHandle,
    pub name: String,
    pub payload: Vec<u8>,
}

/// Opens sessions against a target process
pub trait VmConnector: Send + Sync {
    /// Agent checksum recorded in the target by a previous attach, if any.
    /// Must not attach.
    fn breadcrumb(&self, endpoint: &str) -> Result<Option<u32>, RedefineError>;

    fn attach(&self, endpoint: &str, timeout: Duration) -> Result<Box<dyn VmSession>, RedefineError>;
}

/// An attached debugger session
pub trait VmSession: Send {
    /// Record the current agent checksum in the target
    fn record_breadcrumb(&mut self, checksum: u32) -> Result<(), RedefineError>;

    /// Resolve a qualified unit name to its loaded representation
    fn resolve(&mut self, name: &str) -> Result<Option<UnitHandle>, RedefineError>;

    /// Apply the whole batch atomically, or nothing
    fn redefine(&mut self, batch: &[Redefinition]) -> Result<(), RedefineError>;
}

/// Result of a successful redefinition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedefineResult {
    pub units: Vec<String>,
    pub elapsed: Duration,
}

pub struct LiveRedefiner {
    connector: Arc<dyn VmConnector>,
    agent_checksum: u32,
    attach_timeout: Duration,
}

impl LiveRedefiner {
    /// `agent` is the redefinition agent image whose checksum guards reuse
    pub fn new(connector: Arc<dyn VmConnector>, agent: &[u8], attach_timeout: Duration) -> Self {
        LiveRedefiner {
            connector,
            agent_checksum: crc32fast::hash(agent),
            attach_timeout,
        }
    }

    pub fn agent_checksum(&self) -> u32 {
        self.agent_checksum
    }

    pub fn redefine(
        &self,
        endpoint: &str,
        units: &[CodeUnit],
    ) -> Result<RedefineResult, RedefineError> {
        let started = Instant::now();

        let recorded = self.connector.breadcrumb(endpoint)?;
        match recorded {
            Some(recorded) if recorded != 0 && recorded != self.agent_checksum => {
                warn!(
                    "Stale agent in {}: {:08x} != {:08x}",
                    endpoint, recorded, self.agent_checksum
                );
                return Err(RedefineError::StaleAgent {
                    recorded,
                    current: self.agent_checksum,
                });
            }
            _ => {}
        }

        let mut session = self.connector.attach(endpoint, self.attach_timeout)?;
        if !matches!(recorded, Some(r) if r != 0) {
            session.record_breadcrumb(self.agent_checksum)?;
        }

        let mut batch = Vec::with_capacity(units.len());
        for unit in units {
            let handle = session
                .resolve(&unit.name)?
                .ok_or_else(|| RedefineError::UnresolvedUnit(unit.name.clone()))?;
            batch.push(Redefinition {
                handle,
                name: unit.name.clone(),
                payload: unit.payload.clone(),
            });
        }
        debug!("Resolved {} units in {}", batch.len(), endpoint);

        session.redefine(&batch)?;

        info!("Redefined {} units in {}", batch.len(), endpoint);
        Ok(RedefineResult {
            units: batch.into_iter().map(|r| r.name).collect(),
            elapsed: started.elapsed(),
        })
    }
}

impl std::fmt::Debug for LiveRedefiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveRedefiner")
            .field("agent_checksum", &format_args!("{:08x}", self.agent_checksum))
            .field("attach_timeout", &self.attach_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::EntryId;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct State {
        breadcrumb: Option<u32>,
        attached: usize,
        applied: Vec<Vec<String>>,
    }

    struct FakeVm {
        state: Arc<Mutex<State>>,
        loaded: HashMap<String, UnitHandle>,
    }

    struct FakeSession {
        state: Arc<Mutex<State>>,
        loaded: HashMap<String, UnitHandle>,
    }

    impl VmConnector for FakeVm {
        fn breadcrumb(&self, _endpoint: &str) -> Result<Option<u32>, RedefineError> {
            Ok(self.state.lock().breadcrumb)
        }

        fn attach(
            &self,
            _endpoint: &str,
            _timeout: Duration,
        ) -> Result<Box<dyn VmSession>, RedefineError> {
            self.state.lock().attached += 1;
            Ok(Box::new(FakeSession {
                state: self.state.clone(),
                loaded: self.loaded.clone(),
            }))
        }
    }

    impl VmSession for FakeSession {
        fn record_breadcrumb(&mut self, checksum: u32) -> Result<(), RedefineError> {
            self.state.lock().breadcrumb = Some(checksum);
            Ok(())
        }

        fn resolve(&mut self, name: &str) -> Result<Option<UnitHandle>, RedefineError> {
            Ok(self.loaded.get(name).copied())
        }

        fn redefine(&mut self, batch: &[Redefinition]) -> Result<(), RedefineError> {
            self.state
                .lock()
                .applied
                .push(batch.iter().map(|r| r.name.clone()).collect());
            Ok(())
        }
    }

    fn vm(loaded: &[&str]) -> (Arc<FakeVm>, Arc<Mutex<State>>) {
        let state = Arc::new(Mutex::new(State::default()));
        let loaded = loaded
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i as UnitHandle))
            .collect();
        (
            Arc::new(FakeVm {
                state: state.clone(),
                loaded,
            }),
            state,
        )
    }

    fn unit(name: &str) -> CodeUnit {
        let entry = EntryId {
            name: "classes.units".to_string(),
            crc32: 1,
        };
        CodeUnit::new(name, entry, name.as_bytes().to_vec())
    }

    #[test]
    fn test_first_attach_records_breadcrumb() {
        let (connector, state) = vm(&["a.A", "a.B"]);
        let redefiner = LiveRedefiner::new(connector, b"agent-v1", Duration::from_secs(1));

        let result = redefiner.redefine("app", &[unit("a.A"), unit("a.B")]).unwrap();
        assert_eq!(result.units, vec!["a.A", "a.B"]);

        let state = state.lock();
        assert_eq!(state.breadcrumb, Some(crc32fast::hash(b"agent-v1")));
        assert_eq!(state.applied, vec![vec!["a.A".to_string(), "a.B".to_string()]]);
    }

    #[test]
    fn test_stale_breadcrumb_refuses_before_attach() {
        let (connector, state) = vm(&["a.A"]);
        state.lock().breadcrumb = Some(crc32fast::hash(b"agent-v0"));
        let redefiner = LiveRedefiner::new(connector, b"agent-v1", Duration::from_secs(1));

        let err = redefiner.redefine("app", &[unit("a.A")]).unwrap_err();
        assert!(matches!(err, RedefineError::StaleAgent { .. }));
        assert_eq!(state.lock().attached, 0);
        assert!(state.lock().applied.is_empty());
    }

    #[test]
    fn test_zero_breadcrumb_counts_as_unrecorded() {
        let (connector, state) = vm(&["a.A"]);
        state.lock().breadcrumb = Some(0);
        let redefiner = LiveRedefiner::new(connector, b"agent", Duration::from_secs(1));

        redefiner.redefine("app", &[unit("a.A")]).unwrap();
        assert_eq!(state.lock().breadcrumb, Some(crc32fast::hash(b"agent")));
    }

    #[test]
    fn test_unresolved_unit_applies_nothing() {
        let (connector, state) = vm(&["a.A"]);
        let redefiner = LiveRedefiner::new(connector, b"agent", Duration::from_secs(1));

        let err = redefiner
            .redefine("app", &[unit("a.A"), unit("a.Missing")])
            .unwrap_err();
        assert!(matches!(err, RedefineError::UnresolvedUnit(name) if name == "a.Missing"));
        assert!(state.lock().applied.is_empty());
    }
}
