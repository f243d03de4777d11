//! Process registry
//!
//! A process is a named graph of states. Each state maps the states it
//! may move to onto a [`Transition`]: a pre-condition, an action and a
//! post-condition, each an async function over a [`ZoneCtx`]. Processes
//! are built once at start-up and never change afterwards.

use std::collections::BTreeMap;
use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::engine::ZoneCtx;
use crate::errors::{MusicError, MusicResult};

pub mod add_signer;
pub mod checks;
pub mod remove_signer;

/// Terminal state of every process
pub const STOP: &str = "stop";
pub const ADD_SIGNER: &str = "add-signer";
pub const REMOVE_SIGNER: &str = "remove-signer";

/// A pre-condition, action or post-condition
pub type Check = for<'a> fn(&'a ZoneCtx) -> BoxFuture<'a, bool>;

#[derive(Clone, Copy)]
pub struct Transition {
    pub description: &'static str,
    /// Edge label in the diagnostics graph
    pub mermaid: &'static str,
    pub pre: Check,
    pub action: Check,
    pub post: Check,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("description", &self.description)
            .finish()
    }
}

/// Post-condition of transitions whose action cannot fail silently
pub fn always(_ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async { true })
}

/// Action of transitions that only wait for their pre-condition
pub fn proceed(_ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async { true })
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub to: &'static str,
    pub transition: Transition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessType {
    SingleRun,
    Permanent,
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessType::SingleRun => f.write_str("single-run"),
            ProcessType::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Process {
    pub name: &'static str,
    pub ptype: ProcessType,
    pub description: &'static str,
    pub initial: &'static str,
    /// States in declaration order, each with its outgoing edges
    states: Vec<(&'static str, Vec<Edge>)>,
}

impl Process {
    pub fn new(
        name: &'static str,
        ptype: ProcessType,
        description: &'static str,
        initial: &'static str,
    ) -> Process {
        Process {
            name,
            ptype,
            description,
            initial,
            states: vec![(initial, Vec::new())],
        }
    }

    fn state_mut(&mut self, state: &'static str) -> &mut Vec<Edge> {
        let pos = match self.states.iter().position(|(name, _)| *name == state) {
            Some(pos) => pos,
            None => {
                self.states.push((state, Vec::new()));
                self.states.len() - 1
            }
        };
        &mut self.states[pos].1
    }

    /// Adds the edge `from` → `to`.
    pub fn transition(mut self, from: &'static str, to: &'static str, transition: Transition) -> Process {
        self.state_mut(from).push(Edge { to, transition });
        self.state_mut(to);
        self
    }

    /// Closes the process with the `stop` → `stop` sink.
    fn finish(self) -> Process {
        self.transition(
            STOP,
            STOP,
            Transition {
                description: "Process complete",
                mermaid: "done",
                pre: always,
                action: proceed,
                post: always,
            },
        )
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|(name, _)| *name == state)
    }

    pub fn state_names(&self) -> Vec<&'static str> {
        self.states.iter().map(|(name, _)| *name).collect()
    }

    /// Outgoing edges of `state`; `None` if the state does not exist.
    pub fn next_states(&self, state: &str) -> Option<&[Edge]> {
        self.states
            .iter()
            .find(|(name, _)| *name == state)
            .map(|(_, edges)| edges.as_slice())
    }

    /// The process as a Mermaid `flowchart TD`.
    pub fn graph(&self) -> String {
        let mut out = String::from("flowchart TD\n");
        for (state, _) in &self.states {
            out.push_str(&format!("    {}[{}]\n", node_id(state), state));
        }
        for (state, edges) in &self.states {
            for edge in edges {
                if *state == STOP && edge.to == STOP {
                    continue;
                }
                out.push_str(&format!(
                    "    {} -->|\"{}\"| {}\n",
                    node_id(state),
                    edge.transition.mermaid,
                    node_id(edge.to)
                ));
            }
        }
        out
    }
}

fn node_id(state: &str) -> String {
    state.replace('-', "_")
}

/// Summary of a process for the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ptype: ProcessType,
    pub description: String,
    pub initial: String,
    pub states: Vec<String>,
}

/// All processes known to the engine, by name
#[derive(Debug, Clone, Default)]
pub struct Registry {
    processes: BTreeMap<&'static str, Process>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// The registry with the add-signer and remove-signer processes.
    pub fn standard() -> Registry {
        let mut registry = Registry::new();
        registry.register(add_signer::process());
        registry.register(remove_signer::process());
        registry
    }

    pub fn register(&mut self, process: Process) {
        let process = process.finish();
        log::debug!(
            "Process {} registered with {} states",
            process.name,
            process.states.len()
        );
        self.processes.insert(process.name, process);
    }

    pub fn get(&self, name: &str) -> Option<&Process> {
        self.processes.get(name)
    }

    pub fn require(&self, name: &str) -> MusicResult<&Process> {
        self.get(name)
            .ok_or_else(|| MusicError::validation(format!("process {} is unknown", name)))
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        self.processes
            .values()
            .map(|p| ProcessInfo {
                name: p.name.to_string(),
                ptype: p.ptype,
                description: p.description.to_string(),
                initial: p.initial.to_string(),
                states: p.state_names().iter().map(|s| s.to_string()).collect(),
            })
            .collect()
    }

    pub fn graph(&self, name: &str) -> MusicResult<String> {
        Ok(self.require(name)?.graph())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_processes() {
        let registry = Registry::standard();
        let names: Vec<String> = registry.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec![ADD_SIGNER.to_string(), REMOVE_SIGNER.to_string()]);

        for info in registry.list() {
            let process = registry.get(&info.name).unwrap();
            assert_eq!(process.ptype, ProcessType::SingleRun);
            assert!(process.has_state(process.initial));
            assert!(process.has_state(STOP));

            let sink = process.next_states(STOP).unwrap();
            assert_eq!(sink.len(), 1);
            assert_eq!(sink[0].to, STOP);

            // every non-terminal state has exactly one way forward
            for state in process.state_names() {
                if state != STOP {
                    assert_eq!(process.next_states(state).unwrap().len(), 1, "{}", state);
                }
            }
        }
        assert!(registry.require("key-roll").is_err());
    }

    #[test]
    fn test_add_signer_order() {
        let registry = Registry::standard();
        let process = registry.get(ADD_SIGNER).unwrap();
        assert_eq!(
            process.state_names(),
            vec![
                "signers-unsynced",
                "dnskeys-synced",
                "cds-added",
                "parent-ds-synced",
                "ds-propagated",
                "csync-added",
                "parent-ns-synced",
                STOP,
            ]
        );
    }

    #[test]
    fn test_remove_signer_order() {
        let registry = Registry::standard();
        let process = registry.get(REMOVE_SIGNER).unwrap();
        assert_eq!(
            process.state_names(),
            vec![
                "signers-unsynced",
                "nses-synced",
                "csync-added",
                "parent-ns-synced",
                "ns-propagated",
                "dnskeys-synced",
                "cds-added",
                "parent-ds-synced",
                STOP,
            ]
        );
    }

    #[test]
    fn test_graph() {
        let registry = Registry::standard();
        let graph = registry.graph(ADD_SIGNER).unwrap();
        assert!(graph.starts_with("flowchart TD\n"));
        assert!(graph.contains("    signers_unsynced[signers-unsynced]\n"));
        assert!(graph.contains("signers_unsynced -->|"));
        assert!(graph.contains("| dnskeys_synced\n"));
        assert!(!graph.contains("stop -->"));
        assert!(registry.graph("nope").is_err());
    }
}
