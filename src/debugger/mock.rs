// src/debugger/mock.rs
//
// Recording DebugSession used by unit tests.

use super::{DebugSession, DebuggerError, TabId, TargetInfo};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    Attach(TabId),
    Command(TabId, String, Value),
    Detach(TabId),
    ListTargets,
}

#[derive(Default)]
pub(crate) struct MockDebugger {
    calls: Mutex<Vec<Call>>,
    /// Tabs with a live session, as the browser would see them
    attached: Mutex<HashSet<TabId>>,
    attach_gate: Mutex<Option<Arc<Notify>>>,
    detach_gate: Mutex<Option<Arc<Notify>>>,
    attach_error: Mutex<Option<DebuggerError>>,
    attach_hangs: Mutex<bool>,
    detach_error: Mutex<Option<DebuggerError>>,
    command_errors: Mutex<HashMap<String, DebuggerError>>,
    targets: Mutex<Vec<TargetInfo>>,
}

impl MockDebugger {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub(crate) fn calls_for(&self, tab: &TabId) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| match call {
                Call::Attach(t) | Call::Detach(t) | Call::Command(t, _, _) => t == tab,
                Call::ListTargets => false,
            })
            .collect()
    }

    /// Methods sent to the tab, in call order
    pub(crate) fn methods_for(&self, tab: &TabId) -> Vec<String> {
        self.calls_for(tab)
            .into_iter()
            .filter_map(|call| match call {
                Call::Command(_, method, _) => Some(method),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn params_for(&self, tab: &TabId, method: &str) -> Option<Value> {
        self.calls_for(tab).into_iter().find_map(|call| match call {
            Call::Command(_, m, params) if m == method => Some(params),
            _ => None,
        })
    }

    pub(crate) fn attach_count(&self, tab: &TabId) -> usize {
        self.calls_for(tab)
            .iter()
            .filter(|c| matches!(c, Call::Attach(_)))
            .count()
    }

    pub(crate) fn detach_count(&self, tab: &TabId) -> usize {
        self.calls_for(tab)
            .iter()
            .filter(|c| matches!(c, Call::Detach(_)))
            .count()
    }

    /// Hold the next attach until the returned handle is notified.
    pub(crate) fn gate_next_attach(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.attach_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Hold the next detach until the returned handle is notified.
    pub(crate) fn gate_next_detach(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.detach_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub(crate) fn is_attached(&self, tab: &TabId) -> bool {
        self.attached.lock().unwrap().contains(tab)
    }

    pub(crate) fn fail_attach(&self, err: DebuggerError) {
        *self.attach_error.lock().unwrap() = Some(err);
    }

    pub(crate) fn hang_attach(&self) {
        *self.attach_hangs.lock().unwrap() = true;
    }

    pub(crate) fn fail_detach(&self, err: DebuggerError) {
        *self.detach_error.lock().unwrap() = Some(err);
    }

    pub(crate) fn fail_command(&self, method: &str, err: DebuggerError) {
        self.command_errors
            .lock()
            .unwrap()
            .insert(method.to_string(), err);
    }

    pub(crate) fn set_targets(&self, tabs: &[&str]) {
        *self.targets.lock().unwrap() = tabs
            .iter()
            .map(|t| TargetInfo {
                tab_id: TabId::from(*t),
                attached: false,
            })
            .collect();
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DebugSession for MockDebugger {
    async fn attach(&self, tab: &TabId, _protocol_version: &str) -> Result<(), DebuggerError> {
        self.record(Call::Attach(tab.clone()));
        let gate = self.attach_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let hangs = *self.attach_hangs.lock().unwrap();
        if hangs {
            std::future::pending::<()>().await;
        }
        if let Some(err) = self.attach_error.lock().unwrap().clone() {
            return Err(err);
        }
        if !self.attached.lock().unwrap().insert(tab.clone()) {
            return Err(DebuggerError::AlreadyAttached(tab.clone()));
        }
        Ok(())
    }

    async fn send_command(
        &self,
        tab: &TabId,
        method: &str,
        params: Value,
    ) -> Result<Value, DebuggerError> {
        self.record(Call::Command(tab.clone(), method.to_string(), params));
        match self.command_errors.lock().unwrap().get(method).cloned() {
            Some(err) => Err(err),
            None => Ok(Value::Null),
        }
    }

    async fn detach(&self, tab: &TabId) -> Result<(), DebuggerError> {
        self.record(Call::Detach(tab.clone()));
        let gate = self.detach_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.detach_error.lock().unwrap().clone() {
            return Err(err);
        }
        if self.attached.lock().unwrap().remove(tab) {
            Ok(())
        } else {
            Err(DebuggerError::NotAttached(tab.clone()))
        }
    }

    async fn list_targets(&self) -> Result<Vec<TargetInfo>, DebuggerError> {
        self.record(Call::ListTargets);
        Ok(self.targets.lock().unwrap().clone())
    }
}
