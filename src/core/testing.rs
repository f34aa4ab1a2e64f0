//! Test doubles shared by the orchestration unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::Result;
use crate::health::{HealthCheck, Probe};
use crate::host::Host;
use crate::notify::{Notification, Notifier};
use crate::ssh::{CommandOutput, RemoteExecutor};

type Handler = Box<dyn FnMut(&str, &str) -> CommandOutput + Send>;

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub host: String,
    pub command: String,
    pub content: Option<Vec<u8>>,
}

/// Executor whose responses come from a closure over (host id, command).
/// Uploads are presented to the handler as `upload <remote path>`.
pub(crate) struct FakeExecutor {
    handler: Mutex<Handler>,
    calls: Mutex<Vec<Call>>,
}

impl FakeExecutor {
    pub fn new(handler: impl FnMut(&str, &str) -> CommandOutput + Send + 'static) -> Self {
        Self {
            handler: Mutex::new(Box::new(handler)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(|_, _| CommandOutput::ok(""))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    fn dispatch(&self, host: &Host, command: &str, content: Option<&[u8]>) -> CommandOutput {
        self.calls.lock().unwrap().push(Call {
            host: host.id.clone(),
            command: command.to_string(),
            content: content.map(|c| c.to_vec()),
        });
        let mut handler = self.handler.lock().unwrap();
        (handler)(&host.id, command)
    }
}

impl RemoteExecutor for FakeExecutor {
    fn execute(&self, host: &Host, command: &str) -> Result<CommandOutput> {
        Ok(self.dispatch(host, command, None))
    }

    fn upload(&self, host: &Host, content: &[u8], remote_path: &str) -> Result<CommandOutput> {
        Ok(self.dispatch(host, &format!("upload {}", remote_path), Some(content)))
    }
}

/// Probe answering from per-check queues, falling back to a default.
pub(crate) struct ScriptedProbe {
    queues: Mutex<HashMap<String, VecDeque<bool>>>,
    default: bool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn passing() -> Self {
        Self::with_default(true)
    }

    pub fn with_default(default: bool) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            default,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue results for the named check; once drained the default applies.
    pub fn script(self, check: &str, results: &[bool]) -> Self {
        self.queues
            .lock()
            .unwrap()
            .insert(check.to_string(), results.iter().copied().collect());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Probe for ScriptedProbe {
    fn probe(&self, check: &HealthCheck) -> Result<bool> {
        self.calls.lock().unwrap().push(check.name.clone());
        let mut queues = self.queues.lock().unwrap();
        Ok(queues
            .get_mut(&check.name)
            .and_then(|q| q.pop_front())
            .unwrap_or(self.default))
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.event.to_string())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        self.sent.lock().unwrap().push(notification.clone());
    }
}

pub(crate) fn remote_host(id: &str) -> Host {
    Host {
        id: id.to_string(),
        address: format!("{}.internal", id),
        user: "root".to_string(),
        port: 22,
        identity_file: None,
    }
}

pub(crate) fn local_host(id: &str) -> Host {
    Host {
        id: id.to_string(),
        address: "localhost".to_string(),
        user: "root".to_string(),
        port: 22,
        identity_file: None,
    }
}
