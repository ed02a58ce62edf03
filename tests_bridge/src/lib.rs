//! Bridge Scenario Utilities
//!
//! Shared setup for the multi-process scenarios under `tests/`.
//!
//! ## Test Philosophy
//!
//! - **Real threads for real blocking**: A process that must answer while
//!   another one sits in `send_sync` runs on its own OS thread
//! - **One thread when possible**: Everything else interleaves bridges on the
//!   test thread and pumps them by hand, which keeps ordering deterministic
//! - **Terminate to stop**: Process threads serve until the host terminates
//!   them, exactly like a real process

use core_types::{ProcessRef, ProcessRole};
use message_bridge::{BridgeConfig, MessageBridge};
use sim_host::{HostConfig, ProcessHost};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Creates a host with default settings
pub fn test_host() -> Arc<ProcessHost> {
    Arc::new(ProcessHost::default())
}

/// Creates a host with custom settings, e.g. a small inbox capacity
pub fn test_host_with(config: HostConfig) -> Arc<ProcessHost> {
    Arc::new(ProcessHost::new(config))
}

/// Spawns a process and builds its bridge on the current thread
pub fn local_bridge(host: &Arc<ProcessHost>, role: ProcessRole) -> MessageBridge {
    local_bridge_with(host, role, BridgeConfig::default())
}

pub fn local_bridge_with(
    host: &Arc<ProcessHost>,
    role: ProcessRole,
    config: BridgeConfig,
) -> MessageBridge {
    MessageBridge::new(host.spawn(role), config).expect("Failed to create bridge")
}

/// Pumps every bridge until none of them has anything left to do
pub fn settle(bridges: &[&MessageBridge]) {
    for _ in 0..64 {
        let mut handled = 0;
        for bridge in bridges {
            handled += bridge.pump().expect("Failed to pump bridge");
        }
        if handled == 0 {
            return;
        }
    }
    panic!("bridges did not settle");
}

/// A process served by its own thread
pub struct ProcessThread {
    pub process: ProcessRef,
    host: Arc<ProcessHost>,
    handle: Option<JoinHandle<()>>,
}

impl ProcessThread {
    /// Terminates the process and waits for its thread to finish
    pub fn stop(mut self) {
        self.host.terminate(self.process);
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("Process thread panicked");
        }
    }
}

impl Drop for ProcessThread {
    fn drop(&mut self) {
        self.host.terminate(self.process);
        if !thread::panicking() {
            self.join();
        }
    }
}

/// Starts a process on a new thread
///
/// `setup` registers handlers on the fresh bridge; the thread then serves
/// traffic until the process is terminated. Messages sent before `setup`
/// finishes simply wait in the inbox.
pub fn spawn_process<F>(host: &Arc<ProcessHost>, role: ProcessRole, setup: F) -> ProcessThread
where
    F: FnOnce(&MessageBridge) + Send + 'static,
{
    let endpoint = host.spawn(role);
    let process = endpoint.process;
    let handle = thread::Builder::new()
        .name(format!("{}-{}", role, process))
        .spawn(move || {
            let bridge = MessageBridge::new(endpoint, BridgeConfig::default())
                .expect("Failed to create bridge");
            setup(&bridge);
            if let Err(error) = bridge.run() {
                tracing::warn!(%process, %error, "process loop ended with error");
            }
        })
        .expect("Failed to spawn process thread");

    ProcessThread {
        process,
        host: Arc::clone(host),
        handle: Some(handle),
    }
}
