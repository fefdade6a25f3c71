//! Toggleable union of authenticators
//!
//! The registry maps names to evaluators, each enabled or disabled. Every
//! change rebuilds an immutable [`UnionAuthenticator`] from the enabled
//! entries (in registration order) and swaps it into place, so request
//! handling never takes a lock and never sees a half-applied change.
//!
//! # Background Tasks
//!
//! Once [`AuthenticatorRegistry::run`] has been called, each enabled entry
//! that declares a trust refresher has exactly one refresh task. Rebuilds
//! reconcile the task set:
//!
//! - disabled or replaced entries have their task cancelled
//! - newly enabled entries get a task, started only after any previous task
//!   for the same name has exited
//! - unchanged entries keep their task
//!
//! # Usage
//!
//! ```rust,ignore
//! let registry = AuthenticatorRegistry::new();
//! registry.add("x509", x509.evaluator(), true);
//! registry.add("tokenreview", Evaluator::new(token_review), false);
//! registry.run(cancel.clone(), 2)?;
//!
//! registry.set_enabled("tokenreview", true)?;
//! let identity = registry.authenticate(&parts).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use aperture_common::UserIdentity;
use aperture_pki::CaBundle;
use arc_swap::ArcSwap;
use http::request::Parts;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::authenticator::{Evaluator, TrustRefresher};
use crate::error::{AuthError, Result};

/// Snapshot of the enabled evaluators
#[derive(Debug, Default)]
pub struct UnionAuthenticator {
    members: Vec<(String, Evaluator)>,
}

impl UnionAuthenticator {
    /// Try members in order; the first identity wins
    ///
    /// When nobody authenticates the request, member errors are aggregated
    /// into one `Unauthorized` error. With no errors either the request is
    /// simply unauthenticated (`Ok(None)`).
    pub async fn authenticate(&self, request: &Parts) -> Result<Option<UserIdentity>> {
        let mut errors = Vec::new();
        for (name, evaluator) in &self.members {
            match evaluator.authenticator().authenticate(request).await {
                Ok(Some(identity)) => {
                    debug!(authenticator = %name, username = %identity.username, "request authenticated");
                    return Ok(Some(identity));
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(authenticator = %name, error = %e, "authenticator rejected request");
                    errors.push(format!("{}: {}", name, e));
                }
            }
        }

        if errors.is_empty() {
            Ok(None)
        } else {
            Err(AuthError::Unauthorized(errors.join("; ")))
        }
    }

    /// Union of the members' client CA bundles
    pub fn ca_bundle(&self) -> CaBundle {
        let bundles: Vec<CaBundle> = self
            .members
            .iter()
            .filter_map(|(_, e)| e.ca_provider())
            .map(|p| p.ca_bundle())
            .collect();
        CaBundle::merge(&bundles)
    }

    /// Names of the members, in evaluation order
    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|(n, _)| n.clone()).collect()
    }
}

struct Entry {
    name: String,
    enabled: bool,
    evaluator: Evaluator,
    generation: u64,
}

struct RefreshTask {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct RunContext {
    parent: CancellationToken,
    workers: usize,
    runtime: Handle,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<Entry>,
    tasks: HashMap<String, RefreshTask>,
    run: Option<RunContext>,
    next_generation: u64,
}

/// Named authenticators that can be enabled and disabled while serving
pub struct AuthenticatorRegistry {
    state: Mutex<RegistryState>,
    effective: ArcSwap<UnionAuthenticator>,
}

impl AuthenticatorRegistry {
    /// Empty registry; authenticates nobody
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            effective: ArcSwap::from_pointee(UnionAuthenticator::default()),
        }
    }

    /// Register an evaluator, replacing any previous one with the same name
    ///
    /// A replaced entry keeps its position in the evaluation order.
    pub fn add(&self, name: impl Into<String>, evaluator: Evaluator, enabled: bool) {
        let name = name.into();
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        match state.entries.iter().position(|e| e.name == name) {
            Some(index) => {
                info!(authenticator = %name, enabled, "replacing authenticator");
                let entry = &mut state.entries[index];
                entry.enabled = enabled;
                entry.evaluator = evaluator;
                entry.generation = generation;
            }
            None => {
                info!(authenticator = %name, enabled, "registering authenticator");
                state.entries.push(Entry {
                    name,
                    enabled,
                    evaluator,
                    generation,
                });
            }
        }
        self.rebuild(&mut state);
    }

    /// Enable or disable a registered evaluator
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| AuthError::NotFound(name.to_string()))?;
        if entry.enabled != enabled {
            info!(authenticator = %name, enabled, "toggling authenticator");
            entry.enabled = enabled;
        }
        self.rebuild(&mut state);
        Ok(())
    }

    /// `(name, enabled)` for every entry, in registration order
    pub fn entries(&self) -> Vec<(String, bool)> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| (e.name.clone(), e.enabled))
            .collect()
    }

    /// Current union snapshot
    pub fn snapshot(&self) -> Arc<UnionAuthenticator> {
        self.effective.load_full()
    }

    /// Authenticate with the enabled evaluators
    pub async fn authenticate(&self, request: &Parts) -> Result<Option<UserIdentity>> {
        let snapshot = self.effective.load_full();
        snapshot.authenticate(request).await
    }

    /// Client CA bundle of the enabled CA-providing evaluators
    pub fn client_ca_certificates(&self) -> CaBundle {
        self.effective.load().ca_bundle()
    }

    /// Start background refresh for enabled evaluators
    ///
    /// Tasks run under children of `cancel`. Must be called from within a
    /// Tokio runtime, and only once.
    pub fn run(&self, cancel: CancellationToken, workers: usize) -> Result<()> {
        let runtime = Handle::try_current().map_err(|e| AuthError::Runtime(e.to_string()))?;
        let mut state = self.state.lock();
        if state.run.is_some() {
            return Err(AuthError::AlreadyRunning);
        }
        info!(workers, "starting authenticator background tasks");
        state.run = Some(RunContext {
            parent: cancel,
            workers: workers.max(1),
            runtime,
        });
        self.rebuild(&mut state);
        Ok(())
    }

    /// Names with a live refresh task, sorted
    pub fn running_tasks(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .tasks
            .iter()
            .filter(|(_, t)| !t.cancel.is_cancelled())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    fn rebuild(&self, state: &mut RegistryState) {
        let members = state
            .entries
            .iter()
            .filter(|e| e.enabled)
            .map(|e| (e.name.clone(), e.evaluator.clone()))
            .collect();
        self.effective
            .store(Arc::new(UnionAuthenticator { members }));
        Self::reconcile_tasks(state);
    }

    fn reconcile_tasks(state: &mut RegistryState) {
        let Some(run) = &state.run else {
            return;
        };
        if run.parent.is_cancelled() {
            return;
        }

        let wanted: Vec<(String, u64, Arc<dyn TrustRefresher>)> = state
            .entries
            .iter()
            .filter(|e| e.enabled)
            .filter_map(|e| {
                e.evaluator
                    .trust_refresher()
                    .map(|r| (e.name.clone(), e.generation, r.clone()))
            })
            .collect();

        let stale: Vec<String> = state
            .tasks
            .iter()
            .filter(|(name, task)| {
                !wanted
                    .iter()
                    .any(|(n, generation, _)| n == *name && *generation == task.generation)
            })
            .map(|(name, _)| name.clone())
            .collect();

        // Cancel first so a replacement never overlaps its predecessor
        let mut previous: HashMap<String, JoinHandle<()>> = HashMap::new();
        for name in stale {
            if let Some(task) = state.tasks.remove(&name) {
                debug!(authenticator = %name, "stopping trust refresh");
                task.cancel.cancel();
                previous.insert(name, task.handle);
            }
        }

        for (name, generation, refresher) in wanted {
            if state.tasks.contains_key(&name) {
                continue;
            }
            let cancel = run.parent.child_token();
            let prior = previous.remove(&name);
            let task_name = name.clone();
            let task_cancel = cancel.clone();
            let workers = run.workers;
            let handle = run.runtime.spawn(async move {
                if let Some(prior) = prior {
                    let _ = prior.await;
                }
                if task_cancel.is_cancelled() {
                    return;
                }
                debug!(authenticator = %task_name, "starting trust refresh");
                refresher.run(workers, task_cancel).await;
                debug!(authenticator = %task_name, "trust refresh exited");
            });
            state.tasks.insert(
                name,
                RefreshTask {
                    generation,
                    cancel,
                    handle,
                },
            );
        }
    }
}

impl Default for AuthenticatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
