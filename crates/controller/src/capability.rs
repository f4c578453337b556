//! Cluster API capability detection.
//!
//! Whether the Cluster API `Cluster` CRD is installed decides which watches
//! the controller registers at startup. The answer is taken once; if the
//! definition later appears, changes generation or disappears, the process
//! asks to be restarted instead of re-registering watches live.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crds::{CAPI_CLUSTER_CRD_NAME, CAPI_GROUP};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Cluster API not installed: only `ManagedCluster`s are watched
    Absent,
    /// Cluster API installed: CAPI `Cluster`s are watched too
    Present,
}

/// Result of the startup probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub capability: Capability,
    /// `metadata.generation` of the CRD when present
    pub generation: Option<i64>,
}

/// Lookup of the Cluster API `Cluster` CRD
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrdLookup: Send + Sync {
    /// `Ok(None)` when the CRD is not installed, otherwise its generation
    async fn capi_cluster_crd(&self) -> Result<Option<i64>>;
}

/// Requests a supervised restart of the hosting process
#[cfg_attr(test, automock)]
pub trait ProcessControl: Send + Sync {
    /// # Errors
    /// Returns an error when the restart request could not be issued.
    fn request_restart(&self, reason: &str) -> Result<()>;
}

pub struct KubeCrdLookup {
    api: Api<CustomResourceDefinition>,
}

impl KubeCrdLookup {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CrdLookup for KubeCrdLookup {
    async fn capi_cluster_crd(&self) -> Result<Option<i64>> {
        let crd = self.api.get_opt(CAPI_CLUSTER_CRD_NAME).await?;
        Ok(crd.map(|crd| crd.metadata.generation.unwrap_or_default()))
    }
}

/// Sends SIGTERM to the own process; the shutdown handler turns it into an
/// orderly exit and the pod supervisor restarts the container.
pub struct SignalProcessControl;

impl ProcessControl for SignalProcessControl {
    fn request_restart(&self, reason: &str) -> Result<()> {
        error!(reason = %reason, "🔄 Cluster API capability changed, restarting controller");
        // SAFETY: kill(2) on our own pid with a valid signal number has no
        // memory-safety preconditions.
        let rc = unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::Signal(std::io::Error::last_os_error()))
        }
    }
}

/// Probe for the Cluster API CRD, retrying lookup errors with a fixed
/// backoff. When every attempt fails the capability is assumed `Absent`.
pub async fn detect_capability(
    lookup: &dyn CrdLookup,
    max_attempts: u32,
    backoff: Duration,
) -> Detection {
    for attempt in 1..=max_attempts.max(1) {
        match lookup.capi_cluster_crd().await {
            Ok(Some(generation)) => {
                info!(generation, "Cluster API detected");
                return Detection {
                    capability: Capability::Present,
                    generation: Some(generation),
                };
            }
            Ok(None) => {
                info!("Cluster API not installed");
                return Detection {
                    capability: Capability::Absent,
                    generation: None,
                };
            }
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "Failed to look up Cluster API CRD");
                if attempt < max_attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    warn!("Cluster API detection exhausted its attempts, assuming it is absent");
    Detection {
        capability: Capability::Absent,
        generation: None,
    }
}

/// What happened to the watched definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrdEvent {
    Applied {
        group: String,
        generation: Option<i64>,
        /// Part of the initial (re)list
        initial: bool,
    },
    Deleted {
        group: String,
    },
}

impl CrdEvent {
    /// Translate a watcher event; list markers carry no object and map to `None`
    #[must_use]
    pub fn from_watch(event: watcher::Event<CustomResourceDefinition>) -> Option<Self> {
        match event {
            watcher::Event::Apply(crd) => Some(Self::Applied {
                group: crd.spec.group,
                generation: crd.metadata.generation,
                initial: false,
            }),
            watcher::Event::InitApply(crd) => Some(Self::Applied {
                group: crd.spec.group,
                generation: crd.metadata.generation,
                initial: true,
            }),
            watcher::Event::Delete(crd) => Some(Self::Deleted {
                group: crd.spec.group,
            }),
            watcher::Event::Init | watcher::Event::InitDone => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Restart(String),
}

/// Restart decision state machine fed with definition events
#[derive(Debug, Clone)]
pub struct CapabilityWatcher {
    capability: Capability,
    generation: Option<i64>,
}

impl CapabilityWatcher {
    #[must_use]
    pub fn new(detection: Detection) -> Self {
        Self {
            capability: detection.capability,
            generation: detection.generation,
        }
    }

    #[must_use]
    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn observe(&mut self, event: &CrdEvent) -> Decision {
        let group = match event {
            CrdEvent::Applied { group, .. } | CrdEvent::Deleted { group } => group,
        };
        if group != CAPI_GROUP {
            return Decision::Continue;
        }

        match (self.capability, event) {
            (Capability::Absent, CrdEvent::Applied { .. }) => {
                Decision::Restart("Cluster API was installed".to_string())
            }
            (Capability::Absent, CrdEvent::Deleted { .. }) => Decision::Continue,
            (Capability::Present, CrdEvent::Deleted { .. }) => {
                Decision::Restart("Cluster API was removed".to_string())
            }
            (Capability::Present, CrdEvent::Applied { generation, initial, .. }) => {
                match (self.generation, generation) {
                    (None, Some(_)) if *initial => {
                        self.generation = *generation;
                        Decision::Continue
                    }
                    (current, observed) if current == *observed => Decision::Continue,
                    (current, observed) => Decision::Restart(format!(
                        "Cluster API definition changed (generation {current:?} -> {observed:?})"
                    )),
                }
            }
        }
    }
}

/// Watch the Cluster API CRD until a restart is requested or `shutdown` fires
pub async fn run_capability_watcher(
    client: Client,
    mut state: CapabilityWatcher,
    process: Arc<dyn ProcessControl>,
    shutdown: CancellationToken,
) {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let config = watcher::Config::default().fields(&format!("metadata.name={CAPI_CLUSTER_CRD_NAME}"));
    let mut events = watcher(api, config).default_backoff().boxed();

    info!(capability = ?state.capability(), "Watching Cluster API definition");

    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => return,
            next = events.next() => next,
        };

        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(error = %e, "Cluster API definition watch error");
                continue;
            }
            None => return,
        };

        let Some(event) = CrdEvent::from_watch(event) else {
            continue;
        };
        debug!(event = ?event, "Cluster API definition event");

        if let Decision::Restart(reason) = state.observe(&event) {
            if let Err(e) = process.request_restart(&reason) {
                error!(error = %e, "Failed to request controller restart");
            }
            return;
        }
    }
}
