//! Cluster health evaluation engine: selector index, job dispatch, liveness
//! evaluation and status aggregation. Nothing in here talks to the API
//! server directly; collaborators are injected through traits.

pub mod aggregator;
pub mod deployer;
pub mod dispatcher;
pub mod evaluator;
pub mod index;
pub mod selector;
pub mod set;

pub use aggregator::{ClusterEntryState, DeliveryOutcome};
pub use deployer::{FeatureId, JobKey, JobResult, WorkerPool};
pub use dispatcher::{DispatchState, Dispatcher};
pub use evaluator::{AddonStatusSource, Evaluation, Evaluator, HealthReportSource};
pub use index::{IndexUpdate, Labels, PolicyRegistration, SelectorIndex};
pub use selector::{Selector, SelectorError};
pub use set::{ClusterRef, HealthDefRef, ObjectKey, ObjectSet, PolicyRef};
