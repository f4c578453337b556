/*
 * 5D Labs Agent Platform - Cluster Health Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Cluster health controller library
//!
//! Matches `HealthPolicy` selectors against the cluster fleet, evaluates
//! liveness checks per matched cluster on a bounded worker pool and folds the
//! results into each policy's status, delivering notifications once a cluster
//! turns healthy.

pub mod capability;
pub mod config;
pub mod crds;
pub mod engine;
pub mod error;
pub mod reconcile;

// Re-export commonly used types
pub use config::ControllerConfig;
pub use crds::{HealthPolicy, HealthPolicySpec, HealthPolicyStatus};
pub use error::{Error, Result};
pub use reconcile::{run_health_controller, Engine};
