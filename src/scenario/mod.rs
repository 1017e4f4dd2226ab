//! Multi-node scenarios on the in-process network.
//!
//! Everything a scenario needs travels through a `HarnessContext`: the
//! fault parameters, the shared `VirtualNetwork` and the list of sessions
//! to tear down at the end. Nothing here is global, so two scenarios can
//! run side by side in one process.

pub mod context;
pub mod subnet;

pub use context::{HarnessContext, TestParams};
pub use subnet::{MockSubnet, MockSubnetConfig, NodeType, Reserve};

use crate::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Duplicate host {0} in subnet config")]
    DuplicateHost(String),

    #[error("Host {0} not in subnet config")]
    UnknownHost(String),

    #[error("Node {0} does not exist")]
    NodeNotFound(String),

    #[error("Node {0} is not a gov node")]
    NotGovNode(String),

    #[error("Topology check failed: {0}")]
    Check(String),

    #[error(transparent)]
    Setup(#[from] AppError),
}
