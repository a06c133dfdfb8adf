//! Identity atoms for the routing graph.
//!
//! NodeName: a routing instance
//! PortName: one endpoint of an entangled pair, scoped to its node
//!
//! Both are 128-bit values expected to be globally unique with overwhelming
//! probability. The nil value is the invalid sentinel and never names a live
//! node or port.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(Uuid);

impl NodeName {
    pub const INVALID: NodeName = NodeName(Uuid::nil());

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_nil()
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName({})", self.0)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NodeName {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<NodeName> for Uuid {
    fn from(name: NodeName) -> Uuid {
        name.0
    }
}

/// Port identifier.
///
/// Port names are minted by the embedder's generator when a port is created
/// and again each time a port is transferred; the name is the routing address,
/// so a transferred port gets a fresh one at its new home.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortName(Uuid);

impl PortName {
    pub const INVALID: PortName = PortName(Uuid::nil());

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_nil()
    }
}

impl fmt::Debug for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortName({})", self.0)
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for PortName {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<PortName> for Uuid {
    fn from(name: PortName) -> Uuid {
        name.0
    }
}
