//! User messages: payload plus any ports being transferred alongside it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::event::PortDescriptor;
use super::name::PortName;

/// An application message exchanged between two entangled ports.
///
/// `ports` and `descriptors` are parallel arrays: slot *i* of `ports` holds
/// the name a carried port will bear at its destination and slot *i* of
/// `descriptors` holds everything needed to rebuild it there. The embedder
/// fills `ports` with the names of local ports it wants to transfer; the
/// sending node rewrites each slot to the freshly minted destination name
/// while filling the descriptor.
///
/// `sequence_num` of zero means "not yet stamped"; the sending port assigns
/// the stamp and proxies preserve it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    sequence_num: u64,
    ports: Vec<PortName>,
    descriptors: Vec<PortDescriptor>,
    payload: Bytes,
}

impl UserMessage {
    /// A message with no carried ports.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self::with_port_slots(payload.into(), 0)
    }

    /// A message with `num_ports` unfilled port slots.
    pub fn with_port_slots(payload: Bytes, num_ports: usize) -> Self {
        Self {
            sequence_num: 0,
            ports: vec![PortName::INVALID; num_ports],
            descriptors: vec![PortDescriptor::invalid(); num_ports],
            payload,
        }
    }

    /// A message carrying the named local ports.
    pub fn with_ports(payload: impl Into<Bytes>, ports: Vec<PortName>) -> Self {
        let descriptors = vec![PortDescriptor::invalid(); ports.len()];
        Self {
            sequence_num: 0,
            ports,
            descriptors,
            payload: payload.into(),
        }
    }

    pub fn sequence_num(&self) -> u64 {
        self.sequence_num
    }

    pub(crate) fn set_sequence_num(&mut self, sequence_num: u64) {
        self.sequence_num = sequence_num;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn ports(&self) -> &[PortName] {
        &self.ports
    }

    /// Name a local port to transfer in slot `index`.
    pub fn set_port(&mut self, index: usize, name: PortName) {
        self.ports[index] = name;
    }

    pub(crate) fn descriptor(&self, index: usize) -> &PortDescriptor {
        &self.descriptors[index]
    }

    pub(crate) fn set_slot(&mut self, index: usize, name: PortName, descriptor: PortDescriptor) {
        self.ports[index] = name;
        self.descriptors[index] = descriptor;
    }
}
