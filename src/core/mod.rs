//! Domain layer: identity atoms, events, messages, and the per-port record.

pub mod error;
pub mod event;
pub mod message;
pub mod message_queue;
pub mod name;
pub mod port;

pub use error::{PortError, Result};
pub use event::{Event, EventData, ObserveProxy, PortDescriptor};
pub use message::UserMessage;
pub use message_queue::{MessageQueue, INITIAL_SEQUENCE_NUM, INVALID_SEQUENCE_NUM};
pub use name::{NodeName, PortName};
pub use port::{Port, PortRef, PortState, PortStatus, UserData};
