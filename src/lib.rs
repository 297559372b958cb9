//! midi-ci - MIDI 2.0 Capability Inquiry and Property Exchange engine
//!
//! Core request/reply engine for discovering, querying, mutating, and
//! observing configuration resources on musical instruments over a MIDI
//! transport: the SysEx-level CI codec, the Initiator (`PEManager`) and
//! Responder (`PEResponder`) sides of Property Exchange, device discovery
//! (`CiManager`), and a diagnostic trace ring buffer.

pub mod batch;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod manager;
pub mod muid;
pub mod resource;
pub mod responder;
pub mod trace;
pub mod transport;

pub use batch::{
    batch_get, batch_get_channel, batch_set, BatchOptions, BatchResult, ConditionalOutcome, ConditionalSet, Pipeline,
    Validator, ValidatorRegistry,
};
pub use codec::{CiMessage, CiMessageType, PeEnvelope, PeHeader};
pub use config::EngineConfig;
pub use discovery::{CiManager, DiscoveredDevice};
pub use error::{CiError, CiResult, CodecError};
pub use identity::{CategorySupport, DeviceIdentity, ManufacturerId};
pub use manager::{DestinationResolver, PEManager, PeResponse};
pub use muid::Muid;
pub use resource::{ComputedResource, InMemoryResource, ListResource, Resource, StaticResource};
pub use responder::PEResponder;
pub use trace::{global_trace, Direction, TraceBuffer, TraceEntry};
pub use transport::{DestinationId, Loopback, ReceivedFrame, SourceId, Transport, TransportError};
