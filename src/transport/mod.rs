//! Transport Layer
//!
//! Encrypted, ordered channels between the orchestrator and participants,
//! parameterized by a pluggable wire protocol.
//!
//! - `traits`: the `WireProtocol` abstraction
//! - `memory` / `tcp`: in-process and TCP protocols
//! - `channel`: AES-256-GCM sealing, ordering, heartbeats, lifecycle
//! - `codec`: top-k and LZ4 payload compression
//! - `frame`: application messages
//! - `hub`: channel table and delivery/failure events

pub mod channel;
pub mod codec;
pub mod frame;
pub mod hub;
pub mod memory;
pub mod tcp;
pub mod traits;

pub use channel::{ChannelRole, ConnectionState, SecureChannel};
pub use codec::{CodecError, CompressionCodec};
pub use frame::{Frame, TrainingTask};
pub use hub::{TransportEvent, TransportHub};
pub use memory::MemoryProtocol;
pub use tcp::{TcpAcceptor, TcpProtocol};
pub use traits::{TransportError, TransportResult, WireProtocol};
