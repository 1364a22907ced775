//! slave-core: concurrent message dispatch engine and embedded-script VM pool
//! for a game worker process.

pub mod codec;
pub mod dispatcher;
pub mod framer;
pub mod metrics;
pub mod pool;
pub mod storage;
pub mod transport;
pub mod types;

pub(crate) mod bridge;
pub(crate) mod vm;

pub mod control;
pub mod supervisor;

pub use codec::{Codec, JsonCodec};
pub use pool::InterpreterPool;
pub use storage::{NullStorage, RemoteStorage, Storage};
pub use supervisor::Worker;
pub use transport::{ChannelTransport, Dest, Transport};
pub use types::{Message, ProtocolError, ScriptError, SlaveSettings, StartupError, TransportError, Value};
