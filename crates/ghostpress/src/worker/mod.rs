pub mod channel;
pub mod context;
pub mod protocol;

pub use channel::WorkerCompressor;
pub use context::CompressorFactory;
pub use protocol::{WorkerEvent, WorkerMessage, WorkerRequest};
