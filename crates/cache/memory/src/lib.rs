mod pubsub;
mod store;

pub use store::MemoryBackend;
