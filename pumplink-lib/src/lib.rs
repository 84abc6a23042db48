pub mod alerts;
pub mod auth;
pub mod checksum;
pub mod constants;
pub mod crypto;
pub mod device;
pub mod error;
pub mod history;
pub mod message;
pub mod packet;
pub mod poller;
pub mod safety;
pub mod status;
pub mod transport;

// Re-export the session types for easy access
pub use device::PumpSession;
pub use error::PumpError;
pub use poller::{PollConfig, Poller, ReadingSink};
pub use safety::{LimitsHandle, SafetyLimits};
pub use transport::{ChunkTransport, ConnectionState};
