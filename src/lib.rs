//! Dawn - distributed voice-assistant fabric
//!
//! A central daemon brokers speech, text and audio between browser clients
//! and remote satellite devices:
//! - Session lifecycle with cryptographic reconnect tokens and timed reaping
//! - Worker-pool dispatch with per-session ordering and cooperative cancel
//! - Bounded cross-thread response queue feeding the socket I/O loop
//! - Lock-free SPSC audio pipeline with pause-acknowledge playback
//! - Satellite voice loop: VAD, wake word, ASR, streaming sentence TTS
//!
//! # Example
//!
//! ```ignore
//! use dawn::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     dawn::server::start(config).await
//! }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod satellite;
pub mod server;
pub mod session;
pub mod types;
pub mod voice;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::ErrorCode;
pub use protocol::{BinaryFrame, BinaryKind, ClientMessage, ServerMessage};
pub use session::{Session, SessionRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
