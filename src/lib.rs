//! funcsync - push a directory tree into a remote target over one byte
//! stream, sending only what changed.
//!
//! The sender publishes a manifest of its tree; the receiver answers with
//! block signatures of the files it already holds and full-content requests
//! for the rest; the sender streams back deltas and file data, multiplexed
//! by stream id over the same connection.
//!
//! ```no_run
//! # async fn demo() -> funcsync::Result<()> {
//! use funcsync::{receive_files, send_files, DirEnumerator, SessionConfig};
//!
//! let (client, server) = tokio::io::duplex(64 * 1024);
//! let config = SessionConfig::default();
//! let (sent, received) = tokio::join!(
//!     send_files(client, DirEnumerator::new("src"), &config),
//!     receive_files(server, std::path::Path::new("dst"), &config),
//! );
//! println!("{} files sent", sent?.files_transferred());
//! received?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod delta;
pub mod error;
pub mod server;
pub mod streaming;
pub mod transport;

pub use config::SessionConfig;
pub use error::{Error, FileError, FileErrorKind, RemoteError, Result};
pub use streaming::{receive_files, send_files, DirEnumerator, FileEnumerator, SessionReport};
