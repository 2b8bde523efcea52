//! Streaming sync sessions.
//!
//! One session pushes a tree from a sender to a receiver over a single
//! bidirectional byte stream. After the version handshake the sender
//! publishes the manifest; from then on both directions carry framed
//! messages tagged with the stream id of the file they belong to.
//!
//! # Architecture
//!
//! ```text
//! Sender                                   Receiver
//! +-------------+   manifest               +-------------+
//! | generator   | -----------------------> | planner     |
//! +-------------+                          +-------------+
//!                   signature / request           |
//! +-------------+ <----------------------- +-------------+
//! | worker pool |                          | writer      |
//! +-------------+                          +-------------+
//!       |           delta / fileData
//! +-------------+ -----------------------> +-------------+
//! | writer      |                          | demux       |
//! +-------------+                          +-------------+
//! ```
//!
//! Each direction ends with an end-of-exchange marker. The receiver sends its
//! marker once every request is out; the sender answers with its own once
//! every request has been served.

pub mod channel;
pub mod generator;
pub mod manifest;
pub mod mux;
pub mod protocol;
pub mod receiver;
pub mod reconstruct;
pub mod sender;

pub use channel::{chunk_queue, Chunk, ChunkSender, ChunkWriter, SessionReport};
pub use generator::{generate_manifest, DirEnumerator, FileEnumerator, LocalManifest, WalkEntry};
pub use manifest::{read_manifest, write_manifest, FileInfo, FileMode};
pub use mux::{run_writer, WorkerPool};
pub use protocol::{
    negotiate_client, negotiate_server, read_frame, write_frame, Frame, MessageKind,
    ProtocolVersion, MAGIC,
};
pub use receiver::receive_files;
pub use sender::send_files;
