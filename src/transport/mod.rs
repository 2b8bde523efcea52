//! Ways to reach the receiving side.

pub mod server;

pub use server::{ChildConnection, ServerSession};
