//! Server mode - runs when invoked as `funcsync --server <path>`
//!
//! stdin/stdout carry the protocol, so nothing else may write to stdout.
//! The process is always the receiving side of the session.

use crate::config::SessionConfig;
use crate::error::Result;
use crate::streaming::{receive_files, SessionReport};
use std::path::{Path, PathBuf};

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

/// Main server entry point: receive into `root` over stdio.
pub async fn run_server(root: &Path, config: &SessionConfig) -> Result<SessionReport> {
    let root = expand_tilde(root);
    tracing::info!("Serving receive session into {}", root.display());

    let conn = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    receive_files(conn, &root, config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let plain = Path::new("/app/functions");
        assert_eq!(expand_tilde(plain), plain);
        assert_eq!(expand_tilde(Path::new("rel/~x")), Path::new("rel/~x"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~")), home);
            assert_eq!(expand_tilde(Path::new("~/fn")), home.join("fn"));
        }
    }
}
