use std::path::{Path, PathBuf};

use mayhem_core::config::mayhem_root;

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    mayhem_root(home).join(DAEMON_SOCKET)
}
