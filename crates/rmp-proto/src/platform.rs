use std::path::{Path, PathBuf};

const APP_DIR: &str = "rmp";

/// `~/.local/share/rmp`, where the log file lives.
pub fn data_dir() -> PathBuf {
    // XDG layout on macOS too, rather than Application Support
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join(APP_DIR)
}

/// `~/.config/rmp`, which holds `config.toml`.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(APP_DIR)
}

/// Directory for the transient audio files handed to mpv.
pub fn scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Per-process IPC socket path, so two daemons never share one mpv.
pub fn mpv_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("rmp-mpv-{}.sock", std::process::id()))
}

pub fn mpv_socket_arg(socket: &Path) -> String {
    format!("--input-ipc-server={}", socket.display())
}

/// Find the mpv binary: beside the current executable first, then PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    let name = "mpv";

    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let local = dir.join(name);
        if local.exists() {
            return Some(local);
        }
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_are_namespaced() {
        assert!(data_dir().ends_with(".local/share/rmp"));
        assert!(config_dir().ends_with(".config/rmp"));
    }

    #[test]
    fn test_socket_arg_points_at_socket() {
        let socket = PathBuf::from("/tmp/x.sock");
        assert_eq!(mpv_socket_arg(&socket), "--input-ipc-server=/tmp/x.sock");
        assert!(mpv_socket_path()
            .to_string_lossy()
            .contains(&std::process::id().to_string()));
    }
}
