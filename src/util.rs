use std::path::{Path, PathBuf};

/// Resolve a configured path
///
/// `~` expands to the home directory, relative paths are taken relative to
/// `base_dir`.
pub fn make_path(input: &str, base_dir: &Path) -> PathBuf {
    let expanded = match input.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(input),
        },
        _ => PathBuf::from(input),
    };

    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

/// Host name reported to the alert server during registration
pub fn get_hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| String::from("unknown"))
}
