use std::path::{Path, PathBuf};
use swap_core::paths::SWAP_DIR;

/// Resolve the directory holding `.swap/config.yaml`.
///
/// Priority:
/// 1. `--root` flag / `SWAP_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.swap/`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd).unwrap_or(cwd)
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(SWAP_DIR).is_dir() {
            return Some(dir);
        }
        match dir.parent() {
            Some(p) => dir = p.to_path_buf(),
            None => return None,
        }
    }
}
