use std::path::{Path, PathBuf};

pub const SWAP_DIR: &str = ".swap";
pub const CONFIG_FILE: &str = ".swap/config.yaml";

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}
