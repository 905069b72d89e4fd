pub mod home_dir;

pub use home_dir::{expand_tilde, resolve_home_dir, resolve_under_home, HomeDirError};
