//! Tool package sources: git plumbing, locks, and the lockfile

mod git;
mod lock;
mod lockfile;

pub use git::GitClient;
pub use lock::Lock;
pub use lockfile::Lockfile;
