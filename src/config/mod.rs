pub mod entry;
pub mod env;
pub mod global;
pub mod watcher;

pub use entry::*;
pub use env::*;
pub use global::*;
pub use watcher::*;
