pub mod coordinator;
pub mod port;
pub mod session;

pub use coordinator::RebuildCoordinator;
pub use port::{PortSource, ResolvedPort, resolve_port};
pub use session::{DevSession, ProjectPaths, SessionArgs, run_build, run_dev};
