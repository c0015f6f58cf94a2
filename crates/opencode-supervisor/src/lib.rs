//! Supervision of a locally spawned opencode server.
//!
//! Provides:
//! - `OpenCode` - Start/stop/readiness lifecycle for one server process
//! - `Config` - Programmatic configuration of an instance
//! - Port allocation, config staging and command building utilities

pub mod command;
pub mod config;
pub mod env;
pub mod port;
pub mod stage;
pub mod supervisor;

pub use command::{CommandBuildError, CommandParts, ServeCommand};
pub use config::{ChildOutput, Config, VirtualFileSet};
pub use env::Environment;
pub use port::allocate_port;
pub use stage::StageError;
pub use supervisor::{LifecycleState, OpenCode, ProcessExit, ReadyBudget, SupervisorError};
