//! Encoder invocation: command building, progress parsing and process
//! supervision.

pub mod command;
pub mod progress;
pub mod supervisor;

pub use command::{build, build_with_program, EncodeCommand, DEFAULT_PROGRAM};
pub use progress::{parse_timestamp, ProgressTracker};
pub use supervisor::{
    OutputStream, ProcessState, ProcessSupervisor, ProgressEvent, ProgressStream,
    SupervisorError, SupervisorOptions,
};
