//! fakedaq-lib: an emulated DAQ instrument that negotiates an experiment over
//! a small binary protocol and streams paced multi-channel samples

pub mod bin_file;
pub mod config;
pub mod message;
pub mod pacer;
pub mod server;
pub mod session;
pub mod source;
pub mod task;

// re-exports for ergonomic imports:
pub use config::DaqConfig;
pub use pacer::{StreamEnd, StreamReport};
pub use server::{Server, ServerError};
pub use session::{Session, SessionError, SessionOutcome, SessionState};
pub use source::{SampleSource, SourceSpec};
pub use task::{Task, create_task};
