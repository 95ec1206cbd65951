//! # folio-compile: compilation job scheduler
//!
//! Accepts compile requests for LaTeX and Typst projects, admits them under
//! a global concurrency limit and a per-project lock, runs the external
//! compiler in the project owner's directory and keeps results pollable for
//! a retention window.
//!
//! ## Modules
//!
//! - [`job`]: job records, status views and counters
//! - [`scheduler`]: pure admission state machine ([`JobBoard`])
//! - [`runner`]: toolchains and the compile pass loop
//! - [`queue`]: the async service tying board and runner together
//! - [`http`]: axum routes under `/compile`

pub mod error;
pub mod http;
pub mod job;
pub mod queue;
pub mod runner;
pub mod scheduler;

pub use error::CompileError;
pub use http::{router, ApiError, AppState, SubmitRequest, SubmitResponse};
pub use job::{CompileJob, JobId, JobStatus, JobView, PublicStats, QueueStats};
pub use queue::{CompileQueue, QueueConfig};
pub use runner::{
    is_source_file, CompileRunner, PassOutput, ProcessToolchain, SourceKind, Toolchain,
    ToolchainConfig, Toolchains, Workspace,
};
pub use scheduler::{JobBoard, Outcome};
