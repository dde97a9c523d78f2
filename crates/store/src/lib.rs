//! Content-addressable object store client.
//!
//! The transfer engine talks to remote storage only through the
//! [`ObjectStore`] trait: content objects (blobs), trees layered on a base
//! tree, commits, and a named ref that is moved last to publish. Two
//! backends are provided:
//!
//! - [`MemoryObjectStore`]: in-process git model with fault injection
//! - [`GithubStore`]: GitHub git-data REST API
//!
//! Every failure is classified as transient (retry the same call) or
//! permanent (abort the transfer); [`RetryPolicy`] applies that rule with
//! bounded, jittered backoff and a per-call timeout.

pub mod client;
pub mod error;
pub mod github;
pub mod memory;
pub mod retry;

pub use client::{CommitInfo, ObjectStore, PathObject, StoreFuture, TreeEntry};
pub use error::{FailureKind, StoreError};
pub use github::{Committer, GithubConfig, GithubStore};
pub use memory::{Fault, MemoryObjectStore, StoreOp};
pub use retry::{RetryError, RetryPolicy};

/// Ref the engine publishes to unless configured otherwise.
pub const DEFAULT_REF: &str = "heads/main";
