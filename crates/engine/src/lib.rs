//! Chunked transfer engine.
//!
//! Uploads split a file into ordered chunks, store each as a content
//! object, then publish all of them at once with one tree, one commit and a
//! guarded ref update. Downloads walk a manifest in index order and verify
//! every byte before handing anything back.
//!
//! - [`ChunkedUploadCoordinator`]: one file, one commit
//! - [`ChunkedDownloadCoordinator`]: manifest back to bytes
//! - [`BatchUploadCoordinator`]: small files share a commit, large ones are chunked
//! - [`StorageRouter`]: picks the chunk-capable store or a [`FlatBackend`] per batch,
//!   and deletes stored records from whichever one holds them

pub mod batch;
pub mod config;
pub mod download;
pub mod error;
pub mod flat;
pub mod publish;
pub mod router;
pub mod state;
pub mod upload;

pub use batch::BatchUploadCoordinator;
pub use config::{DEFAULT_DIRECT_WRITE_LIMIT, DEFAULT_MAX_FILE_SIZE, EngineConfig};
pub use download::ChunkedDownloadCoordinator;
pub use error::{EngineError, OversizedFile, Stage};
pub use flat::{FlatBackend, FlatConfig, FlatObject, HttpFlatBackend, MemoryFlatBackend};
pub use publish::{Base, Publisher, TreeDraft};
pub use router::{BatchResult, DeleteResult, StorageRouter};
pub use state::{InvalidTransition, PublishStep, UploadEvent, UploadState};
pub use upload::{ChunkedUploadCoordinator, UploadRequest};
