//! # ytgrab engine
//!
//! The download core behind the `ytgrab` CLI and web service: strategy
//! selection with upstream-block recovery, chunked/resumable/segmented
//! streaming transfers with atomic finalize, template-driven output
//! planning, and a multi-subscriber progress bus that survives client
//! reconnects.
//!
//! The engine is a library; operator surfaces (flag parsing, progress
//! rendering, HTTP handlers) live in the sibling crates and talk to the
//! engine through [`runner::JobRunner`] and [`bus::ProgressBus`].

pub mod bus;
pub mod catalog;
pub mod download;
pub mod error;
pub mod extractor;
pub mod helper;
pub mod media;
pub mod options;
pub mod planner;
pub mod prompt;
pub mod retry;
pub mod runner;
pub mod sidecar;
pub mod strategy;
pub mod transport;

pub use bus::{Event, EventPayload, JobPublisher, JobStats, JobStatus, LogLevel, ProgressBus};
pub use catalog::{Catalog, CatalogRecord};
pub use download::{DownloadTuning, Downloader};
pub use error::{DownloadError, ErrorKind, dominant_exit_code};
pub use extractor::{DirectExtractor, Extracted, ExtractorRegistry, MediaExtractor};
pub use helper::{ExternalHelper, TagSet};
pub use media::{
    Format, FormatKind, FormatSource, MediaDescriptor, Playlist, PlaylistEntry, Resolution,
    Segment,
};
pub use options::{DuplicatePolicy, JobOptions, QualityPreference};
pub use planner::{PathMeta, PlannedPath};
pub use prompt::{PromptBroker, Resolution as PromptResolution};
pub use runner::{ItemOutcome, JobRunner, JobSummary, OutcomeKind, SubmittedJob};
pub use strategy::Strategy;
pub use transport::{DEFAULT_USER_AGENT, HttpTransport, TransportConfig};
