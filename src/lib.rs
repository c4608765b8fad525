pub mod backup;
pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fingerprint;
pub mod metadata;
pub mod repository;
pub mod retriever;
pub mod service;
pub mod slideshow;
pub mod store;
pub mod thumbnail_files;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Callback, Dispatcher, Lookup, MetadataCache, Request};
pub use config::{CacheConfig, ConfigLoader, PartialConfig};
pub use error::{Error, Result};
pub use extractor::{ExtractRequest, ExtractedFrame, FrameExtractor, Scale, VideoProbe};
pub use fingerprint::Fingerprint;
pub use metadata::{VideoMetadata, VideoThumbnail};
pub use repository::VideoMetadataRepository;
pub use retriever::{FfmpegBackend, MediaBackend, MediaInfo, MediaRetriever, SeekMode};
pub use service::ThumbnailService;
pub use slideshow::ThumbnailSet;
pub use store::MetadataStore;
pub use thumbnail_files::ThumbnailFiles;
