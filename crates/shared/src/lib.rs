pub mod cache;
pub mod events;
pub mod loading_state;

pub use cache::{BandCache, CacheStats};
pub use events::EventHub;
pub use loading_state::{DownloadState, DownloadTransition};
