mod cache;
mod repository;
mod streaming;

pub use cache::CacheEntry;
pub use repository::FeatureRepository;
