//! Persistence port for assets and thumbnails
//!
//! [`AssetRepository`] is what the ingestion layer talks to. [`MemoryAssetRepository`]
//! backs tests and database-less deployments; [`PgAssetRepository`] stores rows in
//! PostgreSQL using the migrations under the workspace `migrations/` directory.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod repository;

pub use memory::MemoryAssetRepository;
#[cfg(feature = "postgres")]
pub use postgres::PgAssetRepository;
pub use repository::AssetRepository;
