pub mod backfill;
pub mod locator;
pub mod records;
pub mod scoring;
pub mod stability;
pub mod summary;
