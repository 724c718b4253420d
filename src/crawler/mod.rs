pub mod blocking;
pub mod engine;
pub mod extractor;
pub mod fetcher;
pub mod identity;
pub mod jobs;
pub mod orchestrator;
pub mod pacing;
pub mod scheduler;
pub mod task;

#[cfg(test)]
mod testing;

// Re-export common types
pub use orchestrator::{BatchResults, SearchOrchestrator};
pub use scheduler::{JobInfo, Scheduler};
