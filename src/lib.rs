pub mod extractor;
pub mod ledger;
pub mod notifier;
pub mod pipeline;
pub mod pricefeed;
pub mod reconcile;
pub mod refdata;
pub mod rules;
pub mod scorer;
pub mod storage;
pub mod types;

// Re-export for tests
pub use pipeline::Pipeline;
