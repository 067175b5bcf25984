pub mod cache;
pub mod export;
pub mod image;
pub mod llm;
pub mod net;
pub mod pacing;
pub mod repair;
pub mod setup;
pub mod speech;
pub mod stages;
pub mod workflow;
