// ABOUTME: Root module for deckgate - admission control and job lifecycle for deck generation.
// ABOUTME: Re-exports the public types from submodules.

pub mod admission;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod prelude;
pub mod task_id;

pub use error::DeckgateError;
