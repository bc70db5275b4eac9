//! Cooperative cancellation.
//!
//! A [`CancelToken`] is the cancellation signal handed to flush handlers and
//! accepted by the id generator's regression wait. Cancellation is a request:
//! code holding a token checks it at safe points or blocks on it with a
//! timeout, it is never interrupted.

pub mod token;

pub use token::CancelToken;
