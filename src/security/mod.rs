//! Security module - Credential handling
//!
//! - [`SecureString`] keeps provider keys out of memory once dropped and out of `Debug` output
//! - [`Sanitizer`] renders secrets and provider error bodies safely for logs

mod sanitizer;
mod secure_string;

pub use sanitizer::Sanitizer;
pub use secure_string::SecureString;
