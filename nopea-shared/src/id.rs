//! Monotonic, sortable 128-bit identifiers (48-bit millisecond timestamp,
//! 80-bit random), textualized as 26-char Crockford Base32.
//!
//! Within a single process the emitted sequence is strictly increasing even
//! for same-millisecond calls: the generator increments the random portion.
//! Identifiers are opaque to every other component.

use std::sync::{Mutex, OnceLock};
use ulid::{Generator, Ulid};

static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();

/// Emits the next identifier. Falls back to a plain random identifier when
/// the monotonic generator is unavailable (poisoned lock or same-millisecond
/// overflow of the random portion).
pub fn next() -> String {
    let gen = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
    match gen.lock() {
        Ok(mut g) => g
            .generate()
            .map(|u| u.to_string())
            .unwrap_or_else(|_| Ulid::new().to_string()),
        Err(_) => Ulid::new().to_string(),
    }
}
