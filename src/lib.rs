//! Duplicate call suppression.
//!
//! A [`Group`] makes sure that, for each key, only one execution of a piece of
//! work is in flight at a time. Callers that arrive while the work for their
//! key is running wait for it and receive a clone of its result instead of
//! running the work again. Once the work finishes the key is forgotten, so the
//! next caller starts a fresh execution; nothing is cached.
//!
//! ```
//! use singleflight::Group;
//!
//! let group: Group<&str, String, String> = Group::new();
//! let outcome = group.work("user:42", || Ok("alice".to_string()));
//! assert_eq!(outcome.result, Ok("alice".to_string()));
//! assert!(!outcome.shared);
//! ```
//!
//! A panic inside the work does not unwind into the callers. The leader and
//! every waiting caller get [`Error::Panic`] carrying the panic message, its
//! location and a backtrace that starts at the panicking frame.

mod group;
mod panic;
mod types;
mod utils;

pub use group::Group;
pub use panic::PanicError;
pub use types::{Error, Options, Outcome};
