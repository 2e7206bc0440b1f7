//! Document identifiers, feed operations and the input decoder.
//!
//! A [`Document`] is a single mutation (put, update or remove) addressed by a [`DocumentId`].
//! Documents are usually produced by a [`Decoder`] reading a JSON feed, then consumed once by
//! the transport in `vespa_feed_client`.

mod decoder;
mod document;
mod id;

pub use decoder::{DecodeError, DecodeErrorKind, Decoder};
pub use document::{Document, Operation};
pub use id::{DocumentId, IdError, Location};
