//! Bencode decoding ([BEP-3]).
//!
//! Only the decoding half is needed by the download core: HTTP trackers answer
//! with a bencoded dictionary.
//!
//! ```
//! use bitleech::bencode::decode;
//!
//! let value = decode(b"d8:intervali1800e5:peers0:e").unwrap();
//! assert_eq!(value.get(b"interval").and_then(|v| v.as_integer()), Some(1800));
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod error;
mod value;

pub use decode::decode;
pub use error::BencodeError;
pub use value::Value;

#[cfg(test)]
mod tests;
