//! Bencode codec
//!
//! Used for torrent metainfo files and tracker responses.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::{decode, decode_list};
pub use encode::{encode, encode_into};
pub use value::{Dict, Value};
