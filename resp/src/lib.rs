pub use data::Data;
pub use error::{Error, Result};
pub use nom;
pub use parser::parse as from_bytes;
pub use ser::to_bytes;

/// Tokio codec for RESP.
#[cfg(feature = "codec")]
pub mod codec;
/// General form of RESP data.
mod data;
/// RESP errors.
pub mod error;
/// RESP parsing.
pub mod parser;
/// RESP serialization.
mod ser;
