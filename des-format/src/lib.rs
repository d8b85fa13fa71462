//! Binary container codec: header/footer, index region, and the streaming writer.

pub mod constants;
pub mod footer;
pub mod index;
pub mod writer;

pub use constants::{flags, FORMAT_VERSION, HEADER_SIZE, MIN_CONTAINER_SIZE};
pub use footer::Footer;
pub use index::{decode_index, validate_name, IndexEntry};
pub use writer::{ExternalConfig, ExternalObjectInfo, ExternalSink, Writer};
