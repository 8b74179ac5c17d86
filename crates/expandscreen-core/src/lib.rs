pub mod errors;
pub mod interfaces;
pub mod shutdown;
pub mod touch;
pub mod types;

pub use errors::{SessionError, TransportError, WireError};
pub use shutdown::Shutdown;
pub use types::*;
