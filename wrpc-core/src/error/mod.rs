mod error;

pub use error::{ErrorCode, Result, WrpcErr};
