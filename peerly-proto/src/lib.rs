pub mod proto;
pub mod wire;

pub use proto::*;
