mod primitives;
mod request;

pub use primitives::*;
pub use request::*;
