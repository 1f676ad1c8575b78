pub mod errors;
pub mod interval;
pub mod market;

pub use errors::*;
pub use interval::*;
pub use market::*;
