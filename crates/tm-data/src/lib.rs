pub mod binance;
pub mod export;
pub mod store;

pub use binance::*;
pub use export::*;
pub use store::*;
