pub mod adapter;
pub mod paper;

pub use adapter::{
    AdapterError, ExchangeAdapter, KlineUpdate, OrderRequest, Precision,
};
pub use paper::PaperExchange;
