/*
[INPUT]:  Public API exports for usdm-closer-adapter crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod http;
pub mod types;
pub mod util;
pub mod ws;

pub use http::client::{ClientConfig, Credentials, UsdmClient};
pub use http::error::{AdapterError, Result};
pub use types::enums::{OrderStatus, OrderType, PositionSide, Side, TimeInForce};
pub use types::models::{
    AlgoOrderUpdate, InstrumentRule, LeverageUpdate, MarketEvent, MarketEventKind, OpenOrder,
    OrderIntent, OrderResult, OrderUpdate, Position, PositionUpdate, TradeMeta,
};
pub use ws::market::{MarketStream, MarketStreamEvent, ReconnectPolicy};
pub use ws::user_data::{UserDataStream, UserStreamEvent};
