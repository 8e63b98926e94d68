pub mod calendar;
pub mod loader;
pub mod source;
pub mod types;

pub use calendar::TradingCalendar;
pub use loader::{BarLoader, LoaderError};
pub use source::{DataError, InMemoryMarketData, MarketDataSource};
pub use types::{DailyBar, MarketSnapshot, OptionType, PriceField};
