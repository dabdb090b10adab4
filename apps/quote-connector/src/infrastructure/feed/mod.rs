//! Market Data Feed
//!
//! Typed view of the feed built on top of a
//! [`Connector`](crate::infrastructure::connector::Connector).
//!
//! - `MarketDataFeed`: Typed dispatch, subscription bookkeeping and
//!   correlation of market data updates
//! - `run_with_reconnect`: Keeps a feed connected with exponential backoff

mod market_data;
mod supervisor;

pub use market_data::{FeedHandler, MarketDataFeed, SubscribeOutcome, UnsubscribeOutcome};
pub use supervisor::{FeedError, run_with_reconnect};

#[cfg(test)]
pub use market_data::MockFeedHandler;
