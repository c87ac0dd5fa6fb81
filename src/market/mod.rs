pub mod debounce;
pub mod marketstack;
pub mod query;
pub mod quotes;
pub mod synchronizer;
pub mod tiingo;
pub mod types;

pub use synchronizer::MarketSynchronizer;
pub use types::{MarketView, MergePolicy, SearchKey, StreamStatusSnapshot};
