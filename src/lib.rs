pub mod config {
    pub mod engine;
    pub mod settings;
}
pub mod routes {
    pub mod health;
    pub mod status;
}
pub mod services {
    pub mod candle_buffer;
    pub mod clock;
    pub mod debounce;
    pub mod dispatcher;
    pub mod eligibility;
    pub mod engine;
    pub mod indicators;
    pub mod market_data;
    pub mod notifiers;
    pub mod scheduler;

    pub mod patterns {
        pub mod breakout;
        pub mod fvg;
        pub mod sr_zones;
    }
    pub mod strategies {
        pub mod common;
        pub use common::{Candle, Direction, Timeframe, TimeframeRole};
        pub mod confluence;
    }
}
pub mod utils {
    pub mod errors;
    pub mod signature;
    pub mod types;
}
