// Feature Engineering (Layer 1)
// Folds per-source signal bundles into fixed-width feature records

pub mod bundle;
pub mod engineer;
pub mod sources;

pub use bundle::{MarketContext, SentimentSnapshot, SignalBundle, TechnicalSnapshot};
pub use engineer::{EngineerConfig, FeatureEngineer};
pub use sources::{
    CachedSignalSource, PriceSource, SignalSource, StaticPriceSource, StaticSignalSource,
};
