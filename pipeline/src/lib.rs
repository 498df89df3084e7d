// Batch orchestration (Layer 4)
// Two entry points: the pre-market prediction run and the post-market
// outcome/training run. Clients are injected per run; nothing is global.

pub mod config;
pub mod evening;
pub mod morning;
pub mod sources;

pub use config::{create_config_template, load_config, save_config, BatchConfig, PipelineConfig};
pub use evening::EveningRunner;
pub use morning::MorningRunner;
pub use sources::{load_price_file, load_signal_file, PricePoint};
