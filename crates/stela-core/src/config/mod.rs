mod defaults;
mod resolve;
mod types;

pub use self::defaults::parse_duration;
pub use self::resolve::{load_config, resolve_config_path, CONFIG_ENV};
pub use self::types::{StelaConfig, StoreConfig};
