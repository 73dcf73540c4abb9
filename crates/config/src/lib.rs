// Configuration loading

pub mod settings;

pub use settings::{
    ConfigError, CsvOptions, DateSystem, EncryptionOptions, EngineConfig, Limits, RecalcMode,
};
