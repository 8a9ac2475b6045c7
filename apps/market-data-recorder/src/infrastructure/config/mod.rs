//! Configuration Module
//!
//! Configuration loading for the recorder.

mod settings;

pub use settings::{
    BackfillSettings, CaptureSettings, ConfigError, Credentials, DEFAULT_DATA_URL, DataFeed,
    Environment, PAGE_SIZE_RANGE, RecorderConfig, WebSocketSettings,
};
