use once_cell::sync::Lazy;
use std::env;

pub static CHANNEL_ACCESS_TOKEN: Lazy<String> =
    Lazy::new(|| env::var("LINE_CHANNEL_ACCESS_TOKEN").unwrap_or_default());

pub static API_DATA_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("LINE_API_DATA_ROOT").unwrap_or_else(|_| "https://api-data.line.me".to_string())
});
