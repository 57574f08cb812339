//! Record and job fixtures

use chrono::{Days, NaiveDate, NaiveTime};
use mdp_ingest::framework::{RawRecord, Schema};
use mdp_ingest::{JobConfig, RetryPolicy};
use serde_json::json;

pub const DATASET: &str = "GLBX.MDP3";
pub const SYMBOL: &str = "ESM4";

/// 1e-9 fixed-point units of a whole price
pub fn units(price: i64) -> i64 {
    price * 1_000_000_000
}

pub fn day(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() + Days::new(offset)
}

fn midnight_nanos(day: NaiveDate) -> i64 {
    day.and_time(NaiveTime::MIN).and_utc().timestamp_nanos_opt().unwrap()
}

/// Valid daily bar in the provider's header-nested encoding
pub fn ohlcv_bar(instrument_id: i64, day: NaiveDate, close: i64) -> RawRecord {
    RawRecord::from_value(json!({
        "hd": {
            "ts_event": midnight_nanos(day).to_string(),
            "instrument_id": instrument_id,
            "rtype": 35
        },
        "open": units(close - 1),
        "high": units(close + 2),
        "low": units(close - 3),
        "close": units(close),
        "volume": 1_250
    }))
    .unwrap()
}

/// Bar whose high is below its low
pub fn inverted_bar(instrument_id: i64, day: NaiveDate) -> RawRecord {
    RawRecord::from_value(json!({
        "hd": {"ts_event": midnight_nanos(day).to_string(), "instrument_id": instrument_id},
        "open": units(100),
        "high": units(90),
        "low": units(110),
        "close": units(100),
        "volume": 10
    }))
    .unwrap()
}

/// Valid bar whose volume arrives as a string; repaired during validation
pub fn string_volume_bar(instrument_id: i64, day: NaiveDate) -> RawRecord {
    RawRecord::from_value(json!({
        "hd": {"ts_event": midnight_nanos(day).to_string(), "instrument_id": instrument_id},
        "open": units(100),
        "high": units(105),
        "low": units(95),
        "close": units(101),
        "volume": "1250"
    }))
    .unwrap()
}

/// Valid bar whose high arrives as a digits-only string of fixed-point units
pub fn string_price_bar(instrument_id: i64, day: NaiveDate) -> RawRecord {
    RawRecord::from_value(json!({
        "hd": {"ts_event": midnight_nanos(day).to_string(), "instrument_id": instrument_id},
        "open": units(100),
        "high": units(102).to_string(),
        "low": units(98),
        "close": units(101),
        "volume": 1_250
    }))
    .unwrap()
}

/// Bar without an event time
pub fn headless_bar(instrument_id: i64) -> RawRecord {
    RawRecord::from_value(json!({
        "instrument_id": instrument_id,
        "open": units(1),
        "high": units(1),
        "low": units(1),
        "close": units(1),
        "volume": 1
    }))
    .unwrap()
}

/// Retry policy with short delays for tests that sleep for real
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 10,
        jitter: 0.0,
        attempt_timeout_ms: 5_000,
    }
}

/// Single-symbol daily-bar job over `days` days starting 2024-03-01
pub fn ohlcv_job(days: u64, chunk_days: u32) -> JobConfig {
    JobConfig::new(
        DATASET,
        Schema::Ohlcv1d,
        vec![SYMBOL.to_string()],
        day(0),
        day(days - 1),
    )
    .with_chunk_days(chunk_days)
    .with_retry(fast_retry(3))
    .with_target("futures_daily")
}
