//! Chunk planning
//!
//! Splits an inclusive date range into contiguous, non-overlapping windows of
//! at most `chunk_days` days. Planning is a pure function of its inputs, so a
//! resumed job always sees the same chunk boundaries.

use chrono::{Days, NaiveDate};
use uuid::Uuid;

use super::types::{Chunk, ChunkStatus};
use crate::config::JobConfig;
use crate::error::ConfigError;

/// Plan the chunks covering `start..=end`.
///
/// `start == end` yields one single-day chunk. An inverted range or a zero
/// chunk size is a configuration error.
pub fn plan_chunks(
    job_id: Uuid,
    start: NaiveDate,
    end: NaiveDate,
    chunk_days: u32,
) -> Result<Vec<Chunk>, ConfigError> {
    if end < start {
        return Err(ConfigError::InvalidDateRange { start, end });
    }
    if chunk_days == 0 {
        return Err(ConfigError::ZeroChunkSize);
    }

    let stop = end
        .checked_add_days(Days::new(1))
        .ok_or_else(|| ConfigError::InvalidDate {
            value: end.to_string(),
            reason: "date range ends at the last representable day".to_string(),
        })?;

    let mut chunks = Vec::new();
    let mut cursor = start;
    let mut index: u32 = 0;

    while cursor < stop {
        let next = cursor
            .checked_add_days(Days::new(u64::from(chunk_days)))
            .map_or(stop, |d| d.min(stop));
        chunks.push(Chunk {
            job_id,
            index,
            start: cursor,
            end: next,
            status: ChunkStatus::Pending,
        });
        cursor = next;
        index += 1;
    }

    Ok(chunks)
}

/// Plan the chunks of a job
pub fn plan_job(config: &JobConfig) -> Result<Vec<Chunk>, ConfigError> {
    plan_chunks(config.job_id(), config.start, config.end, config.chunk_days)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_ten_days_one_day_chunks() {
        let chunks = plan_chunks(Uuid::nil(), day(2024, 1, 1), day(2024, 1, 10), 1).unwrap();
        assert_eq!(chunks.len(), 10);
        assert_eq!(chunks[0].status, ChunkStatus::Pending);
        assert_eq!(chunks[0].start, day(2024, 1, 1));
        assert_eq!(chunks[9].end, day(2024, 1, 11));
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_single_day() {
        let chunks = plan_chunks(Uuid::nil(), day(2024, 2, 29), day(2024, 2, 29), 7).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].days(), 1);
    }

    #[test]
    fn test_last_chunk_is_clipped() {
        let chunks = plan_chunks(Uuid::nil(), day(2024, 1, 1), day(2024, 1, 10), 3).unwrap();
        let sizes: Vec<i64> = chunks.iter().map(Chunk::days).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            plan_chunks(Uuid::nil(), day(2024, 1, 2), day(2024, 1, 1), 1),
            Err(ConfigError::InvalidDateRange { .. })
        ));
        assert_eq!(
            plan_chunks(Uuid::nil(), day(2024, 1, 1), day(2024, 1, 2), 0),
            Err(ConfigError::ZeroChunkSize)
        );
    }

    proptest! {
        #[test]
        fn prop_plan_covers_range_contiguously(
            offset in 0u64..3_000,
            span in 0u64..400,
            chunk_days in 1u32..40,
        ) {
            let start = day(2015, 1, 1) + Days::new(offset);
            let end = start + Days::new(span);
            let chunks = plan_chunks(Uuid::nil(), start, end, chunk_days).unwrap();

            prop_assert_eq!(chunks.first().map(|c| c.start), Some(start));
            prop_assert_eq!(chunks.last().map(|c| c.end), Some(end + Days::new(1)));
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index as usize, i);
                prop_assert!(chunk.start < chunk.end);
                prop_assert!(chunk.days() <= i64::from(chunk_days));
            }
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }

            let again = plan_chunks(Uuid::nil(), start, end, chunk_days).unwrap();
            prop_assert_eq!(chunks, again);
        }
    }
}
