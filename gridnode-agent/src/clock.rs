//! Wall-clock timestamps for telemetry.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use gridnode_core::{Clock, UNSYNCED_TIMESTAMP};
use tracing::warn;

/// 2020-01-01T00:00:00Z; anything earlier means the clock was never set
const SYNC_EPOCH_SECS: i64 = 1_577_836_800;

#[derive(Debug, Clone)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(utc_offset_secs: i32, dst_offset_secs: i32) -> Self {
        let total = utc_offset_secs.saturating_add(dst_offset_secs);
        let offset = FixedOffset::east_opt(total).unwrap_or_else(|| {
            warn!("Clock offset {}s out of range, using UTC", total);
            Utc.fix()
        });
        Self { offset }
    }

    pub fn timestamp_at(&self, now: DateTime<Utc>) -> String {
        if now.timestamp() < SYNC_EPOCH_SECS {
            return UNSYNCED_TIMESTAMP.to_string();
        }
        now.with_timezone(&self.offset).format("%H:%M:%S").to_string()
    }
}

impl Clock for SystemClock {
    fn timestamp(&self) -> String {
        self.timestamp_at(Utc::now())
    }
}
