//! IdGenerator port - worker id generation.
//!
//! Worker ids end up in the `locked_by` column, so they must be unique across
//! every process sharing a store. ULIDs need no coordination to be unique.

use ulid::Ulid;

use crate::domain::WorkerId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_worker_id(&self) -> WorkerId;
}

/// ULID-based generator; the timestamp part comes from the injected clock.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_worker_id(&self) -> WorkerId {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        WorkerId::new(format!("worker-{}", ulid.to_string().to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generated_worker_ids_are_unique() {
        let id_gen = UlidGenerator::new(SystemClock);
        let a = id_gen.generate_worker_id();
        let b = id_gen.generate_worker_id();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("worker-"));
    }

    #[test]
    fn generated_ids_embed_the_clock_time() {
        let fixed = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(fixed));

        let id = id_gen.generate_worker_id();
        let raw = id.as_str().trim_start_matches("worker-").to_uppercase();
        let ulid = Ulid::from_string(&raw).unwrap();
        assert_eq!(ulid.timestamp_ms(), fixed.timestamp_millis() as u64);
    }
}
