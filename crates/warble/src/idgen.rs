use crate::{
    error::{Error, Result},
    time::{CUSTOM_EPOCH_MS, TimeSource},
};
use core::cmp::Ordering;
use parking_lot::Mutex;
use std::sync::Arc;

const TIMESTAMP_HEX_WIDTH: usize = 10;
const COUNTER_HEX_WIDTH: usize = 3;

// A 63-bit id holds 16 hex digits; the timestamp and counter fields use 13.
const MAX_MACHINE_ID_LEN: usize = 16 - TIMESTAMP_HEX_WIDTH - COUNTER_HEX_WIDTH;

/// A lock-based generator of 63-bit, time-ordered post identifiers.
///
/// One instance serves a whole process; the state behind the mutex is a
/// `(timestamp, counter)` pair relative to [`CUSTOM_EPOCH_MS`]. Each call
/// takes the lock, advances the pair, releases the lock, and only then
/// encodes the id, so the critical section stays a few instructions long.
///
/// The encoding concatenates `machine_id`, the timestamp as ten hex digits,
/// and the counter as three hex digits, parses the result base-16, and
/// clears the sign bit. Successive non-erroring calls on one instance yield
/// strictly increasing ids. Uniqueness across processes rests entirely on
/// distinct machine ids, which is why the machine id comes from explicit
/// configuration rather than anything sniffed from the host.
///
/// [`CUSTOM_EPOCH_MS`]: crate::time::CUSTOM_EPOCH_MS
pub struct PostIdGenerator<T: TimeSource> {
    machine_id: String,
    state: Arc<Mutex<GeneratorState>>,
    time: T,
}

#[derive(Debug)]
struct GeneratorState {
    current_timestamp: i64,
    counter: i64,
}

impl<T: TimeSource> PostIdGenerator<T> {
    /// Creates a generator for the given machine id and time source.
    ///
    /// # Errors
    ///
    /// Fails if `machine_id` is empty, longer than three characters, or not
    /// hexadecimal. Uppercase digits are accepted and normalized.
    pub fn new(machine_id: impl Into<String>, time: T) -> Result<Self> {
        let machine_id = machine_id.into();
        if machine_id.is_empty() || machine_id.len() > MAX_MACHINE_ID_LEN {
            return Err(Error::InvalidMachineId {
                machine_id,
                reason: "must be 1 to 3 hex digits",
            });
        }
        if !machine_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidMachineId {
                machine_id,
                reason: "must contain only hex digits",
            });
        }

        Ok(Self {
            machine_id: machine_id.to_ascii_lowercase(),
            state: Arc::new(Mutex::new(GeneratorState {
                current_timestamp: -1,
                counter: 0,
            })),
            time,
        })
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Produces the next id.
    ///
    /// # Errors
    ///
    /// - [`Error::ClockBeforeEpoch`] if the wall clock reads earlier than
    ///   the id epoch.
    /// - [`Error::NonMonotonicClock`] if the wall clock regressed below the
    ///   last-used timestamp. State is left unchanged; the caller decides
    ///   whether to retry.
    pub fn generate(&self) -> Result<i64> {
        let unix_ms = self.time.unix_millis();
        if unix_ms < CUSTOM_EPOCH_MS {
            return Err(Error::ClockBeforeEpoch { unix_ms });
        }
        let now = unix_ms - CUSTOM_EPOCH_MS;

        let (timestamp, counter) = {
            let mut state = self.state.lock();
            match now.cmp(&state.current_timestamp) {
                Ordering::Less => {
                    return Err(Self::cold_clock_behind(now, state.current_timestamp));
                }
                Ordering::Equal => state.counter += 1,
                Ordering::Greater => {
                    state.current_timestamp = now;
                    state.counter = 1;
                }
            }
            (state.current_timestamp, state.counter)
        };

        self.encode(timestamp, counter)
    }

    fn encode(&self, timestamp: i64, counter: i64) -> Result<i64> {
        let combined = format!(
            "{}{}{}",
            self.machine_id,
            fixed_width_hex(timestamp, TIMESTAMP_HEX_WIDTH),
            fixed_width_hex(counter, COUNTER_HEX_WIDTH)
        );
        let raw = u64::from_str_radix(&combined, 16).map_err(|err| Error::Serialization {
            context: format!("post id `{combined}` is not a hex integer: {err}"),
        })?;
        Ok((raw & 0x7FFF_FFFF_FFFF_FFFF) as i64)
    }

    #[cold]
    #[inline(never)]
    fn cold_clock_behind(now: i64, last: i64) -> Error {
        Error::NonMonotonicClock { now, last }
    }
}

/// Renders `value` as lowercase hex, zero-padded on the left to `width` and
/// truncated on the right when longer.
fn fixed_width_hex(value: i64, width: usize) -> String {
    let mut hex = format!("{value:x}");
    hex.truncate(width);
    format!("{hex:0>width$}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::Cell;
    use std::rc::Rc;

    struct MockTime {
        millis: i64,
    }

    impl TimeSource for MockTime {
        fn unix_millis(&self) -> i64 {
            self.millis
        }
    }

    struct MockStepTime {
        values: Vec<i64>,
        index: Cell<usize>,
    }

    impl TimeSource for Rc<MockStepTime> {
        fn unix_millis(&self) -> i64 {
            self.values[self.index.get()]
        }
    }

    fn at_epoch_offset(offset_ms: i64) -> MockTime {
        MockTime {
            millis: CUSTOM_EPOCH_MS + offset_ms,
        }
    }

    #[test]
    fn same_tick_increments_counter() {
        let generator = PostIdGenerator::new("0", at_epoch_offset(1000)).unwrap();

        let first = generator.generate().unwrap();
        let second = generator.generate().unwrap();

        assert_eq!(first & 0xFFF, 1);
        assert_eq!(second & 0xFFF, 2);
        assert!(second > first);
    }

    #[test]
    fn advancing_tick_resets_counter() {
        let time = Rc::new(MockStepTime {
            values: vec![CUSTOM_EPOCH_MS + 1000, CUSTOM_EPOCH_MS + 2000],
            index: Cell::new(0),
        });
        let generator = PostIdGenerator::new("0", Rc::clone(&time)).unwrap();

        let first = generator.generate().unwrap();
        time.index.set(1);
        let second = generator.generate().unwrap();

        assert_eq!(first & 0xFFF, 1);
        assert_eq!(second & 0xFFF, 1);
        assert!(second > first);
    }

    #[test]
    fn clock_regression_fails_and_preserves_state() {
        let time = Rc::new(MockStepTime {
            values: vec![
                CUSTOM_EPOCH_MS + 1000,
                CUSTOM_EPOCH_MS + 999,
                CUSTOM_EPOCH_MS + 1000,
            ],
            index: Cell::new(0),
        });
        let generator = PostIdGenerator::new("0", Rc::clone(&time)).unwrap();

        generator.generate().unwrap();

        time.index.set(1);
        let err = generator.generate().unwrap_err();
        assert!(matches!(
            err,
            Error::NonMonotonicClock {
                now: 999,
                last: 1000
            }
        ));

        // The failed call must not have touched the counter.
        time.index.set(2);
        let next = generator.generate().unwrap();
        assert_eq!(next & 0xFFF, 2);
    }

    #[test]
    fn two_calls_per_tick_then_regression() {
        let time = Rc::new(MockStepTime {
            values: vec![CUSTOM_EPOCH_MS + 1000, CUSTOM_EPOCH_MS + 999],
            index: Cell::new(0),
        });
        let generator = PostIdGenerator::new("a", Rc::clone(&time)).unwrap();

        let first = generator.generate().unwrap();
        let second = generator.generate().unwrap();
        assert_eq!(first & 0xFFF, 1);
        assert_eq!(second & 0xFFF, 2);
        assert!(second > first);

        time.index.set(1);
        assert!(matches!(
            generator.generate(),
            Err(Error::NonMonotonicClock { .. })
        ));
    }

    #[test]
    fn encodes_machine_timestamp_counter_as_hex() {
        // machine "a", timestamp 1000 (0x3e8), counter 1:
        // "a" + "00000003e8" + "001"
        let generator = PostIdGenerator::new("a", at_epoch_offset(1000)).unwrap();
        assert_eq!(generator.generate().unwrap(), 0xa0_0000_003e_8001);
    }

    #[test]
    fn sign_bit_is_cleared() {
        // Three leading machine digits put the encoded value above i64::MAX
        // until the sign bit is dropped.
        let generator = PostIdGenerator::new("f00", at_epoch_offset(0)).unwrap();
        let id = generator.generate().unwrap();
        assert_eq!(id, 0x7000_0000_0000_0001);
        assert!(id > 0);
    }

    #[test]
    fn overlong_timestamp_truncates_on_the_right() {
        // 0x123456789ab needs eleven hex digits; the encoding keeps the
        // leading ten.
        let generator = PostIdGenerator::new("0", at_epoch_offset(0x123_4567_89AB)).unwrap();
        assert_eq!(generator.generate().unwrap(), 0x1_2345_6789_a001);
    }

    #[test]
    fn ids_strictly_increase_while_clock_does_not_regress() {
        let time = Rc::new(MockStepTime {
            values: vec![1000, 1000, 1000, 2000, 2000, 3000]
                .into_iter()
                .map(|ms| CUSTOM_EPOCH_MS + ms)
                .collect(),
            index: Cell::new(0),
        });
        let generator = PostIdGenerator::new("2b", Rc::clone(&time)).unwrap();

        let mut last = 0;
        for step in 0..time.values.len() {
            time.index.set(step);
            let id = generator.generate().unwrap();
            assert!(id > last, "id {id} not greater than {last} at step {step}");
            last = id;
        }
    }

    #[test]
    fn rejects_clock_before_epoch() {
        let generator = PostIdGenerator::new("0", MockTime { millis: 12 }).unwrap();
        assert!(matches!(
            generator.generate(),
            Err(Error::ClockBeforeEpoch { unix_ms: 12 })
        ));
    }

    #[test]
    fn validates_machine_id() {
        assert!(PostIdGenerator::new("", at_epoch_offset(0)).is_err());
        assert!(PostIdGenerator::new("abcd", at_epoch_offset(0)).is_err());
        assert!(PostIdGenerator::new("xy", at_epoch_offset(0)).is_err());

        let upper = PostIdGenerator::new("2B", at_epoch_offset(0)).unwrap();
        assert_eq!(upper.machine_id(), "2b");
    }
}
