use chrono::{DateTime, Utc};

/// Source of the UTC timestamps used for object keys and alert bodies
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Clock;
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Always returns the same instant
    pub struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    /// Returns the queued instants in order, repeating the last one
    pub struct SequenceClock {
        instants: Mutex<VecDeque<DateTime<Utc>>>,
    }

    impl SequenceClock {
        pub fn new(instants: impl IntoIterator<Item = DateTime<Utc>>) -> Self {
            Self {
                instants: Mutex::new(instants.into_iter().collect()),
            }
        }
    }

    impl Clock for SequenceClock {
        fn now(&self) -> DateTime<Utc> {
            let mut instants = self.instants.lock().unwrap();
            if instants.len() > 1 {
                instants.pop_front().unwrap()
            } else {
                *instants.front().expect("sequence clock is empty")
            }
        }
    }
}
