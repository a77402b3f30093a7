/// TimeRange holds an inclusive min and max timestamp in unix nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: i64,
    pub max: i64,
}

impl TimeRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    /// contains returns true if t lies within the range, bounds inclusive.
    pub fn contains(&self, t: i64) -> bool {
        self.min <= t && t <= self.max
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.min <= other.max && self.max >= other.min
    }

    /// extend widens the range so it covers t.
    pub fn extend(&mut self, t: i64) {
        self.min = self.min.min(t);
        self.max = self.max.max(t);
    }
}
