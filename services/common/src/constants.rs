//! Core constants shared by the microstructure services.

/// Fixed-point arithmetic constants
pub mod fixed_point {
    /// 4-decimal fixed-point scale factor used for prices
    pub const SCALE_4: i64 = 10000;

    /// 2-decimal fixed-point scale factor (cents)
    pub const SCALE_2: i64 = 100;
}

/// Time-related constants
pub mod time {
    /// Nanoseconds per second
    pub const NANOS_PER_SEC: u64 = 1_000_000_000;

    /// Nanoseconds per millisecond
    pub const NANOS_PER_MILLI: u64 = 1_000_000;

    /// Nanoseconds per microsecond
    pub const NANOS_PER_MICRO: u64 = 1_000;
}
