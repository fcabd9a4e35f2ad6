#[inline]
pub const fn to_bcd(value: u8) -> u8 {
    (value / 10) * 16 + (value % 10)
}

#[inline]
pub const fn from_bcd(value: u8) -> u8 {
    10 * ((value & 0xF0) >> 4) + (value & 0x0F)
}

#[inline(always)]
pub const fn low_byte(value: u16) -> u8 {
    value as u8
}

#[inline(always)]
pub const fn high_byte(value: u16) -> u8 {
    (value >> 8) as u8
}

/// Round a byte count up to the next even number.
#[inline(always)]
pub const fn even_up(len: u32) -> u32 {
    (len + 1) & !1
}

/// Rate limiter for repeated guest-triggered warnings: a given warning is
/// shown at most `limit` times until reset.
#[derive(Debug, Clone, Copy)]
pub struct WarnBudget {
    shown: u32,
    limit: u32,
}

impl WarnBudget {
    pub const fn new(limit: u32) -> Self {
        Self { shown: 0, limit }
    }

    pub fn allow(&mut self) -> bool {
        if self.shown < self.limit {
            self.shown += 1;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.shown = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_conversions() {
        assert_eq!(to_bcd(59), 0x59);
        assert_eq!(from_bcd(0x59), 59);
        assert_eq!(from_bcd(to_bcd(7)), 7);
    }

    #[test]
    fn even_up_pads_odd_lengths() {
        assert_eq!(even_up(0), 0);
        assert_eq!(even_up(3), 4);
        assert_eq!(even_up(4), 4);
    }

    #[test]
    fn warn_budget_stops_after_limit() {
        let mut budget = WarnBudget::new(2);
        assert!(budget.allow());
        assert!(budget.allow());
        assert!(!budget.allow());
        budget.reset();
        assert!(budget.allow());
    }
}
