//! Read/write selection.
//!
//! With write percentage `W` the nominal write interval is `100 / W`. Record
//! `n` is a write when `floor(n*W/100)` steps past `floor((n-1)*W/100)`.
//! When `100 / W` is a whole number this is exactly "every factor-th
//! record"; for other percentages writes are spread so the ratio holds.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mixer {
    write_percent: u64,
}

impl Mixer {
    pub fn new(write_percent: u32) -> Self {
        Self {
            write_percent: u64::from(write_percent.min(100)),
        }
    }

    pub fn is_write(&self, n: u64) -> bool {
        match self.write_percent {
            0 => false,
            100 => true,
            w => {
                let n = u128::from(n);
                let w = u128::from(w);
                (n * w / 100) > (n.saturating_sub(1) * w / 100)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_factors_match_modulo() {
        for w in [1u32, 2, 4, 5, 10, 20, 25, 50] {
            let m = Mixer::new(w);
            let factor = (100 / w) as u64;
            for n in 1..=1000u64 {
                assert_eq!(m.is_write(n), n % factor == 0, "w={} n={}", w, n);
            }
        }
    }

    #[test]
    fn test_extremes_and_ratio() {
        assert!((1..500).all(|n| !Mixer::new(0).is_write(n)));
        assert!((1..500).all(|n| Mixer::new(100).is_write(n)));
        let writes = (1..=1000).filter(|n| Mixer::new(30).is_write(*n)).count();
        assert_eq!(writes, 300);
        let m = Mixer::new(75);
        assert_eq!(m.is_write(7), Mixer::new(75).is_write(7));
    }
}
