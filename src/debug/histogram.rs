//! Bucketed distribution of non-negative integers
//!
//! Bucket bounds grow roughly geometrically (about 20% per bucket), so small
//! values get exact buckets and large ones share wide ones. Totals are kept
//! as exact integers, which makes [`Histogram::merge`] commutative and
//! associative bit for bit.

use std::fmt;

lazy_static::lazy_static! {
    /// Exclusive upper bound of every bucket; the last one catches everything
    static ref BUCKET_LIMITS: Vec<u64> = bucket_limits();
}

fn bucket_limits() -> Vec<u64> {
    let mut limits = Vec::with_capacity(160);
    let mut limit = 1u64;
    while limit < 1 << 48 {
        limits.push(limit);
        limit = (limit + 1).max(limit + limit / 5);
    }
    limits.push(u64::MAX);
    limits
}

fn bucket_index(value: u64) -> usize {
    let idx = BUCKET_LIMITS.partition_point(|&limit| limit <= value);
    idx.min(BUCKET_LIMITS.len() - 1)
}

fn bucket_lower(idx: usize) -> u64 {
    if idx == 0 {
        0
    } else {
        BUCKET_LIMITS[idx - 1]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    buckets: Vec<u64>,
    count: u64,
    sum: u128,
    sum_squares: u128,
    min: u64,
    max: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: vec![0; BUCKET_LIMITS.len()],
            count: 0,
            sum: 0,
            sum_squares: 0,
            min: u64::MAX,
            max: 0,
        }
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: u64) {
        self.buckets[bucket_index(value)] += 1;
        self.count += 1;
        self.sum += value as u128;
        self.sum_squares += (value as u128) * (value as u128);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (dst, src) in self.buckets.iter_mut().zip(&other.buckets) {
            *dst += *src;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum_squares += other.sum_squares;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> u128 {
        self.sum
    }

    pub fn min(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let variance = (self.sum_squares as f64 * n - (self.sum as f64).powi(2)) / (n * n);
        variance.max(0.0).sqrt()
    }

    /// Value below which `p` percent of the observations fall, interpolated
    /// inside the bucket
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let threshold = self.count as f64 * (p / 100.0);
        let mut seen = 0.0;
        for (idx, &n) in self.buckets.iter().enumerate() {
            if n == 0 {
                continue;
            }
            seen += n as f64;
            if seen >= threshold {
                let left = bucket_lower(idx) as f64;
                let right = (BUCKET_LIMITS[idx] as f64).min(self.max as f64 + 1.0);
                let pos = (threshold - (seen - n as f64)) / n as f64;
                let r = left + (right - left) * pos;
                return r.clamp(self.min() as f64, self.max as f64);
            }
        }
        self.max as f64
    }

    pub fn median(&self) -> f64 {
        self.percentile(50.0)
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Count: {}  Average: {:.4}  StdDev: {:.2}",
            self.count,
            self.mean(),
            self.std_dev()
        )?;
        writeln!(
            f,
            "Min: {}  Median: {:.4}  Max: {}",
            self.min(),
            self.median(),
            self.max
        )?;
        writeln!(f, "{}", "-".repeat(54))?;

        let mult = if self.count == 0 {
            0.0
        } else {
            100.0 / self.count as f64
        };
        let mut cumulative = 0u64;
        for (idx, &n) in self.buckets.iter().enumerate() {
            if n == 0 {
                continue;
            }
            cumulative += n;
            let upper = match BUCKET_LIMITS[idx] {
                u64::MAX => "inf".to_string(),
                limit => limit.to_string(),
            };
            let marks = ((20.0 * n as f64 * mult / 100.0) + 0.5) as usize;
            writeln!(
                f,
                "[ {:>7}, {:>7} ) {:>7} {:>7.3}% {:>7.3}% {}",
                bucket_lower(idx),
                upper,
                n,
                mult * n as f64,
                mult * cumulative as f64,
                "#".repeat(marks)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_limits_are_increasing() {
        assert_eq!(BUCKET_LIMITS[0], 1);
        assert!(BUCKET_LIMITS.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*BUCKET_LIMITS.last().unwrap(), u64::MAX);
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(1), 1);
        assert_eq!(bucket_index(u64::MAX), BUCKET_LIMITS.len() - 1);
    }

    #[test]
    fn test_basic_stats() {
        let mut h = Histogram::new();
        for v in [2, 4, 4, 4, 5, 5, 7, 9] {
            h.add(v);
        }
        assert_eq!(h.count(), 8);
        assert_eq!(h.sum(), 40);
        assert_eq!(h.min(), 2);
        assert_eq!(h.max(), 9);
        assert!((h.mean() - 5.0).abs() < 1e-9);
        assert!((h.std_dev() - 2.0).abs() < 1e-9);
        let median = h.median();
        assert!((2.0..=9.0).contains(&median));
    }

    #[test]
    fn test_empty() {
        let h = Histogram::new();
        assert_eq!(h.min(), 0);
        assert_eq!(h.median(), 0.0);
        assert!(h.to_string().starts_with("Count: 0  Average: 0.0000"));
    }

    #[test]
    fn test_merge_is_order_independent() {
        let mut parts = Vec::new();
        for seed in 0..3u64 {
            let mut h = Histogram::new();
            for i in 0..100 {
                h.add((i * 7919 + seed * 104729) % 5000);
            }
            parts.push(h);
        }

        let mut ab_c = parts[0].clone();
        ab_c.merge(&parts[1]);
        ab_c.merge(&parts[2]);

        let mut bc = parts[1].clone();
        bc.merge(&parts[2]);
        let mut a_bc = parts[0].clone();
        a_bc.merge(&bc);

        let mut c_a_b = parts[2].clone();
        c_a_b.merge(&parts[0]);
        c_a_b.merge(&parts[1]);

        assert_eq!(ab_c, a_bc);
        assert_eq!(ab_c, c_a_b);
        assert_eq!(ab_c.count(), 300);
    }

    #[test]
    fn test_merge_with_empty_keeps_min() {
        let mut h = Histogram::new();
        h.add(10);
        h.merge(&Histogram::new());
        assert_eq!(h.min(), 10);
        assert_eq!(h.count(), 1);
    }

    #[test]
    fn test_render_lists_nonempty_buckets() {
        let mut h = Histogram::new();
        h.add(3);
        h.add(3);
        let text = h.to_string();
        assert!(text.contains("Count: 2"));
        assert!(text.contains("100.000%"));
        assert_eq!(text.lines().filter(|l| l.starts_with('[')).count(), 1);
    }
}
