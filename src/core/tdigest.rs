// 流式分位数草图(merging t-digest)。
// 压缩参数决定保留的质心数量，内存有界，尾部分位数误差随之收敛。

const DEFAULT_COMPRESSION: f64 = 100.0;
// 缓冲写满才触发一次合并，摊还更新成本
const BUFFER_FACTOR: usize = 5;

#[derive(Debug, Clone, Copy)]
struct Centroid {
    mean: f64,
    weight: f64,
}

#[derive(Debug, Clone)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    count: u64,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        TDigest::new(DEFAULT_COMPRESSION)
    }
}

impl TDigest {
    pub fn new(compression: f64) -> Self {
        let compression = compression.max(10.0);
        TDigest {
            compression,
            centroids: Vec::new(),
            buffer: Vec::with_capacity(compression as usize * BUFFER_FACTOR),
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.buffer.push(value);
        if self.buffer.len() >= self.buffer.capacity() {
            self.compress();
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    // q取0-100，返回值始终落在观测到的[min, max]内
    pub fn percentile(&mut self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.compress();
        let q = (q / 100.0).clamp(0.0, 1.0);
        let total = self.count as f64;
        let target = q * total;

        let mut cumulative = 0.0;
        for (i, c) in self.centroids.iter().enumerate() {
            // 质心权重的一半落在其均值左侧
            let mid = cumulative + c.weight / 2.0;
            if target <= mid {
                if i == 0 {
                    // 在最小值与首个质心之间插值
                    let span = (mid - 0.0).max(f64::MIN_POSITIVE);
                    let frac = (target / span).clamp(0.0, 1.0);
                    return self.min + (c.mean - self.min) * frac;
                }
                let prev = &self.centroids[i - 1];
                let prev_mid = cumulative - prev.weight / 2.0;
                let span = (mid - prev_mid).max(f64::MIN_POSITIVE);
                let frac = ((target - prev_mid) / span).clamp(0.0, 1.0);
                return (prev.mean + (c.mean - prev.mean) * frac).clamp(self.min, self.max);
            }
            cumulative += c.weight;
        }
        self.max
    }

    // 合并缓冲与已有质心，按分位带宽限制质心的最大权重
    fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        self.buffer.sort_by(|a, b| a.total_cmp(b));

        let mut merged: Vec<Centroid> = Vec::with_capacity(self.centroids.len() + self.buffer.len());
        {
            let mut ci = self.centroids.iter().peekable();
            let mut bi = self.buffer.iter().peekable();
            while ci.peek().is_some() || bi.peek().is_some() {
                let take_buffer = match (ci.peek(), bi.peek()) {
                    (Some(c), Some(v)) => **v < c.mean,
                    (None, Some(_)) => true,
                    _ => false,
                };
                if take_buffer {
                    let v = *bi.next().unwrap_or(&0.0);
                    merged.push(Centroid { mean: v, weight: 1.0 });
                } else if let Some(c) = ci.next() {
                    merged.push(*c);
                }
            }
        }
        self.buffer.clear();

        let total = self.count as f64;
        let mut compacted: Vec<Centroid> = Vec::with_capacity(self.compression as usize * 2);
        let mut weight_so_far = 0.0;
        for c in merged {
            match compacted.last_mut() {
                None => compacted.push(c),
                Some(last) => {
                    let proposed = last.weight + c.weight;
                    let q = (weight_so_far + proposed / 2.0) / total;
                    let limit = 4.0 * total * q * (1.0 - q) / self.compression;
                    if proposed <= limit.max(1.0) {
                        last.mean = (last.mean * last.weight + c.mean * c.weight) / proposed;
                        last.weight = proposed;
                    } else {
                        weight_so_far += last.weight;
                        compacted.push(c);
                    }
                }
            }
        }
        self.centroids = compacted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest() {
        let mut d = TDigest::default();
        assert_eq!(d.percentile(50.0), 0.0);
        assert_eq!(d.count(), 0);
        assert!(d.is_empty());
    }

    #[test]
    fn test_single_value() {
        let mut d = TDigest::default();
        d.add(42.0);
        assert!((d.percentile(50.0) - 42.0).abs() < 1e-9);
        assert!((d.percentile(99.0) - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_uniform_accuracy_within_one_percent_at_tail() {
        let mut d = TDigest::default();
        for i in 1..=100_000u64 {
            d.add(i as f64);
        }
        let p50 = d.percentile(50.0);
        let p99 = d.percentile(99.0);
        assert!((p50 - 50_000.0).abs() / 50_000.0 < 0.01, "p50={p50}");
        assert!((p99 - 99_000.0).abs() / 99_000.0 < 0.01, "p99={p99}");
    }

    #[test]
    fn test_percentile_monotonic_and_bounded() {
        let mut d = TDigest::default();
        // 偏态分布
        for i in 0..10_000u64 {
            let v = (i as f64 / 100.0).powi(2) + 1.0;
            d.add(v);
        }
        let p50 = d.percentile(50.0);
        let p95 = d.percentile(95.0);
        let p99 = d.percentile(99.0);
        assert!(p50 <= p95 && p95 <= p99, "p50={p50} p95={p95} p99={p99}");
        assert!(p99 <= d.max());
        assert!(p50 >= d.min());
        assert!(d.percentile(0.0) >= d.min());
        assert!(d.percentile(100.0) <= d.max());
    }

    #[test]
    fn test_centroid_memory_bounded() {
        let mut d = TDigest::new(100.0);
        for i in 0..1_000_000u64 {
            d.add((i % 10_000) as f64);
        }
        d.percentile(50.0);
        // 压缩后质心数量与压缩参数同量级，而不是与样本量同量级
        assert!(d.centroids.len() < 1000, "centroids={}", d.centroids.len());
    }

    #[test]
    fn test_ignores_non_finite() {
        let mut d = TDigest::default();
        d.add(f64::NAN);
        d.add(f64::INFINITY);
        d.add(5.0);
        assert_eq!(d.count(), 1);
        assert!((d.percentile(50.0) - 5.0).abs() < 1e-9);
    }
}
