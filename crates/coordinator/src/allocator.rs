//! Byte-range split between the primary channel and secondary devices.

/// Share of the file sent over the primary channel by default.
pub const DEFAULT_PRIMARY_RATIO: f64 = 0.6;

/// Bounds applied to a capability-derived primary ratio.
pub const MIN_PRIMARY_RATIO: f64 = 0.5;
pub const MAX_PRIMARY_RATIO: f64 = 0.9;

/// Throughput assumed for a secondary device with no usable figure, in Mbps.
pub const DEFAULT_SECONDARY_SPEED_MBPS: f64 = 2.0;

/// Result of splitting a file across channels.
///
/// `primary_ratio + secondary_ratio == 1.0` and
/// `primary_size + secondary_sizes.sum() == file_size` always hold.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub primary_ratio: f64,
    pub secondary_ratio: f64,
    pub primary_size: u64,
    /// One entry per secondary device, in request order.
    pub secondary_sizes: Vec<u64>,
}

impl Allocation {
    pub fn secondary_total(&self) -> u64 {
        self.secondary_sizes.iter().sum()
    }

    /// `(offset, len)` of each secondary range. Ranges follow the primary
    /// range `[0, primary_size)` back to back.
    pub fn secondary_ranges(&self) -> Vec<(u64, u64)> {
        let mut offset = self.primary_size;
        self.secondary_sizes
            .iter()
            .map(|&len| {
                let range = (offset, len);
                offset += len;
                range
            })
            .collect()
    }
}

/// Computes channel splits. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct BandwidthAllocator;

impl BandwidthAllocator {
    /// Fixed 60/40 split, with the secondary share divided evenly.
    ///
    /// With no secondary devices the primary channel carries everything.
    pub fn allocate(&self, file_size: u64, secondary_count: usize) -> Allocation {
        split(file_size, DEFAULT_PRIMARY_RATIO, secondary_count)
    }

    /// Split weighted by nominal throughput (Mbps).
    ///
    /// Non-positive or non-finite secondary speeds fall back to
    /// [`DEFAULT_SECONDARY_SPEED_MBPS`].
    pub fn allocate_by_capability(
        &self,
        file_size: u64,
        primary_speed: f64,
        secondary_speeds: &[f64],
    ) -> Allocation {
        if secondary_speeds.is_empty() {
            return split(file_size, 1.0, 0);
        }
        let mean = secondary_speeds
            .iter()
            .map(|&s| {
                if s.is_finite() && s > 0.0 {
                    s
                } else {
                    DEFAULT_SECONDARY_SPEED_MBPS
                }
            })
            .sum::<f64>()
            / secondary_speeds.len() as f64;

        let primary_speed = if primary_speed.is_finite() {
            primary_speed.max(0.0)
        } else {
            0.0
        };
        let ratio = (primary_speed / (primary_speed + mean)).clamp(MIN_PRIMARY_RATIO, MAX_PRIMARY_RATIO);
        split(file_size, ratio, secondary_speeds.len())
    }
}

fn split(file_size: u64, primary_ratio: f64, secondary_count: usize) -> Allocation {
    if secondary_count == 0 {
        return Allocation {
            primary_ratio: 1.0,
            secondary_ratio: 0.0,
            primary_size: file_size,
            secondary_sizes: Vec::new(),
        };
    }

    // 1 - r is exact for r in [0.5, 1], so the ratios sum to exactly 1.
    let secondary_ratio = 1.0 - primary_ratio;

    // Parts per million, rounded up, keeps the byte math integral.
    let ppm = (primary_ratio * 1_000_000.0).round() as u128;
    let primary_size =
        ((u128::from(file_size) * ppm).div_ceil(1_000_000)).min(u128::from(file_size)) as u64;

    let secondary_total = file_size - primary_size;
    let n = secondary_count as u64;
    let each = secondary_total / n;
    let mut secondary_sizes = vec![each; secondary_count];
    if let Some(last) = secondary_sizes.last_mut() {
        *last += secondary_total - each * n;
    }

    Allocation {
        primary_ratio,
        secondary_ratio,
        primary_size,
        secondary_sizes,
    }
}
