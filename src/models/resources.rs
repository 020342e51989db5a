use serde::{Deserialize, Serialize};

const CPU_EPSILON: f64 = 1e-9;

/// Resource quantities along every schedulable dimension.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in cores (fractional allowed, "100m" == 0.1)
    pub cpu: f64,
    /// Memory in bytes
    pub memory: u64,
    /// Disk in bytes
    pub disk: u64,
    /// Number of GPUs
    pub gpu: u64,
}

impl Resources {
    pub fn new(cpu: f64, memory: u64, disk: u64, gpu: u64) -> Self {
        Self {
            cpu,
            memory,
            disk,
            gpu,
        }
    }

    pub fn cpu(cpu: f64) -> Self {
        Self {
            cpu,
            ..Default::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu <= CPU_EPSILON && self.memory == 0 && self.disk == 0 && self.gpu == 0
    }

    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu + other.cpu,
            memory: self.memory.saturating_add(other.memory),
            disk: self.disk.saturating_add(other.disk),
            gpu: self.gpu.saturating_add(other.gpu),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    /// Component-wise maximum.
    pub fn max(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.max(other.cpu),
            memory: self.memory.max(other.memory),
            disk: self.disk.max(other.disk),
            gpu: self.gpu.max(other.gpu),
        }
    }

    /// Multiply every dimension by `n` (used to size a whole job).
    pub fn times(&self, n: u32) -> Resources {
        Resources {
            cpu: self.cpu * f64::from(n),
            memory: self.memory.saturating_mul(u64::from(n)),
            disk: self.disk.saturating_mul(u64::from(n)),
            gpu: self.gpu.saturating_mul(u64::from(n)),
        }
    }

    /// True when every dimension of `self` is <= the same dimension of `capacity`.
    pub fn fits_within(&self, capacity: &Resources) -> bool {
        self.cpu <= capacity.cpu + CPU_EPSILON
            && self.memory <= capacity.memory
            && self.disk <= capacity.disk
            && self.gpu <= capacity.gpu
    }

    /// True when any dimension strictly increased relative to `before`.
    pub fn any_greater_than(&self, before: &Resources) -> bool {
        self.cpu > before.cpu + CPU_EPSILON
            || self.memory > before.memory
            || self.disk > before.disk
            || self.gpu > before.gpu
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={} memory={} disk={} gpu={}",
            self.cpu, self.memory, self.disk, self.gpu
        )
    }
}

/// Upper bounds along each dimension. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu: Option<f64>,
    pub memory: Option<u64>,
    pub disk: Option<u64>,
    pub gpu: Option<u64>,
}

impl ResourceLimits {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn admits(&self, requested: &Resources) -> bool {
        self.cpu.map_or(true, |max| requested.cpu <= max + CPU_EPSILON)
            && self.memory.map_or(true, |max| requested.memory <= max)
            && self.disk.map_or(true, |max| requested.disk <= max)
            && self.gpu.map_or(true, |max| requested.gpu <= max)
    }
}

/// Parse a CPU quantity: "2", "0.5" or millicores such as "250m".
pub fn parse_cpu(s: &str) -> Result<f64, String> {
    let s = s.trim();
    let value = if let Some(milli) = s.strip_suffix('m') {
        milli
            .parse::<f64>()
            .map(|m| m / 1000.0)
            .map_err(|_| format!("invalid cpu quantity: {s:?}"))?
    } else {
        s.parse::<f64>()
            .map_err(|_| format!("invalid cpu quantity: {s:?}"))?
    };
    if value.is_sign_negative() || !value.is_finite() {
        return Err(format!("invalid cpu quantity: {s:?}"));
    }
    Ok(value)
}

/// Parse a byte quantity with binary ("Ki", "Mi", "Gi", "Ti") or
/// decimal ("K", "M", "G", "T") suffixes. A bare number is bytes.
pub fn parse_bytes(s: &str) -> Result<u64, String> {
    const SUFFIXES: [(&str, u64); 8] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];

    let s = s.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((s, 1));

    let number: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid byte quantity: {s:?}"))?;
    if number.is_sign_negative() || !number.is_finite() {
        return Err(format!("invalid byte quantity: {s:?}"));
    }
    Ok((number * multiplier as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cpu_quantities() {
        assert_eq!(parse_cpu("2").unwrap(), 2.0);
        assert_eq!(parse_cpu("0.5").unwrap(), 0.5);
        assert!((parse_cpu("100m").unwrap() - 0.1).abs() < 1e-12);
        assert!(parse_cpu("abc").is_err());
        assert!(parse_cpu("-1").is_err());
    }

    #[test]
    fn parse_byte_quantities() {
        assert_eq!(parse_bytes("100Mi").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_bytes("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_bytes("10G").unwrap(), 10_000_000_000);
        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert!(parse_bytes("lots").is_err());
    }

    #[test]
    fn fits_within_checks_every_dimension() {
        let capacity = Resources::new(2.0, 1024, 0, 1);
        assert!(Resources::new(2.0, 1024, 0, 1).fits_within(&capacity));
        assert!(!Resources::new(2.5, 0, 0, 0).fits_within(&capacity));
        assert!(!Resources::new(0.0, 0, 1, 0).fits_within(&capacity));
        assert!(!Resources::new(0.0, 0, 0, 2).fits_within(&capacity));
    }

    #[test]
    fn saturating_sub_never_goes_negative() {
        let a = Resources::new(1.0, 10, 0, 0);
        let b = Resources::new(2.0, 20, 5, 1);
        assert_eq!(a.saturating_sub(&b), Resources::default());
    }

    #[test]
    fn limits_treat_none_as_unbounded() {
        let limits = ResourceLimits {
            cpu: Some(4.0),
            ..Default::default()
        };
        assert!(limits.admits(&Resources::new(4.0, u64::MAX, u64::MAX, 99)));
        assert!(!limits.admits(&Resources::cpu(4.5)));
        assert!(ResourceLimits::unbounded().admits(&Resources::cpu(1e9)));
    }
}
