//! Best-effort resource sampling for heartbeats. Values are fractions in
//! [0, 1]; off Linux (or when /proc is unreadable) they fall back to zero,
//! which simply makes this server look attractive to the allocator.

/// One-minute load average divided by core count, clamped to [0, 1].
pub fn cpu_usage() -> f64 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0);
    read_loadavg()
        .map(|load| (load / cores).clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

/// `1 - MemAvailable / MemTotal`, clamped to [0, 1].
pub fn memory_usage() -> f64 {
    read_meminfo()
        .map(|(total, available)| {
            if total == 0 {
                0.0
            } else {
                (1.0 - available as f64 / total as f64).clamp(0.0, 1.0)
            }
        })
        .unwrap_or(0.0)
}

fn read_loadavg() -> Option<f64> {
    let text = std::fs::read_to_string("/proc/loadavg").ok()?;
    text.split_whitespace().next()?.parse().ok()
}

fn read_meminfo() -> Option<(u64, u64)> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kib(rest);
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    Some((total?, available?))
}

fn parse_kib(rest: &str) -> Option<u64> {
    rest.trim().split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_stay_in_unit_range() {
        let cpu = cpu_usage();
        assert!((0.0..=1.0).contains(&cpu));
        let mem = memory_usage();
        assert!((0.0..=1.0).contains(&mem));
    }

    #[test]
    fn kib_parsing() {
        assert_eq!(parse_kib("  16384 kB"), Some(16384));
        assert_eq!(parse_kib("garbage"), None);
    }
}
