//! Runtime sampling
//!
//! Linux figures come from procfs. Unreadable files contribute nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

pub const RANDOM_VALUE: &str = "RandomValue";

/// Source of current gauge readings
pub trait Sampler: Send + Sync {
    fn sample(&self) -> BTreeMap<String, f64>;
}

/// Process and host figures from `/proc`, plus `RandomValue`
#[derive(Debug, Default)]
pub struct SystemSampler {
    /// Previous `(busy, total)` jiffies per CPU, for utilization deltas
    cpu_times: Mutex<HashMap<usize, (u64, u64)>>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::default()
    }

    fn cpu_utilization(&self, stat: &str, out: &mut BTreeMap<String, f64>) {
        let mut previous = match self.cpu_times.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for (cpu, busy, total) in parse_cpu_lines(stat) {
            let (prev_busy, prev_total) = previous.get(&cpu).copied().unwrap_or((0, 0));
            let delta_total = total.saturating_sub(prev_total);
            let percent = if delta_total == 0 {
                0.0
            } else {
                busy.saturating_sub(prev_busy) as f64 / delta_total as f64 * 100.0
            };
            out.insert(format!("CPUutilization{}", cpu + 1), percent);
            previous.insert(cpu, (busy, total));
        }
    }
}

impl Sampler for SystemSampler {
    fn sample(&self) -> BTreeMap<String, f64> {
        let mut gauges = BTreeMap::new();

        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            gauges.extend(parse_status(&status));
        }
        if let Ok(stat) = std::fs::read_to_string("/proc/self/stat") {
            gauges.extend(parse_process_stat(&stat));
        }
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            gauges.extend(parse_meminfo(&meminfo));
        }
        if let Ok(stat) = std::fs::read_to_string("/proc/stat") {
            self.cpu_utilization(&stat, &mut gauges);
        }

        gauges.insert(RANDOM_VALUE.to_string(), rand::random::<f64>());
        gauges
    }
}

/// Value of a `Key:   1234 kB` line in bytes
fn kib_field(line: &str, key: &str) -> Option<f64> {
    let rest = line.strip_prefix(key)?.strip_prefix(':')?;
    let kib: f64 = rest.split_whitespace().next()?.parse().ok()?;
    Some(kib * 1024.0)
}

static STATUS_FIELDS: [(&str, &str); 5] = [
    ("VmRSS", "ResidentMemory"),
    ("VmHWM", "PeakResidentMemory"),
    ("VmSize", "VirtualMemory"),
    ("VmData", "DataMemory"),
    ("VmStk", "StackMemory"),
];

fn parse_status(status: &str) -> Vec<(String, f64)> {
    status
        .lines()
        .flat_map(|line| {
            STATUS_FIELDS
                .iter()
                .filter_map(move |(key, name)| kib_field(line, key).map(|v| (name.to_string(), v)))
        })
        .collect()
}

fn parse_meminfo(meminfo: &str) -> Vec<(String, f64)> {
    meminfo
        .lines()
        .filter_map(|line| {
            kib_field(line, "MemTotal")
                .map(|v| ("TotalMemory".to_string(), v))
                .or_else(|| kib_field(line, "MemFree").map(|v| ("FreeMemory".to_string(), v)))
        })
        .collect()
}

/// User and system CPU time of this process, in clock ticks
fn parse_process_stat(stat: &str) -> Vec<(String, f64)> {
    // The command name may contain spaces; fields resume after the last ')'
    let Some(rest) = stat.rsplit_once(')').map(|(_, rest)| rest) else {
        return Vec::new();
    };
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // utime and stime are fields 14 and 15; `rest` starts at field 3
    let tick = |index: usize| fields.get(index).and_then(|v| v.parse::<f64>().ok());
    let mut out = Vec::with_capacity(2);
    if let Some(utime) = tick(11) {
        out.push(("UserCPUTicks".to_string(), utime));
    }
    if let Some(stime) = tick(12) {
        out.push(("SystemCPUTicks".to_string(), stime));
    }
    out
}

/// `(cpu index, busy jiffies, total jiffies)` for each `cpuN` line
fn parse_cpu_lines(stat: &str) -> Vec<(usize, u64, u64)> {
    stat.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let index: usize = parts.next()?.strip_prefix("cpu")?.parse().ok()?;
            let values: Vec<u64> = parts.filter_map(|v| v.parse().ok()).collect();
            if values.len() < 4 {
                return None;
            }

            let total: u64 = values.iter().sum();
            // idle and iowait
            let idle = values[3] + values.get(4).copied().unwrap_or(0);
            Some((index, total.saturating_sub(idle), total))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let status = "Name:\tmetricsd\nVmHWM:\t    2048 kB\nVmRSS:\t    1024 kB\nThreads:\t4\n";
        let parsed: BTreeMap<_, _> = parse_status(status).into_iter().collect();

        assert_eq!(parsed.get("ResidentMemory"), Some(&(1024.0 * 1024.0)));
        assert_eq!(parsed.get("PeakResidentMemory"), Some(&(2048.0 * 1024.0)));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16000 kB\nMemFree:         4000 kB\nMemAvailable:    8000 kB\n";
        let parsed: BTreeMap<_, _> = parse_meminfo(meminfo).into_iter().collect();

        assert_eq!(parsed.get("TotalMemory"), Some(&(16000.0 * 1024.0)));
        assert_eq!(parsed.get("FreeMemory"), Some(&(4000.0 * 1024.0)));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_process_stat() {
        let stat = "4242 (metrics d) S 1 4242 4242 0 -1 4194560 100 0 0 0 37 11 0 0 20 0 4 0";
        let parsed: BTreeMap<_, _> = parse_process_stat(stat).into_iter().collect();

        assert_eq!(parsed.get("UserCPUTicks"), Some(&37.0));
        assert_eq!(parsed.get("SystemCPUTicks"), Some(&11.0));
    }

    #[test]
    fn test_cpu_utilization_delta() {
        let sampler = SystemSampler::new();
        let mut out = BTreeMap::new();

        sampler.cpu_utilization("cpu  10 0 10 80 0\ncpu0 10 0 10 80 0\n", &mut out);
        assert_eq!(out.get("CPUutilization1"), Some(&20.0));
        assert!(!out.contains_key("CPUutilization0"));

        sampler.cpu_utilization("cpu0 60 0 10 130 0\n", &mut out);
        assert_eq!(out.get("CPUutilization1"), Some(&50.0));
    }

    #[test]
    fn test_random_value_always_present() {
        let sample = SystemSampler::new().sample();
        let random = sample.get(RANDOM_VALUE).copied().unwrap();
        assert!((0.0..1.0).contains(&random));
    }
}
