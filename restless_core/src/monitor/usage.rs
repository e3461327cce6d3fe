use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

/// Kernel clock ticks per second assumed when converting `/proc/<pid>/stat` times.
const USER_HZ: f64 = 100.0;

/// One observation of the target process.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ResourceSample {
    /// CPU use since the previous sample, in percent of one core. `None` on the first sample.
    pub cpu_percent: Option<f64>,
    pub memory_bytes: u64,
}

/// Extension point for process resource sampling.
pub trait ResourceSampler: Send {
    /// Takes a sample, or `None` when the process cannot be observed.
    fn sample(&mut self) -> Option<ResourceSample>;
}

/// Samples a local process through Linux procfs.
#[derive(Debug)]
pub struct ProcfsSampler {
    proc_dir: PathBuf,
    last: Option<(u64, Instant)>,
}

impl ProcfsSampler {
    pub fn new(pid: u32) -> Self {
        Self {
            proc_dir: PathBuf::from(format!("/proc/{pid}")),
            last: None,
        }
    }

    fn cpu_ticks(&self) -> Option<u64> {
        let stat = std::fs::read_to_string(self.proc_dir.join("stat")).ok()?;
        // Fields after the parenthesised command name; utime and stime are the 12th and 13th.
        let after_comm = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string(self.proc_dir.join("status")).ok()?;
        parse_vm_rss(&status)
    }
}

impl ResourceSampler for ProcfsSampler {
    fn sample(&mut self) -> Option<ResourceSample> {
        let memory_bytes = self.resident_bytes()?;
        let ticks = self.cpu_ticks()?;
        let now = Instant::now();
        let cpu_percent = self.last.and_then(|(previous_ticks, previous_at)| {
            let wall = now.duration_since(previous_at).as_secs_f64();
            (wall > 0.0).then(|| {
                let busy = ticks.saturating_sub(previous_ticks) as f64 / USER_HZ;
                busy / wall * 100.0
            })
        });
        self.last = Some((ticks, now));
        Some(ResourceSample {
            cpu_percent,
            memory_bytes,
        })
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// A sustained trend worth a human look.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "trend")]
pub enum TrendAlert {
    MemoryGrowth { from_bytes: u64, to_bytes: u64 },
    CpuSaturation { average_percent: f64 },
}

impl TrendAlert {
    pub fn describe(&self) -> String {
        match self {
            TrendAlert::MemoryGrowth {
                from_bytes,
                to_bytes,
            } => format!("resident memory grew from {from_bytes} to {to_bytes} bytes"),
            TrendAlert::CpuSaturation { average_percent } => {
                format!("CPU saturated at {average_percent:.1}% across the sample window")
            }
        }
    }
}

/// Threshold policy over a sliding window of samples.
///
/// Memory growth is flagged when resident memory never decreases across a full
/// window and ends at least `memory_growth_ratio` times where it started. CPU
/// saturation is flagged when every sample in a full window is at or above
/// `cpu_saturation_percent`.
#[derive(Debug, Clone)]
pub struct ResourceTrendPolicy {
    window: usize,
    memory_growth_ratio: f64,
    cpu_saturation_percent: f64,
    samples: VecDeque<ResourceSample>,
}

impl ResourceTrendPolicy {
    pub fn new(window: usize, memory_growth_ratio: f64, cpu_saturation_percent: f64) -> Self {
        Self {
            window: window.max(2),
            memory_growth_ratio,
            cpu_saturation_percent,
            samples: VecDeque::new(),
        }
    }

    pub fn push(&mut self, sample: ResourceSample) -> Vec<TrendAlert> {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        if self.samples.len() < self.window {
            return Vec::new();
        }

        let mut alerts = Vec::new();
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return alerts;
        };
        let non_decreasing = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .all(|(a, b)| b.memory_bytes >= a.memory_bytes);
        if non_decreasing
            && first.memory_bytes > 0
            && last.memory_bytes as f64 >= first.memory_bytes as f64 * self.memory_growth_ratio
        {
            alerts.push(TrendAlert::MemoryGrowth {
                from_bytes: first.memory_bytes,
                to_bytes: last.memory_bytes,
            });
        }

        let cpu: Option<Vec<f64>> = self.samples.iter().map(|s| s.cpu_percent).collect();
        if let Some(cpu) = cpu {
            if cpu.iter().all(|&p| p >= self.cpu_saturation_percent) {
                alerts.push(TrendAlert::CpuSaturation {
                    average_percent: cpu.iter().sum::<f64>() / cpu.len() as f64,
                });
            }
        }
        alerts
    }
}
