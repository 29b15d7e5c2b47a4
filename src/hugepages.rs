//! Hugepage usage advice, read from `/proc/meminfo`.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

pub const MEMINFO_PATH: &str = "/proc/meminfo";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HugepageUsage {
    pub total: u32,
    pub free: u32,
}

impl HugepageUsage {
    /// Parses the `HugePages_Total` and `HugePages_Free` entries. Returns
    /// `None` when either is missing or not a number.
    pub fn parse(meminfo: &str) -> Option<Self> {
        Some(Self {
            total: parse_value(meminfo, "HugePages_Total:")?,
            free: parse_value(meminfo, "HugePages_Free:")?,
        })
    }

    pub fn read(path: impl AsRef<Path>) -> Option<Self> {
        match fs::read_to_string(path.as_ref()) {
            Ok(s) => Self::parse(&s),
            Err(e) => {
                info!(
                    "Can't analyze hugepage usage: failed to open {}: {}",
                    path.as_ref().display(),
                    e
                );
                None
            }
        }
    }

    /// Suggested total when more than half of the pages sit unused.
    pub fn suggestion(&self) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        if (self.free as f64) / (self.total as f64) <= 0.5 {
            return None;
        }
        let used = self.total.saturating_sub(self.free) as f64;
        Some((used * 1.15).ceil() as u64)
    }
}

fn parse_value(meminfo: &str, keyword: &str) -> Option<u32> {
    let mut words = meminfo.split_whitespace();
    words.find(|w| *w == keyword)?;
    match words.next()?.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            debug!("Failed to convert {} from meminfo", keyword);
            None
        }
    }
}

/// Logs whether the hugepage reservation could be lowered.
pub fn evaluate(path: impl AsRef<Path>) {
    let Some(usage) = HugepageUsage::read(path) else {
        debug!("Hugepages information not found");
        return;
    };
    if usage.total == 0 {
        debug!("HugePages_Total: 0 hugepages");
        return;
    }
    if let Some(lower) = usage.suggestion() {
        info!(
            "{} of {} of hugepages are free - number of hugepages can be lowered to e.g. {}",
            usage.free, usage.total, lower
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "\
MemTotal:       32594168 kB
MemFree:         2347528 kB
HugePages_Total:    1024
HugePages_Free:      900
HugePages_Rsvd:        0
Hugepagesize:       2048 kB
";

    #[test]
    fn test_parse() {
        let usage = HugepageUsage::parse(MEMINFO).unwrap();
        assert_eq!(usage, HugepageUsage { total: 1024, free: 900 });
    }

    #[test]
    fn test_suggestion() {
        // 124 used * 1.15 = 142.6
        assert_eq!(HugepageUsage { total: 1024, free: 900 }.suggestion(), Some(143));
        assert_eq!(HugepageUsage { total: 1024, free: 512 }.suggestion(), None);
        assert_eq!(HugepageUsage { total: 0, free: 0 }.suggestion(), None);
        assert_eq!(HugepageUsage { total: 10, free: 10 }.suggestion(), Some(0));
    }

    #[test]
    fn test_missing_or_garbled_entries() {
        assert!(HugepageUsage::parse("MemTotal: 1 kB\n").is_none());
        assert!(HugepageUsage::parse("HugePages_Total: x\nHugePages_Free: 1\n").is_none());
        assert!(HugepageUsage::parse("HugePages_Total: 4\nHugePages_Free:").is_none());
    }
}
