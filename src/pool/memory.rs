//! Available-memory probes used for admission control.

/// Reports how much memory could be handed to a new backend.
pub(crate) trait MemoryProbe: Send + Sync {
    /// Available memory in bytes, or `None` if it cannot be determined.
    fn available_bytes(&self) -> Option<u64>;
}

/// Reads `MemAvailable` from `/proc/meminfo`.
#[derive(Debug, Default)]
pub(crate) struct SystemMemory;

impl MemoryProbe for SystemMemory {
    fn available_bytes(&self) -> Option<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;

        parse_meminfo(&meminfo)
    }
}

fn parse_meminfo(meminfo: &str) -> Option<u64> {
    for line in meminfo.lines() {
        let Some(rest) = line.strip_prefix("MemAvailable:") else {
            continue;
        };

        let mut fields = rest.split_whitespace();

        let value: u64 = fields.next()?.parse().ok()?;

        return match fields.next() {
            Some("kB") | None => value.checked_mul(1024),
            Some(_) => None,
        };
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       32768000 kB\n\
                       MemFree:         1024000 kB\n\
                       MemAvailable:   16384000 kB\n\
                       Buffers:          204800 kB\n";

        assert_eq!(parse_meminfo(meminfo), Some(16384000 * 1024));
        assert_eq!(parse_meminfo("MemTotal: 1 kB\n"), None);
        assert_eq!(parse_meminfo("MemAvailable: lots kB\n"), None);
    }
}
