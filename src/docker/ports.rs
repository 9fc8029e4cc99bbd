// Host port allocation for published container ports
// Hands out ports from a fixed range; concurrent runs get disjoint ranges

use crate::errors::{NetError, Result};
use std::collections::BTreeMap;

/// Tracks which host ports in `[start, end)` are in use.
///
/// Not synchronized: every test run owns its own tracker.
#[derive(Debug, Clone)]
pub struct FreeHostPortTracker {
    start: u16,
    end: u16,
    /// Port -> taken
    taken: BTreeMap<u16, bool>,
}

impl FreeHostPortTracker {
    /// Create a tracker over `[start, end)`. An empty or inverted range is a config error.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start >= end {
            return Err(NetError::ConfigError(format!(
                "Invalid host port range {}-{}: start must be below end",
                start, end
            )));
        }

        let taken = (start..end).map(|port| (port, false)).collect();
        Ok(Self { start, end, taken })
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Take the lowest free port in the range
    pub fn get_free_port(&mut self) -> Result<u16> {
        let free = self
            .taken
            .iter_mut()
            .find(|(_, taken)| !**taken)
            .map(|(port, taken)| {
                *taken = true;
                *port
            });

        free.ok_or(NetError::PortRangeExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool.
    ///
    /// Releasing a port that is free or outside the range is `PortNotAllocated`.
    pub fn release_port(&mut self, port: u16) -> Result<()> {
        match self.taken.get_mut(&port) {
            Some(taken) if *taken => {
                *taken = false;
                Ok(())
            }
            _ => Err(NetError::PortNotAllocated(port)),
        }
    }

    /// Number of ports still available
    pub fn free_count(&self) -> usize {
        self.taken.values().filter(|taken| !**taken).count()
    }
}

/// Carve `[start, end)` into `count` equal, disjoint sub-ranges.
///
/// Host ports are shared by every container on the host, so tests running
/// side by side each need their own slice. Leftover ports at the end of the
/// range are not handed out.
pub fn split_port_range(start: u16, end: u16, count: usize) -> Result<Vec<(u16, u16)>> {
    if start >= end {
        return Err(NetError::ConfigError(format!(
            "Invalid host port range {}-{}: start must be below end",
            start, end
        )));
    }
    if count == 0 {
        return Ok(Vec::new());
    }

    let size = usize::from(end - start);
    let per_range = size / count;
    if per_range == 0 {
        return Err(NetError::PortRangeExhausted { start, end });
    }

    Ok((0..count)
        .map(|index| {
            // Bounded by `end`, so the casts cannot truncate
            let sub_start = usize::from(start) + index * per_range;
            (sub_start as u16, (sub_start + per_range) as u16)
        })
        .collect())
}

/// Whether two `[start, end)` ranges share a port
pub fn ranges_overlap(a: (u16, u16), b: (u16, u16)) -> bool {
    a.0 < b.1 && b.0 < a.1
}
