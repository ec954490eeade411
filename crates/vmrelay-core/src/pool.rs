//! Scan-based allocation from finite resource pools
//!
//! A pool is an inclusive numeric range plus a render function mapping each
//! integer to a resource value (an IP string or a port number). Allocation
//! is a linear scan for the lowest unused value; ranges are small (hundreds)
//! so O(range) is acceptable.

use std::collections::HashSet;
use std::hash::Hash;

use crate::error::CoordinatorError;

/// A bounded pool of allocatable resource values
pub struct Pool<T> {
    label: &'static str,
    start: u32,
    end: u32,
    render: Box<dyn Fn(u32) -> T + Send + Sync>,
}

impl<T: Eq + Hash> Pool<T> {
    /// Create a pool over the inclusive range `start..=end`.
    pub fn new(
        label: &'static str,
        start: u32,
        end: u32,
        render: impl Fn(u32) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            label,
            start,
            end,
            render: Box::new(render),
        }
    }

    /// Return the lowest value in range that is in neither `used` nor
    /// `reserved`, or fail with [`CoordinatorError::PoolExhausted`].
    ///
    /// `reserved` holds values handed out earlier within the same
    /// lock-held operation but not yet persisted, so that several
    /// allocations in one request do not collide with each other.
    pub fn allocate(
        &self,
        used: &HashSet<T>,
        reserved: &HashSet<T>,
    ) -> Result<T, CoordinatorError> {
        for i in self.start..=self.end {
            let candidate = (self.render)(i);
            if !used.contains(&candidate) && !reserved.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(CoordinatorError::PoolExhausted(self.label))
    }
}

/// Pool of private IP addresses: `<base><suffix>` for each suffix in range.
pub fn ip_pool(base: &str, start: u32, end: u32) -> Pool<String> {
    let base = base.to_string();
    Pool::new("private IP address", start, end, move |i| format!("{base}{i}"))
}

/// Pool of public tunnel ports.
pub fn port_pool(start: u16, end: u16) -> Pool<u16> {
    Pool::new("tunnel port", u32::from(start), u32::from(end), |i| i as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_unused() {
        let pool = port_pool(2222, 2230);
        let used = HashSet::from([2222, 2223]);

        let port = pool.allocate(&used, &HashSet::new()).unwrap();
        assert_eq!(port, 2224);
    }

    #[test]
    fn reserved_values_are_skipped() {
        let pool = port_pool(2222, 2230);
        let used = HashSet::from([2222]);
        let reserved = HashSet::from([2223, 2224]);

        let port = pool.allocate(&used, &reserved).unwrap();
        assert_eq!(port, 2225);
    }

    #[test]
    fn all_but_one_used_returns_the_free_value() {
        let pool = port_pool(2222, 2225);
        let used = HashSet::from([2222, 2223, 2225]);

        let port = pool.allocate(&used, &HashSet::new()).unwrap();
        assert_eq!(port, 2224);
    }

    #[test]
    fn full_pool_is_exhausted() {
        let pool = port_pool(2222, 2224);
        let used = HashSet::from([2222, 2223, 2224]);

        let result = pool.allocate(&used, &HashSet::new());
        assert!(matches!(result, Err(CoordinatorError::PoolExhausted(_))));
    }

    #[test]
    fn ip_pool_renders_suffixes() {
        let pool = ip_pool("192.168.56.", 11, 250);

        let ip = pool.allocate(&HashSet::new(), &HashSet::new()).unwrap();
        assert_eq!(ip, "192.168.56.11");

        let used = HashSet::from(["192.168.56.11".to_string()]);
        let next = pool.allocate(&used, &HashSet::new()).unwrap();
        assert_eq!(next, "192.168.56.12");
    }

    #[test]
    fn allocation_is_deterministic() {
        let pool = port_pool(2222, 2999);
        let used = HashSet::from([2222]);

        let first = pool.allocate(&used, &HashSet::new()).unwrap();
        let second = pool.allocate(&used, &HashSet::new()).unwrap();
        assert_eq!(first, second);
    }
}
