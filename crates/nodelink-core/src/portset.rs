//! Local port range for outbound connections
//!
//! When a node is given a client port range, every outbound connect binds
//! its local end to a port from a [`PortSet`]. Ports never handed out are
//! preferred; once the range is used up, released ports are reused least
//! recently released first, which gives sockets in TIME_WAIT the longest
//! time to clear.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct PortSet {
    min: u16,
    max: u16,
    /// Next never-used port; past `max` once the range is exhausted
    upto: u32,
    released: VecDeque<u16>,
}

impl PortSet {
    /// Ports `min..=max`
    pub fn new(min: u16, max: u16) -> Self {
        PortSet {
            min,
            max,
            upto: u32::from(min),
            released: VecDeque::new(),
        }
    }

    /// Take a port, `None` when every port is in use
    pub fn alloc(&mut self) -> Option<u16> {
        if self.upto <= u32::from(self.max) {
            let port = self.upto as u16;
            self.upto += 1;
            return Some(port);
        }
        self.released.pop_front()
    }

    /// Give `port` back for reuse
    pub fn release(&mut self, port: u16) {
        debug_assert!(self.contains(port));
        debug_assert!(!self.released.contains(&port));
        self.released.push_back(port);
    }

    #[inline]
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Ports that can still be handed out
    pub fn available(&self) -> usize {
        let fresh = (u32::from(self.max) + 1).saturating_sub(self.upto) as usize;
        fresh + self.released.len()
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ports_first() {
        let mut ps = PortSet::new(5000, 5002);
        assert_eq!(ps.alloc(), Some(5000));
        ps.release(5000);
        // 5000 is free again, but unused ports come first
        assert_eq!(ps.alloc(), Some(5001));
        assert_eq!(ps.alloc(), Some(5002));
        assert_eq!(ps.alloc(), Some(5000));
        assert_eq!(ps.alloc(), None);
        assert_eq!(ps.available(), 0);
    }

    #[test]
    fn test_reuse_least_recently_released() {
        let mut ps = PortSet::new(7000, 7002);
        let ports: Vec<u16> = (0..3).filter_map(|_| ps.alloc()).collect();
        assert_eq!(ports, vec![7000, 7001, 7002]);
        ps.release(7002);
        ps.release(7000);
        assert_eq!(ps.available(), 2);
        assert_eq!(ps.alloc(), Some(7002));
        assert_eq!(ps.alloc(), Some(7000));
        assert_eq!(ps.alloc(), None);
    }

    #[test]
    fn test_top_of_port_space() {
        let mut ps = PortSet::new(65534, 65535);
        assert_eq!(ps.available(), 2);
        assert_eq!(ps.alloc(), Some(65534));
        assert_eq!(ps.alloc(), Some(65535));
        assert_eq!(ps.alloc(), None);
        assert!(ps.contains(65535));
        assert!(!ps.contains(65533));
    }

    #[test]
    fn test_dropped_port_never_returns() {
        // A port that failed to bind is simply not released
        let mut ps = PortSet::new(100, 101);
        assert_eq!(ps.alloc(), Some(100));
        assert_eq!(ps.alloc(), Some(101));
        ps.release(101);
        assert_eq!(ps.available(), 1);
        assert_eq!(ps.alloc(), Some(101));
        assert_eq!(ps.alloc(), None);
    }
}
