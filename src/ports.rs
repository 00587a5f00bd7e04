//! Managed TCP port range and the table of ports held by spawned processes

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Inclusive range of ports handed out to spawned backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortRangeError {
    #[error("port range must have the form start-end, got '{0}'")]
    Format(String),
    #[error("invalid port number '{0}'")]
    Port(String),
    #[error("port range start {start} is greater than end {end}")]
    Inverted { start: u16, end: u16 },
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, PortRangeError> {
        if start == 0 {
            return Err(PortRangeError::Port("0".to_string()));
        }
        if start > end {
            return Err(PortRangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    fn next_after(&self, port: u16) -> u16 {
        if port >= self.end {
            self.start
        } else {
            port + 1
        }
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| PortRangeError::Format(s.to_string()))?;
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| PortRangeError::Port(p.trim().to_string()))
        };
        PortRange::new(parse(start)?, parse(end)?)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Ports currently bound to locally spawned processes, plus the rotating
/// allocation cursor.
///
/// A port present in the table is never handed out again until it is
/// released. The table is owned by one launcher per node; callers serialize
/// access (the launcher keeps it behind a mutex and never holds the lock
/// across an await point).
#[derive(Debug)]
pub struct PortTable<H> {
    range: PortRange,
    cursor: u16,
    entries: HashMap<u16, H>,
}

impl<H> PortTable<H> {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            cursor: range.start,
            entries: HashMap::new(),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Find the next free port, scanning circularly from the cursor.
    ///
    /// Returns `None` when every port in the range is held. The port is not
    /// reserved until [`insert`](Self::insert) is called with it.
    pub fn allocate(&mut self) -> Option<u16> {
        let mut candidate = self.cursor;
        for _ in 0..self.range.len() {
            if !self.entries.contains_key(&candidate) {
                self.cursor = self.range.next_after(candidate);
                return Some(candidate);
            }
            candidate = self.range.next_after(candidate);
        }
        None
    }

    pub fn insert(&mut self, port: u16, handle: H) {
        self.entries.insert(port, handle);
    }

    pub fn release(&mut self, port: u16) -> Option<H> {
        self.entries.remove(&port)
    }

    pub fn get_mut(&mut self, port: u16) -> Option<&mut H> {
        self.entries.get_mut(&port)
    }

    /// Ports currently held, in no particular order
    pub fn ports(&self) -> Vec<u16> {
        self.entries.keys().copied().collect()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.entries.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;

    fn table(start: u16, end: u16) -> PortTable<()> {
        PortTable::new(PortRange::new(start, end).unwrap())
    }

    #[test]
    fn test_parse_port_range() {
        let range: PortRange = "8000-9000".parse().unwrap();
        assert_eq!(range, PortRange { start: 8000, end: 9000 });
        assert_eq!(range.len(), 1001);
        assert_eq!(range.to_string(), "8000-9000");
    }

    #[test]
    fn test_parse_port_range_errors() {
        assert!(matches!("8000".parse::<PortRange>(), Err(PortRangeError::Format(_))));
        assert!(matches!("-9000".parse::<PortRange>(), Err(PortRangeError::Port(_))));
        assert!(matches!("8000-".parse::<PortRange>(), Err(PortRangeError::Port(_))));
        assert!(matches!("abc-9000".parse::<PortRange>(), Err(PortRangeError::Port(_))));
        assert!(matches!("0-10".parse::<PortRange>(), Err(PortRangeError::Port(_))));
        assert!(matches!(
            "9000-8000".parse::<PortRange>(),
            Err(PortRangeError::Inverted { start: 9000, end: 8000 })
        ));
    }

    #[test]
    fn test_single_port_range() {
        let mut ports = table(8000, 8000);
        assert_eq!(ports.allocate(), Some(8000));
        ports.insert(8000, ());
        assert_eq!(ports.allocate(), None);
        ports.release(8000);
        assert_eq!(ports.allocate(), Some(8000));
    }

    #[test]
    fn test_allocation_advances_cursor() {
        let mut ports = table(8000, 8002);
        assert_eq!(ports.allocate(), Some(8000));
        ports.insert(8000, ());
        assert_eq!(ports.allocate(), Some(8001));
        ports.insert(8001, ());
        assert_eq!(ports.allocate(), Some(8002));
        ports.insert(8002, ());
        assert_eq!(ports.allocate(), None);
        assert_eq!(ports.len(), 3);
    }

    #[test]
    fn test_allocation_wraps_around() {
        let mut ports = table(8000, 8002);
        for _ in 0..3 {
            let port = ports.allocate().unwrap();
            ports.insert(port, ());
        }
        ports.release(8001);
        // cursor wrapped back to the start; 8000 is still held
        assert_eq!(ports.allocate(), Some(8001));
    }

    #[test]
    fn test_failed_allocation_has_no_side_effects() {
        let mut ports = table(8000, 8001);
        ports.insert(8000, ());
        ports.insert(8001, ());
        assert_eq!(ports.allocate(), None);
        assert_eq!(ports.allocate(), None);
        assert_eq!(ports.len(), 2);
        ports.release(8000);
        assert_eq!(ports.allocate(), Some(8000));
    }

    #[test]
    fn test_allocation_uniqueness_under_random_releases() {
        let mut ports = table(9000, 9015);
        let mut held = HashSet::new();
        let mut rng = rand::thread_rng();

        for _ in 0..2000 {
            if rng.gen_bool(0.6) {
                match ports.allocate() {
                    Some(port) => {
                        assert!(ports.range().contains(port));
                        assert!(held.insert(port), "port {} handed out twice", port);
                        ports.insert(port, ());
                    }
                    None => assert_eq!(held.len(), ports.range().len()),
                }
            } else if let Some(&port) = held.iter().next() {
                held.remove(&port);
                ports.release(port);
            }
            assert_eq!(held.len(), ports.len());
        }
    }
}
