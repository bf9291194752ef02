//! `/proc/zoneinfo` parsing.
//!
//! The file interleaves per-node stats (present only before the first
//! populated zone of a node) with per-zone watermark blocks. Only the fields
//! feeding watermark math are extracted; everything else is skipped.

use super::{match_field, parse_i64, FileReader};
use crate::error::{Error, Result};

const FILE: &str = "/proc/zoneinfo";

/// See `__MAX_NR_ZONES` in the kernel's mmzone.h.
const MAX_NR_ZONES: usize = 6;

const ZONE_FIELD_NAMES: [&str; 6] =
    ["nr_free_pages", "min", "low", "high", "present", "nr_free_cma"];
const NODE_FIELD_NAMES: [&str; 2] = ["nr_inactive_file", "nr_active_file"];
const NODE_STATS_MARKER: &str = "per-node stats";

/// Watermarks and occupancy of one memory zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct Zone {
    /// nr_free_pages.
    pub nr_free_pages: i64,
    /// min watermark.
    pub min: i64,
    /// low watermark.
    pub low: i64,
    /// high watermark.
    pub high: i64,
    /// Pages present in the zone; 0 means unpopulated.
    pub present: i64,
    /// nr_free_cma.
    pub nr_free_cma: i64,
    /// Largest value in the protection array.
    pub max_protection: i64,
}

/// One NUMA node's zones plus its file LRU stats.
#[derive(Debug, Default, Clone)]
pub struct Node {
    /// Node id.
    pub id: i32,
    /// Populated and parsed zones.
    pub zones: Vec<Zone>,
    /// nr_inactive_file.
    pub nr_inactive_file: i64,
    /// nr_active_file.
    pub nr_active_file: i64,
}

/// Parsed `/proc/zoneinfo`.
#[derive(Debug, Default, Clone)]
pub struct ZoneInfo {
    /// All nodes in file order.
    pub nodes: Vec<Node>,
    /// Sum of high watermark + protection across zones.
    pub totalreserve_pages: i64,
    /// Sum of nr_inactive_file across nodes.
    pub total_inactive_file: i64,
    /// Sum of nr_active_file across nodes.
    pub total_active_file: i64,
}

impl ZoneInfo {
    /// Parse zoneinfo content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut zi = ZoneInfo::default();
        let mut lines = content.lines().peekable();

        while let Some(line) = lines.next() {
            let Some(node_id) = parse_zone_header(line) else {
                continue;
            };

            let new_node = zi.nodes.last().map(|n| n.id != node_id).unwrap_or(true);
            if new_node {
                // Per-node stats follow the header of the node's first
                // populated zone.
                let mut node = Node { id: node_id, ..Default::default() };
                if lines.peek().map(|l| l.trim().starts_with(NODE_STATS_MARKER)).unwrap_or(false) {
                    lines.next();
                    parse_node_stats(&mut lines, &mut node)?;
                }
                zi.nodes.push(node);
            }

            let zone = parse_zone(&mut lines)?;
            let node = zi.nodes.last_mut().unwrap_or_else(|| unreachable!());
            if node.zones.len() < MAX_NR_ZONES {
                node.zones.push(zone);
            }
        }

        if zi.nodes.is_empty() {
            return Err(Error::Parse { file: FILE, reason: "no nodes found".into() });
        }

        for node in &zi.nodes {
            for zone in &node.zones {
                zi.totalreserve_pages += zone.max_protection + zone.high;
            }
            zi.total_inactive_file += node.nr_inactive_file;
            zi.total_active_file += node.nr_active_file;
        }
        Ok(zi)
    }

    /// Iterate over populated zones of all nodes.
    pub fn populated_zones(&self) -> impl Iterator<Item = &Zone> {
        self.nodes.iter().flat_map(|n| n.zones.iter()).filter(|z| z.present != 0)
    }
}

/// `Node <id>, zone <name>` header.
fn parse_zone_header(line: &str) -> Option<i32> {
    let rest = line.strip_prefix("Node ")?;
    let (id, rest) = rest.split_once(',')?;
    rest.trim_start().strip_prefix("zone")?;
    id.trim().parse().ok()
}

fn parse_node_stats<'a, I: Iterator<Item = &'a str>>(
    lines: &mut std::iter::Peekable<I>,
    node: &mut Node,
) -> Result<()> {
    let mut remaining = NODE_FIELD_NAMES.len();
    while remaining > 0 {
        let Some(line) = lines.next() else {
            return Err(Error::Parse { file: FILE, reason: "truncated node stats".into() });
        };
        let mut tokens = line.split_whitespace();
        let (Some(name), Some(value)) = (tokens.next(), tokens.next()) else {
            return Err(Error::Parse { file: FILE, reason: "bad node stats line".into() });
        };
        if let Some((idx, val)) = match_field(name, value, &NODE_FIELD_NAMES, FILE)? {
            match idx {
                0 => node.nr_inactive_file = val,
                _ => node.nr_active_file = val,
            }
            remaining -= 1;
        }
    }
    Ok(())
}

fn parse_zone<'a, I: Iterator<Item = &'a str>>(
    lines: &mut std::iter::Peekable<I>,
) -> Result<Zone> {
    let mut zone = Zone::default();
    while let Some(line) = lines.peek() {
        // The next zone or node starts here; hand the header back.
        if parse_zone_header(line).is_some() {
            break;
        }
        let line = lines.next().unwrap_or_else(|| unreachable!());
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else {
            continue;
        };

        if name == "pagesets" {
            // Nothing of interest below this point.
            break;
        }
        if name == "protection:" {
            zone.max_protection = parse_protection(line);
            continue;
        }

        let Some(value) = tokens.next() else {
            continue;
        };
        if let Some((idx, val)) = match_field(name, value, &ZONE_FIELD_NAMES, FILE)? {
            match idx {
                0 => zone.nr_free_pages = val,
                1 => zone.min = val,
                2 => zone.low = val,
                3 => zone.high = val,
                4 => zone.present = val,
                _ => zone.nr_free_cma = val,
            }
            if idx == 4 && val == 0 {
                // Unpopulated zone, nothing else matters.
                break;
            }
        }
    }
    Ok(zone)
}

/// `protection: (0, 1000, 2000)` — the watermark math wants the maximum.
fn parse_protection(line: &str) -> i64 {
    line.split(|c: char| c == '(' || c == ')' || c == ',' || c.is_whitespace())
        .filter_map(parse_i64)
        .take(MAX_NR_ZONES)
        .max()
        .unwrap_or(0)
}

/// Cached reader bound to `/proc/zoneinfo`.
pub struct ZoneInfoReader {
    reader: FileReader,
}

impl ZoneInfoReader {
    /// Create the reader against the live procfs.
    pub fn new() -> Self {
        Self { reader: FileReader::new(FILE, FILE) }
    }

    /// Re-read and parse.
    pub fn read(&mut self) -> Result<ZoneInfo> {
        ZoneInfo::parse(self.reader.read()?)
    }

    /// Prime the read buffer so pressure-time reads do not allocate.
    ///
    /// zoneinfo is the largest file we read, so one warm-up read sizes the
    /// shared buffer for everything else too.
    pub fn warm_up(&mut self) -> Result<()> {
        self.reader.read().map(|_| ())
    }
}

impl Default for ZoneInfoReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Node 0, zone      DMA
  per-node stats
      nr_inactive_anon 11
      nr_active_anon 22
      nr_inactive_file 3300
      nr_active_file 4400
      nr_unevictable 0
  pages free     3840
        min      68
        low      85
        high     102
        spanned  4095
        present  3997
        managed  3840
        protection: (0, 2991, 7676, 7676)
      nr_free_cma  0
  pagesets
    cpu: 0
              count: 0
Node 0, zone    DMA32
  pages free     65000
        min      1200
        low      1500
        high     1800
        spanned  1044480
        present  782288
        managed  765000
        protection: (0, 0, 4685, 4685)
      nr_free_cma  100
  pagesets
    cpu: 1
Node 0, zone   Movable
  pages free     0
        min      0
        low      0
        high     0
        spanned  0
        present  0
";

    #[test]
    fn test_parse_nodes_and_zones() {
        let zi = ZoneInfo::parse(SAMPLE).unwrap();
        assert_eq!(zi.nodes.len(), 1);
        assert_eq!(zi.nodes[0].zones.len(), 3);
        assert_eq!(zi.nodes[0].nr_inactive_file, 3300);
        assert_eq!(zi.nodes[0].nr_active_file, 4400);
        assert_eq!(zi.total_inactive_file, 3300);
        assert_eq!(zi.total_active_file, 4400);
    }

    #[test]
    fn test_zone_fields_and_protection() {
        let zi = ZoneInfo::parse(SAMPLE).unwrap();
        let dma = &zi.nodes[0].zones[0];
        assert_eq!(dma.min, 68);
        assert_eq!(dma.low, 85);
        assert_eq!(dma.high, 102);
        assert_eq!(dma.present, 3997);
        assert_eq!(dma.max_protection, 7676);

        let dma32 = &zi.nodes[0].zones[1];
        assert_eq!(dma32.nr_free_cma, 100);
        assert_eq!(dma32.max_protection, 4685);
    }

    #[test]
    fn test_unpopulated_zone_skipped() {
        let zi = ZoneInfo::parse(SAMPLE).unwrap();
        assert_eq!(zi.populated_zones().count(), 2);
    }

    #[test]
    fn test_totalreserve() {
        let zi = ZoneInfo::parse(SAMPLE).unwrap();
        // Unpopulated zones still contribute 0, populated ones
        // high + max_protection.
        assert_eq!(zi.totalreserve_pages, (102 + 7676) + (1800 + 4685));
    }

    #[test]
    fn test_empty_input_fails() {
        assert!(ZoneInfo::parse("").is_err());
    }
}
