//! Address Space Map - per-task region bookkeeping
//!
//! Based on Mach4 vm/vm_map.h/c
//!
//! Every task records which virtual ranges are mapped, as inclusive
//! `[low, high]` regions carrying protection and ownership flags. Regions
//! never overlap. They are kept in an AVL tree ordered by `low`, so point
//! lookups and overlap tests are logarithmic.
//!
//! The kernel range below `USER_MEM_START` and the physical access window
//! are present in every map as reserved regions, which makes them
//! impossible to allocate over from user space.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cmp::max;

use bitflags::bitflags;

use crate::config::{PAGE_SIZE, PHYS_WINDOW, USER_MEM_START};
use crate::error::{KernError, KernResult};
use crate::types::VirtAddr;

bitflags! {
    /// Region protection and ownership
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Accessible from user mode
        const USER = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Program text
        const EXEC = 1 << 2;
        /// Created by new_pages and freeable by remove_pages
        const REMOVABLE = 1 << 3;
        /// Kernel-owned; survives exec and is never removed
        const RESERVED = 1 << 4;
    }
}

/// One mapped range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRegion {
    pub low: VirtAddr,
    /// Inclusive upper bound
    pub high: VirtAddr,
    pub flags: MapFlags,
}

impl MapRegion {
    pub const fn new(low: VirtAddr, high: VirtAddr, flags: MapFlags) -> Self {
        Self { low, high, flags }
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.low <= addr && addr <= self.high
    }

    pub fn overlaps(&self, low: VirtAddr, high: VirtAddr) -> bool {
        low <= self.high && self.low <= high
    }

    /// Page base addresses covered by the region
    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> {
        let first = self.low / PAGE_SIZE;
        let last = self.high / PAGE_SIZE;
        (first..=last).map(|p| p * PAGE_SIZE)
    }
}

// ============================================================================
// AVL Tree
// ============================================================================

type Link = Option<Box<Node>>;

#[derive(Debug, Clone)]
struct Node {
    region: MapRegion,
    height: i32,
    left: Link,
    right: Link,
}

fn height(link: &Link) -> i32 {
    link.as_ref().map_or(0, |n| n.height)
}

impl Node {
    fn new(region: MapRegion) -> Box<Node> {
        Box::new(Node {
            region,
            height: 1,
            left: None,
            right: None,
        })
    }

    fn update(&mut self) {
        self.height = 1 + max(height(&self.left), height(&self.right));
    }

    fn balance_factor(&self) -> i32 {
        height(&self.left) - height(&self.right)
    }
}

fn rotate_right(mut n: Box<Node>) -> Box<Node> {
    let mut l = match n.left.take() {
        Some(l) => l,
        None => return n,
    };
    n.left = l.right.take();
    n.update();
    l.right = Some(n);
    l.update();
    l
}

fn rotate_left(mut n: Box<Node>) -> Box<Node> {
    let mut r = match n.right.take() {
        Some(r) => r,
        None => return n,
    };
    n.right = r.left.take();
    n.update();
    r.left = Some(n);
    r.update();
    r
}

fn rebalance(mut n: Box<Node>) -> Box<Node> {
    n.update();
    let bf = n.balance_factor();
    if bf > 1 {
        if n.left.as_ref().map_or(0, |l| l.balance_factor()) < 0 {
            n.left = n.left.take().map(rotate_left);
        }
        return rotate_right(n);
    }
    if bf < -1 {
        if n.right.as_ref().map_or(0, |r| r.balance_factor()) > 0 {
            n.right = n.right.take().map(rotate_right);
        }
        return rotate_left(n);
    }
    n
}

fn insert_node(link: Link, region: MapRegion) -> Box<Node> {
    match link {
        None => Node::new(region),
        Some(mut n) => {
            if region.low < n.region.low {
                n.left = Some(insert_node(n.left.take(), region));
            } else {
                n.right = Some(insert_node(n.right.take(), region));
            }
            rebalance(n)
        }
    }
}

fn take_min(mut n: Box<Node>) -> (Link, MapRegion) {
    match n.left.take() {
        None => (n.right.take(), n.region),
        Some(l) => {
            let (rest, min) = take_min(l);
            n.left = rest;
            (Some(rebalance(n)), min)
        }
    }
}

fn remove_node(link: Link, low: VirtAddr) -> (Link, Option<MapRegion>) {
    let mut n = match link {
        None => return (None, None),
        Some(n) => n,
    };
    if low < n.region.low {
        let (rest, removed) = remove_node(n.left.take(), low);
        n.left = rest;
        (Some(rebalance(n)), removed)
    } else if low > n.region.low {
        let (rest, removed) = remove_node(n.right.take(), low);
        n.right = rest;
        (Some(rebalance(n)), removed)
    } else {
        let removed = n.region;
        let rest = match (n.left.take(), n.right.take()) {
            (None, None) => None,
            (Some(l), None) => Some(l),
            (None, Some(r)) => Some(r),
            (Some(l), Some(r)) => {
                let (right_rest, min) = take_min(r);
                let mut m = Node::new(min);
                m.left = Some(l);
                m.right = right_rest;
                Some(rebalance(m))
            }
        };
        (rest, Some(removed))
    }
}

fn collect(link: &Link, out: &mut Vec<MapRegion>) {
    if let Some(n) = link {
        collect(&n.left, out);
        out.push(n.region);
        collect(&n.right, out);
    }
}

fn balanced(link: &Link) -> bool {
    match link {
        None => true,
        Some(n) => {
            n.balance_factor().abs() <= 1
                && n.height == 1 + max(height(&n.left), height(&n.right))
                && balanced(&n.left)
                && balanced(&n.right)
        }
    }
}

// ============================================================================
// Map List
// ============================================================================

/// A task's set of mapped regions
#[derive(Debug, Clone, Default)]
pub struct MapList {
    root: Link,
    len: usize,
}

impl MapList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map containing only the kernel range and the physical window
    pub fn with_reserved() -> Self {
        let mut maps = Self::new();
        maps.root = Some(insert_node(
            None,
            MapRegion::new(0, USER_MEM_START - 1, MapFlags::RESERVED),
        ));
        maps.root = Some(insert_node(
            maps.root.take(),
            MapRegion::new(PHYS_WINDOW, u32::MAX, MapFlags::RESERVED),
        ));
        maps.len = 2;
        maps
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add a region; fails if it is malformed or touches an existing one
    pub fn insert(&mut self, region: MapRegion) -> KernResult<()> {
        if region.low > region.high {
            return Err(KernError::InvalidArgument);
        }
        if self.overlaps(region.low, region.high) {
            return Err(KernError::Overlap);
        }
        self.root = Some(insert_node(self.root.take(), region));
        self.len += 1;
        Ok(())
    }

    /// Region containing `addr`
    pub fn find(&self, addr: VirtAddr) -> Option<&MapRegion> {
        let mut cur = self.root.as_ref();
        while let Some(n) = cur {
            if addr < n.region.low {
                cur = n.left.as_ref();
            } else if addr > n.region.high {
                cur = n.right.as_ref();
            } else {
                return Some(&n.region);
            }
        }
        None
    }

    /// Whether any region intersects `[low, high]`
    pub fn overlaps(&self, low: VirtAddr, high: VirtAddr) -> bool {
        let mut cur = self.root.as_ref();
        while let Some(n) = cur {
            if high < n.region.low {
                cur = n.left.as_ref();
            } else if low > n.region.high {
                cur = n.right.as_ref();
            } else {
                return true;
            }
        }
        false
    }

    /// Remove the region that starts exactly at `low`
    pub fn remove(&mut self, low: VirtAddr) -> Option<MapRegion> {
        let (root, removed) = remove_node(self.root.take(), low);
        self.root = root;
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Regions in address order
    pub fn regions(&self) -> Vec<MapRegion> {
        let mut out = Vec::with_capacity(self.len);
        collect(&self.root, &mut out);
        out
    }

    /// Check that `[addr, addr + len)` is fully covered by regions that all
    /// carry `required`
    pub fn check_range(&self, addr: VirtAddr, len: usize, required: MapFlags) -> KernResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = addr as u64 + len as u64 - 1;
        if end > u32::MAX as u64 {
            return Err(KernError::BadAddress(addr));
        }
        let end = end as u32;
        let mut cursor = addr;
        loop {
            let region = self.find(cursor).ok_or(KernError::BadAddress(cursor))?;
            if !region.flags.contains(required) || region.flags.contains(MapFlags::RESERVED) {
                return Err(KernError::BadAddress(cursor));
            }
            if region.high >= end {
                return Ok(());
            }
            cursor = region.high + 1;
        }
    }

    /// Drop every region except the reserved kernel ones
    pub fn clear_user(&mut self) {
        let keep: Vec<MapRegion> = self
            .regions()
            .into_iter()
            .filter(|r| r.flags.contains(MapFlags::RESERVED))
            .collect();
        self.root = None;
        self.len = 0;
        for r in keep {
            self.root = Some(insert_node(self.root.take(), r));
            self.len += 1;
        }
    }

    /// User regions only
    pub fn user_regions(&self) -> Vec<MapRegion> {
        self.regions()
            .into_iter()
            .filter(|r| !r.flags.contains(MapFlags::RESERVED))
            .collect()
    }

    pub fn height(&self) -> i32 {
        height(&self.root)
    }

    pub fn is_balanced(&self) -> bool {
        balanced(&self.root)
    }
}
