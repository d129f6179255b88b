//! Replica placement.
//!
//! Load is the total size of the files a node holds according to the
//! network view. Only candidate nodes are counted. Ties go to this node,
//! then to the lowest address.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use peerfs_core::FileDescriptor;

use crate::error::PlacementError;

/// Bytes held per candidate. Every candidate appears, even with no files.
pub fn node_loads<'a>(
    descriptors: impl IntoIterator<Item = &'a FileDescriptor>,
    candidates: impl IntoIterator<Item = Ipv4Addr>,
) -> BTreeMap<Ipv4Addr, u64> {
    let mut loads: BTreeMap<Ipv4Addr, u64> = candidates.into_iter().map(|a| (a, 0)).collect();
    for d in descriptors {
        if let Some(load) = loads.get_mut(&d.holder) {
            *load += d.size;
        }
    }
    loads
}

fn pick(loads: &BTreeMap<Ipv4Addr, u64>, prefer: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
    let min = *loads.values().min()?;
    if let Some(preferred) = prefer {
        if loads.get(&preferred) == Some(&min) {
            return Some(preferred);
        }
    }
    loads
        .iter()
        .find(|(_, load)| **load == min)
        .map(|(addr, _)| *addr)
}

/// Initial holder for an upload: peers plus this node.
pub fn least_loaded(
    me: Ipv4Addr,
    peers: &BTreeSet<Ipv4Addr>,
    descriptors: &[FileDescriptor],
) -> Ipv4Addr {
    let loads = node_loads(descriptors, peers.iter().copied().chain([me]));
    pick(&loads, Some(me)).unwrap_or(me)
}

/// Least-loaded node other than this one.
pub fn other_least_loaded(
    me: Ipv4Addr,
    peers: &BTreeSet<Ipv4Addr>,
    descriptors: &[FileDescriptor],
) -> Result<Ipv4Addr, PlacementError> {
    let loads = node_loads(descriptors, peers.iter().copied().filter(|a| *a != me));
    pick(&loads, None).ok_or(PlacementError::NoOtherNode)
}

/// Target for each of `files` when this node departs. Each assignment adds
/// to the target's load before the next file is placed.
pub fn plan_migration(
    me: Ipv4Addr,
    peers: &BTreeSet<Ipv4Addr>,
    descriptors: &[FileDescriptor],
    files: &[FileDescriptor],
) -> Result<Vec<(FileDescriptor, Ipv4Addr)>, PlacementError> {
    let mut loads = node_loads(descriptors, peers.iter().copied().filter(|a| *a != me));
    files
        .iter()
        .map(|file| {
            let target = pick(&loads, None).ok_or(PlacementError::NoOtherNode)?;
            if let Some(load) = loads.get_mut(&target) {
                *load += file.size;
            }
            Ok((file.clone(), target))
        })
        .collect()
}
