//! RADIX payload (record version 3): the node arena then the leaf arena,
//! as raw records in the writer's byte order. The header is padded to 8
//! bytes so an uncompressed file can be mapped and used in place.

use std::fs::File;
use std::io::{Read, Write};
use std::mem::{align_of, size_of};
use std::ops::ControlFlow;
use std::sync::Arc;

use bytemuck::Zeroable;
use log::{debug, info};

use super::{visit, Input, Output};
use crate::arena::{Arena, ArenaRecord};
use crate::constants::{NUM_CHILDREN, RADIX_HEADER_ALIGN, ROOT_IS_LEAF_FLAG};
use crate::errors::{Error, Result};
use crate::header::{FileHeader, HeaderEntry, IpSetEntry};
use crate::iobuf::PayloadWriter;
use crate::ipset::{IpSet, Repr};
use crate::platform::MappedRegion;
use crate::radix::{Entry, Family, LeafRecord, NodeRecord, RadixTree, RadixV4, V4, V6};
use crate::types::{CompMethod, RecordVersion};

fn entry_of<T: Family>(tree: &RadixTree<T>) -> IpSetEntry {
    IpSetEntry {
        children_per_node: NUM_CHILDREN as u32,
        leaf_count: tree.leaves.count() as u32,
        leaf_size: size_of::<T::Leaf>() as u32,
        node_count: tree.nodes.count() as u32,
        node_size: size_of::<T::Node>() as u32,
        root_index: match tree.root {
            None => 0,
            Some(Entry::Node(n)) => n,
            Some(Entry::Leaf(l)) => l | ROOT_IS_LEAF_FLAG,
        },
    }
}

fn write_tree<T: Family, W: Write>(tree: &RadixTree<T>, mut header: FileHeader, w: &mut W) -> Result<()> {
    header.entries.push(HeaderEntry::IpSet(entry_of(tree)));
    header.write(w, RADIX_HEADER_ALIGN)?;
    let mut out = Output::new(PayloadWriter::new(&mut *w, header.comp_method));
    out.bytes(tree.nodes.as_bytes())?;
    out.bytes(tree.leaves.as_bytes())?;
    out.finish()
}

pub(super) fn write<W: Write>(set: &IpSet, header: FileHeader, w: &mut W) -> Result<()> {
    match &set.repr {
        Repr::V4(t) => write_tree(t, header, w),
        Repr::V6(t) => write_tree(t, header, w),
        Repr::Bitmap(b) => {
            let mut t = RadixV4::from_blocks(b.blocks().map(|(ip, p)| (ip as u128, p)))?;
            t.clean()?;
            write_tree(&t, header, w)
        }
    }
}

fn check_entry<T: Family>(e: &IpSetEntry) -> Result<()> {
    if e.children_per_node as usize != NUM_CHILDREN
        || e.node_size as usize != size_of::<T::Node>()
        || e.leaf_size as usize != size_of::<T::Leaf>()
    {
        return Err(Error::FileHeader(format!(
            "RADIX entry {} children, node size {}, leaf size {} is not supported",
            e.children_per_node, e.node_size, e.leaf_size
        )));
    }
    Ok(())
}

fn root_of(e: &IpSetEntry) -> Option<Entry> {
    if e.leaf_count <= 1 {
        None
    } else if e.root_index & ROOT_IS_LEAF_FLAG != 0 {
        Some(Entry::Leaf(e.root_index & !ROOT_IS_LEAF_FLAG))
    } else {
        Some(Entry::Node(e.root_index))
    }
}

fn sentinel_is_zero<R: ArenaRecord>(arena: &Arena<R>) -> bool {
    arena.count() == 0 || bytemuck::bytes_of(arena.get(0)).iter().all(|&b| b == 0)
}

/// Check a tree built from file records. Returns it with a flag telling
/// whether it already has the clean layout.
fn finish_tree<T: Family>(
    nodes: Arena<T::Node>,
    leaves: Arena<T::Leaf>,
    e: &IpSetEntry,
) -> Result<(RadixTree<T>, bool)> {
    if !sentinel_is_zero(&nodes) || !sentinel_is_zero(&leaves) {
        return Err(Error::Corrupt("RADIX record 0 is not zero".into()));
    }
    let tree = RadixTree {
        nodes,
        leaves,
        root: root_of(e),
    };
    tree.verify()?;
    let clean = tree.root.is_none()
        || (tree.leaves_ascending()
            && tree.nodes_compact()
            && tree.blocks().count() + 1 == tree.leaves.count());
    debug!(
        "[RADIX] {} nodes, {} leaves, clean layout {}",
        tree.nodes.count(),
        tree.leaves.count(),
        clean
    );
    Ok((tree, clean))
}

fn read_records<T: ArenaRecord, R: Read>(input: &mut Input<R>, count: usize) -> Result<Vec<T>> {
    let len = count
        .checked_mul(size_of::<T>())
        .ok_or_else(|| Error::Corrupt(format!("{} count {} is too large", T::KIND, count)))?;
    let mut bytes = Vec::new();
    if input.take_to_end(len as u64, &mut bytes)? != len {
        return Err(Error::Corrupt("unexpected end of IPset payload".into()));
    }
    let mut records = Vec::new();
    records
        .try_reserve_exact(count)
        .map_err(|_| Error::Alloc(T::KIND))?;
    records.resize(count, T::zeroed());
    bytemuck::cast_slice_mut::<T, u8>(&mut records).copy_from_slice(&bytes);
    Ok(records)
}

fn read_tree<T: Family, R: Read>(input: &mut Input<R>, e: &IpSetEntry) -> Result<(RadixTree<T>, bool)> {
    check_entry::<T>(e)?;
    let mut nodes: Vec<T::Node> = read_records(input, e.node_count as usize)?;
    let mut leaves: Vec<T::Leaf> = read_records(input, e.leaf_count as usize)?;
    if !input.is_native() {
        nodes.iter_mut().for_each(NodeRecord::swap_bytes);
        leaves.iter_mut().for_each(LeafRecord::swap_bytes);
    }
    finish_tree(Arena::from_records(nodes), Arena::from_records(leaves), e)
}

pub(super) fn read<R: Read>(input: &mut Input<R>, e: &IpSetEntry, v6: bool) -> Result<IpSet> {
    if v6 {
        let (t, clean) = read_tree::<V6, R>(input, e)?;
        Ok(IpSet::from_repr(Repr::V6(t), !clean))
    } else {
        let (t, clean) = read_tree::<V4, R>(input, e)?;
        Ok(IpSet::from_repr(Repr::V4(t), !clean))
    }
}

fn map_tree<T: Family>(region: Arc<MappedRegion>, offset: usize, e: &IpSetEntry) -> Result<(RadixTree<T>, bool)> {
    check_entry::<T>(e)?;
    let leaf_offset = (e.node_count as usize)
        .checked_mul(size_of::<T::Node>())
        .and_then(|n| n.checked_add(offset))
        .ok_or_else(|| Error::Corrupt("RADIX node region is too large".into()))?;
    let nodes = Arena::from_mapped(region.clone(), offset, e.node_count as usize)?;
    let leaves = Arena::from_mapped(region, leaf_offset, e.leaf_count as usize)?;
    finish_tree(nodes, leaves, e)
}

/// Map an uncompressed host-order RADIX file instead of reading it.
/// `None` when the file does not qualify or cannot be mapped.
pub(super) fn try_map(file: &File, header: &FileHeader) -> Result<Option<IpSet>> {
    if header.record_version != RecordVersion::Radix
        || header.comp_method != CompMethod::None
        || !header.is_native_order()
        || header.length % align_of::<u64>() != 0
    {
        return Ok(None);
    }
    let Some(e) = header.ipset_entry().copied() else {
        return Ok(None);
    };
    if e.node_count == 0 && e.leaf_count == 0 {
        return Ok(None);
    }
    let v6 = super::file_is_v6(header)?;
    let Ok(len) = usize::try_from(file.metadata()?.len()) else {
        return Ok(None);
    };
    let region = match MappedRegion::map(file, len) {
        Ok(r) => Arc::new(r),
        Err(err) => {
            debug!("[MMAP] mapping failed, reading instead: {}", err);
            return Ok(None);
        }
    };
    info!("[MMAP] mapped {} bytes, payload at {}", len, header.length);
    let set = if v6 {
        let (t, clean) = map_tree::<V6>(region, header.length, &e)?;
        IpSet::from_repr(Repr::V6(t), !clean)
    } else {
        let (t, clean) = map_tree::<V4>(region, header.length, &e)?;
        IpSet::from_repr(Repr::V4(t), !clean)
    };
    Ok(Some(set))
}

fn decode_leaves<T, R, B, F>(input: &mut Input<R>, e: &IpSetEntry, f: &mut F) -> Result<ControlFlow<B>>
where
    T: Family,
    R: Read,
    F: FnMut(u128, u32) -> ControlFlow<B>,
{
    check_entry::<T>(e)?;
    input.skip(u64::from(e.node_count) * u64::from(e.node_size))?;
    let mut leaf = T::Leaf::zeroed();
    for i in 0..e.leaf_count {
        input.fill(bytemuck::bytes_of_mut(&mut leaf))?;
        if i == 0 {
            continue;
        }
        if !input.is_native() {
            leaf.swap_bytes();
        }
        let prefix = leaf.prefix();
        if prefix == 0 || prefix > T::MAX_BITS {
            return Err(Error::Corrupt(format!("RADIX leaf {} has prefix {}", i, prefix)));
        }
        visit!(f(leaf.ip(), prefix));
    }
    Ok(ControlFlow::Continue(()))
}

/// Leaves in storage order. Ascending for files written from clean sets.
pub(super) fn decode<R, B, F>(input: &mut Input<R>, e: &IpSetEntry, v6: bool, f: &mut F) -> Result<ControlFlow<B>>
where
    R: Read,
    F: FnMut(u128, u32) -> ControlFlow<B>,
{
    if v6 {
        decode_leaves::<V6, R, B, F>(input, e, f)
    } else {
        decode_leaves::<V4, R, B, F>(input, e, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arenas<T: Family>(tree: &RadixTree<T>) -> (Arena<T::Node>, Arena<T::Leaf>) {
        (
            Arena::from_records(tree.nodes.as_slice().to_vec()),
            Arena::from_records(tree.leaves.as_slice().to_vec()),
        )
    }

    #[test]
    fn unreachable_nodes_mark_image_dirty() {
        let mut t = RadixV4::new();
        t.insert(10 << 24, 8).unwrap();
        t.insert(12 << 24, 8).unwrap();
        t.clean().unwrap();
        let mut e = entry_of(&t);

        let (nodes, leaves) = arenas(&t);
        let (_, clean) = finish_tree::<V4>(nodes, leaves, &e).unwrap();
        assert!(clean);

        // an extra zeroed node that nothing points at
        let mut nodes = t.nodes.as_slice().to_vec();
        nodes.push(<V4 as Family>::Node::zeroed());
        e.node_count += 1;
        let leaves = t.leaves.as_slice().to_vec();
        let (loaded, clean) =
            finish_tree::<V4>(Arena::from_records(nodes), Arena::from_records(leaves), &e).unwrap();
        assert!(!clean);
        assert_eq!(loaded.blocks().count(), 2);
    }
}
