// Generic iterative walk over a btrfs B-tree.
//
// Depth-first with an explicit stack; every node is checksum-verified
// and cross-checked against the address and level the parent promised,
// which doubles as the cycle/corruption guard.

use log::warn;

use fsmorph_core::{BlockDevice, ConvertError};

use super::checksum;
use super::chunk_map::ChunkMap;
use super::structures::{
    leaf_item, leaf_item_data, node_key_ptr, DiskKey, NodeHeader, HEADER_SIZE, ITEM_SIZE,
    KEY_PTR_SIZE,
};
use super::superblock::BtrfsSuperblock;

/// Maximum frames the explicit DFS stack may hold.
const MAX_STACK: usize = 8192;
/// Maximum root level accepted before walking.
const MAX_LEVEL: u8 = 8;

/// Returned by the item callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    Continue,
    /// Terminate the walk; not an error.
    Stop,
}

struct Frame {
    logical: u64,
    level: u8,
}

/// Walk the tree rooted at `root_logical`/`root_level`, invoking
/// `callback` for every leaf item in key order.
pub fn walk(
    device: &dyn BlockDevice,
    chunks: &ChunkMap,
    sb: &BtrfsSuperblock,
    root_logical: u64,
    root_level: u8,
    callback: &mut dyn FnMut(&DiskKey, &[u8]) -> Result<WalkAction, ConvertError>,
) -> Result<(), ConvertError> {
    if root_level > MAX_LEVEL {
        return Err(ConvertError::corruption(format!(
            "tree root level {} exceeds limit {}",
            root_level, MAX_LEVEL
        )));
    }

    let nodesize = sb.nodesize as usize;
    let mut stack = vec![Frame {
        logical: root_logical,
        level: root_level,
    }];
    let mut node = vec![0u8; nodesize];

    while let Some(frame) = stack.pop() {
        let physical = chunks.resolve_checked(frame.logical)?;
        device.read_at(physical, &mut node)?;

        if !checksum::verify(
            sb.csum_type,
            NodeHeader::stored_csum(&node),
            NodeHeader::csum_payload(&node),
        ) {
            return Err(ConvertError::corruption(format!(
                "tree node checksum mismatch at logical {:#x}",
                frame.logical
            )));
        }

        let header = NodeHeader::parse(&node)?;
        if header.bytenr != frame.logical {
            return Err(ConvertError::corruption(format!(
                "tree node at logical {:#x} claims bytenr {:#x}",
                frame.logical, header.bytenr
            )));
        }
        if header.level != frame.level {
            return Err(ConvertError::corruption(format!(
                "tree node at logical {:#x} has level {} where {} was expected",
                frame.logical, header.level, frame.level
            )));
        }

        if header.level > 0 {
            let max_items = ((nodesize - HEADER_SIZE) / KEY_PTR_SIZE) as u32;
            if header.nritems > max_items {
                return Err(ConvertError::corruption(format!(
                    "internal node at {:#x} holds {} items (max {})",
                    frame.logical, header.nritems, max_items
                )));
            }
            if stack.len() + header.nritems as usize > MAX_STACK {
                return Err(ConvertError::corruption(format!(
                    "tree walk stack exceeded {} frames",
                    MAX_STACK
                )));
            }
            // Readahead every child before descending into the first.
            for i in 0..header.nritems {
                let (_, blockptr) = node_key_ptr(&node, i)?;
                if let Ok(phys) = chunks.resolve_checked(blockptr) {
                    device.readahead(phys, nodesize as u64);
                }
            }
            // Reverse push so the lowest-keyed child pops first.
            for i in (0..header.nritems).rev() {
                let (_, blockptr) = node_key_ptr(&node, i)?;
                stack.push(Frame {
                    logical: blockptr,
                    level: header.level - 1,
                });
            }
        } else {
            let max_items = ((nodesize - HEADER_SIZE) / ITEM_SIZE) as u32;
            if header.nritems > max_items {
                warn!(
                    "leaf at {:#x} claims {} items (max {}), truncating walk of this leaf",
                    frame.logical, header.nritems, max_items
                );
            }
            for i in 0..header.nritems.min(max_items) {
                let item = leaf_item(&node, i)?;
                let data = leaf_item_data(&node, &item)?;
                if callback(&item.key, data)? == WalkAction::Stop {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}
