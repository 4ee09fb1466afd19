//! Path compressors.

use crate::error::RoutingError;
use crate::topology::PathCompressor;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reload_wire::{OpaqueId, RoutableId};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Largest index of a two-byte compressed id
const MAX_COMPRESSED_INDEX: u32 = 0x7FFF;

/// Compressor that stores nothing; every opaque id is unknown
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPathCompressor;

impl PathCompressor for NoopPathCompressor {
    fn compress(&self, _list: &[RoutableId]) -> Result<OpaqueId, RoutingError> {
        Err(RoutingError::CompressionUnavailable)
    }

    fn decompress(&self, id: &OpaqueId) -> Result<Vec<RoutableId>, RoutingError> {
        Err(RoutingError::UnknownOpaqueId(id.clone()))
    }
}

/// In-memory compressor issuing two-byte compressed ids.
///
/// Identical lists share one id. Ids are never reclaimed, so at most
/// 32768 distinct lists can be stored.
#[derive(Debug, Default)]
pub struct MemoryPathCompressor {
    by_id: DashMap<OpaqueId, Vec<RoutableId>>,
    by_path: DashMap<Vec<RoutableId>, OpaqueId>,
    next_index: AtomicU32,
}

impl MemoryPathCompressor {
    /// Create an empty compressor
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored lists
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl PathCompressor for MemoryPathCompressor {
    fn compress(&self, list: &[RoutableId]) -> Result<OpaqueId, RoutingError> {
        if list.is_empty() {
            return Err(RoutingError::EmptyDestinationList);
        }
        match self.by_path.entry(list.to_vec()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                if index > MAX_COMPRESSED_INDEX {
                    return Err(RoutingError::CompressionUnavailable);
                }
                let id = OpaqueId::compressed(index as u16);
                self.by_id.insert(id.clone(), list.to_vec());
                debug!(id = %id, entries = list.len(), "compressed destination list");
                Ok(slot.insert(id).clone())
            }
        }
    }

    fn decompress(&self, id: &OpaqueId) -> Result<Vec<RoutableId>, RoutingError> {
        self.by_id
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RoutingError::UnknownOpaqueId(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reload_wire::NodeId;

    fn path(bytes: &[u8]) -> Vec<RoutableId> {
        bytes
            .iter()
            .map(|b| RoutableId::Node(NodeId::new(vec![*b; 16])))
            .collect()
    }

    #[test]
    fn test_noop_never_resolves() {
        let compressor = NoopPathCompressor;
        let id = OpaqueId::compressed(1);
        assert_eq!(
            compressor.decompress(&id),
            Err(RoutingError::UnknownOpaqueId(id))
        );
        assert!(compressor.compress(&path(&[1])).is_err());
    }

    #[test]
    fn test_memory_round_trip() {
        let compressor = MemoryPathCompressor::new();
        let id = compressor.compress(&path(&[1, 2, 3])).unwrap();
        assert!(id.is_compressed());
        assert_eq!(compressor.decompress(&id).unwrap(), path(&[1, 2, 3]));
    }

    #[test]
    fn test_identical_lists_share_id() {
        let compressor = MemoryPathCompressor::new();
        let a = compressor.compress(&path(&[1, 2])).unwrap();
        let b = compressor.compress(&path(&[1, 2])).unwrap();
        let c = compressor.compress(&path(&[2, 1])).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(compressor.len(), 2);
    }

    #[test]
    fn test_unknown_id() {
        let compressor = MemoryPathCompressor::new();
        assert!(matches!(
            compressor.decompress(&OpaqueId::compressed(7)),
            Err(RoutingError::UnknownOpaqueId(_))
        ));
        assert!(compressor.compress(&[]).is_err());
    }
}
