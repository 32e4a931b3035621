//! Block delta-map: which pages of which relations the WAL window touched.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::pg::RelFileNode;

use super::parser::{WalRecord, MAIN_FORK};

/// Grow-only mapping `relation → sorted block set`, valid for one LSN
/// window. Merging is per-key set union, so out-of-order merges are safe.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeltaMap {
    relations: BTreeMap<RelFileNode, BTreeSet<u32>>,
    incomplete: bool,
}

/// Flat serialized form of one relation's entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaMapEntry {
    pub relation: RelFileNode,
    pub blocks: Vec<u32>,
}

/// Stored form of a whole map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaMapDto {
    pub incomplete: bool,
    pub relations: Vec<DeltaMapEntry>,
}

impl DeltaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, relation: RelFileNode, block_no: u32) {
        self.relations.entry(relation).or_default().insert(block_no);
    }

    /// Fold one parsed record in. A CRC-flagged record poisons the map:
    /// we no longer know every touched block, so consumers must fall back
    /// to full scans.
    pub fn absorb_record(&mut self, record: &WalRecord) {
        if !record.crc_ok {
            self.incomplete = true;
            return;
        }
        for block in &record.blocks {
            if block.fork == MAIN_FORK {
                self.add(block.node, block.block_no);
            }
        }
    }

    pub fn merge(&mut self, other: DeltaMap) {
        self.incomplete |= other.incomplete;
        for (relation, blocks) in other.relations {
            self.relations.entry(relation).or_default().extend(blocks);
        }
    }

    pub fn blocks_for(&self, relation: &RelFileNode) -> Option<&BTreeSet<u32>> {
        self.relations.get(relation)
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    pub fn block_count(&self) -> usize {
        self.relations.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }

    /// An incomplete map must not be used to narrow page scans.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn to_dto(&self) -> DeltaMapDto {
        DeltaMapDto {
            incomplete: self.incomplete,
            relations: self
                .relations
                .iter()
                .map(|(relation, blocks)| DeltaMapEntry {
                    relation: *relation,
                    blocks: blocks.iter().copied().collect(),
                })
                .collect(),
        }
    }

    pub fn from_dto(dto: DeltaMapDto) -> Self {
        let mut map = Self {
            incomplete: dto.incomplete,
            ..Self::default()
        };
        for entry in dto.relations {
            for block in entry.blocks {
                map.add(entry.relation, block);
            }
        }
        map
    }
}
