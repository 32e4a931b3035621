//! Resource-manager dispatch table.
//!
//! Record bodies are owned by their resource manager; the parser only needs
//! to know each manager by id and whether its records describe data-block
//! changes worth folding into the delta map. Unknown ids are a hard error:
//! a WAL stream we cannot attribute is a stream we cannot trust.

use crate::{Error, Result};

use super::parser::BlockRef;

pub const RM_XLOG_ID: u8 = 0;
pub const RM_XACT_ID: u8 = 1;
pub const RM_SMGR_ID: u8 = 2;
pub const RM_CLOG_ID: u8 = 3;
pub const RM_DBASE_ID: u8 = 4;
pub const RM_TBLSPC_ID: u8 = 5;
pub const RM_MULTIXACT_ID: u8 = 6;
pub const RM_RELMAP_ID: u8 = 7;
pub const RM_STANDBY_ID: u8 = 8;
pub const RM_HEAP2_ID: u8 = 9;
pub const RM_HEAP_ID: u8 = 10;
pub const RM_BTREE_ID: u8 = 11;
pub const RM_HASH_ID: u8 = 12;
pub const RM_GIN_ID: u8 = 13;
pub const RM_GIST_ID: u8 = 14;
pub const RM_SEQ_ID: u8 = 15;
pub const RM_SPGIST_ID: u8 = 16;
pub const RM_BRIN_ID: u8 = 17;
pub const RM_COMMIT_TS_ID: u8 = 18;
pub const RM_REPL_ORIGIN_ID: u8 = 19;
pub const RM_GENERIC_ID: u8 = 20;
pub const RM_LOGICAL_MSG_ID: u8 = 21;

/// Decoder over the already-walked block references of one record.
pub type BlockDecoder = fn(&[BlockRef]) -> Vec<BlockRef>;

#[derive(Debug, Clone, Copy)]
pub struct RmgrDescriptor {
    pub id: u8,
    pub name: &'static str,
    pub decode_blocks: BlockDecoder,
}

fn retain_blocks(blocks: &[BlockRef]) -> Vec<BlockRef> {
    blocks.to_vec()
}

fn no_blocks(_blocks: &[BlockRef]) -> Vec<BlockRef> {
    Vec::new()
}

/// One entry per known resource manager, indexed by id.
pub static RESOURCE_MANAGERS: [RmgrDescriptor; 22] = [
    // XLOG records carry full-page images (hint-bit FPIs among them).
    RmgrDescriptor { id: RM_XLOG_ID, name: "XLOG", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_XACT_ID, name: "Transaction", decode_blocks: no_blocks },
    RmgrDescriptor { id: RM_SMGR_ID, name: "Storage", decode_blocks: no_blocks },
    RmgrDescriptor { id: RM_CLOG_ID, name: "CLOG", decode_blocks: no_blocks },
    RmgrDescriptor { id: RM_DBASE_ID, name: "Database", decode_blocks: no_blocks },
    RmgrDescriptor { id: RM_TBLSPC_ID, name: "Tablespace", decode_blocks: no_blocks },
    RmgrDescriptor { id: RM_MULTIXACT_ID, name: "MultiXact", decode_blocks: no_blocks },
    RmgrDescriptor { id: RM_RELMAP_ID, name: "RelMap", decode_blocks: no_blocks },
    RmgrDescriptor { id: RM_STANDBY_ID, name: "Standby", decode_blocks: no_blocks },
    RmgrDescriptor { id: RM_HEAP2_ID, name: "Heap2", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_HEAP_ID, name: "Heap", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_BTREE_ID, name: "Btree", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_HASH_ID, name: "Hash", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_GIN_ID, name: "Gin", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_GIST_ID, name: "Gist", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_SEQ_ID, name: "Sequence", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_SPGIST_ID, name: "SPGist", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_BRIN_ID, name: "BRIN", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_COMMIT_TS_ID, name: "CommitTs", decode_blocks: no_blocks },
    RmgrDescriptor { id: RM_REPL_ORIGIN_ID, name: "ReplicationOrigin", decode_blocks: no_blocks },
    RmgrDescriptor { id: RM_GENERIC_ID, name: "Generic", decode_blocks: retain_blocks },
    RmgrDescriptor { id: RM_LOGICAL_MSG_ID, name: "LogicalMessage", decode_blocks: no_blocks },
];

pub fn lookup(rmid: u8) -> Result<&'static RmgrDescriptor> {
    RESOURCE_MANAGERS
        .get(rmid as usize)
        .ok_or_else(|| Error::UnknownRm(rmid).into())
}
