use std::collections::HashMap;

use waypoint_types::{BbvEntry, BlockId, Pc};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: BlockId,
    pub pc: Pc,
    pub instructions: u64,
}

/// Basic blocks in first-seen order, with the hit delta of each since the
/// last slice boundary.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    blocks: Vec<BlockInfo>,
    by_pc: HashMap<Pc, usize>,
    deltas: Vec<u64>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `pc`, numbering it on first sight. The instruction count of
    /// the first sighting sticks.
    pub fn observe(&mut self, pc: Pc, instructions: u64) -> BlockId {
        if let Some(&index) = self.by_pc.get(&pc) {
            return self.blocks[index].id;
        }
        let index = self.blocks.len();
        let id = BlockId::from_index(index);
        self.blocks.push(BlockInfo {
            id,
            pc,
            instructions,
        });
        self.deltas.push(0);
        self.by_pc.insert(pc, index);
        id
    }

    pub fn record_hit(&mut self, id: BlockId) {
        if let Some(delta) = self.deltas.get_mut(id.get() as usize - 1) {
            *delta += 1;
        }
    }

    /// BBV row for the slice that just ended: non-zero deltas only, ascending
    /// block id, weighted by block size. Resets every delta.
    pub fn take_bbv_row(&mut self) -> Result<Vec<BbvEntry>, EngineError> {
        let mut row = Vec::new();
        for (block, delta) in self.blocks.iter().zip(self.deltas.iter_mut()) {
            if *delta > 0 {
                let weighted = delta
                    .checked_mul(block.instructions)
                    .ok_or(EngineError::Overflow {
                        counter: "block weight",
                        pc: block.pc,
                    })?;
                row.push(BbvEntry {
                    block: block.id,
                    weighted,
                });
            }
            *delta = 0;
        }
        Ok(row)
    }

    pub fn get(&self, pc: Pc) -> Option<&BlockInfo> {
        self.by_pc.get(&pc).map(|&index| &self.blocks[index])
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<BlockInfo> {
        self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_first_sighting() {
        let mut table = BlockTable::new();
        let a = table.observe(Pc::new(0x500), 4);
        let b = table.observe(Pc::new(0x400), 2);
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
        assert_eq!(table.observe(Pc::new(0x500), 9), a);
        assert_eq!(table.get(Pc::new(0x500)).map(|b| b.instructions), Some(4));
    }

    #[test]
    fn bbv_row_weights_and_resets() {
        let mut table = BlockTable::new();
        let a = table.observe(Pc::new(0x500), 4);
        let _idle = table.observe(Pc::new(0x600), 1);
        let c = table.observe(Pc::new(0x400), 3);
        table.record_hit(c);
        table.record_hit(a);
        table.record_hit(c);

        let row: Vec<(u64, u64)> = table
            .take_bbv_row()
            .expect("weights fit")
            .iter()
            .map(|entry| (entry.block.get(), entry.weighted))
            .collect();
        assert_eq!(row, vec![(1, 4), (3, 6)]);
        assert!(table.take_bbv_row().expect("weights fit").is_empty());
    }

    #[test]
    fn oversized_weights_are_errors() {
        let mut table = BlockTable::new();
        let huge = table.observe(Pc::new(0x400), u64::MAX);
        table.record_hit(huge);
        table.record_hit(huge);

        let err = table.take_bbv_row().expect_err("two hits of u64::MAX wrap");
        assert!(matches!(err, EngineError::Overflow { counter: "block weight", .. }));
    }
}
