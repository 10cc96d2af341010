//! Block sequencing.
//!
//! Chooses the traversal order the allocator and resolver walk blocks in,
//! marks critical edges, and records which predecessor seeds each block's
//! incoming register map.

use alloc::{vec, vec::Vec};

use lsra_ir::BlockId;

use crate::LinearScan;

/// Per-block allocation metadata, indexed by `BlockId`.
#[derive(Clone, Debug)]
pub struct BlockAllocInfo {
    /// Position in the block sequence; `u32::MAX` until sequenced.
    pub seq_num: u32,
    /// Sequenced predecessor whose outgoing map seeds this block's
    /// incoming map.
    pub pred_for_seed: Option<BlockId>,
    pub has_critical_in: bool,
    pub has_critical_out: bool,
    pub has_eh_in: bool,
    pub has_eh_out: bool,
    pub has_eh_pred: bool,
}

impl BlockAllocInfo {
    pub fn new() -> Self {
        Self {
            seq_num: u32::MAX,
            pred_for_seed: None,
            has_critical_in: false,
            has_critical_out: false,
            has_eh_in: false,
            has_eh_out: false,
            has_eh_pred: false,
        }
    }
}

impl Default for BlockAllocInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> LinearScan<'a> {
    /// Build `block_seq`, `block_info`, and the predecessor lists.
    pub(crate) fn build_block_sequence(&mut self) {
        let block_count = self.proc.block_count();
        self.preds = self.proc.predecessors();
        self.block_info = vec![BlockAllocInfo::new(); block_count];

        // Mark critical edges and EH boundaries up front.
        for bi in 0..block_count {
            let id = BlockId(bi as u32);
            let succs = self.proc.block(id).successors();
            for succ in &succs {
                if succs.len() > 1 && self.preds[succ.index()].len() > 1 {
                    self.block_info[id.index()].has_critical_out = true;
                    self.block_info[succ.index()].has_critical_in = true;
                }
                if self.proc.block(*succ).eh_entry {
                    self.block_info[id.index()].has_eh_out = true;
                    self.block_info[succ.index()].has_eh_in = true;
                }
                if self.proc.block(id).eh_entry {
                    self.block_info[succ.index()].has_eh_pred = true;
                }
            }
        }

        let mut visited = vec![false; block_count];
        let mut worklist: Vec<BlockId> = Vec::new();
        self.block_seq = Vec::with_capacity(block_count);

        let entry = self.proc.entry_block();
        visited[entry.index()] = true;
        self.sequence_block(entry);
        self.enqueue_successors(entry, &mut visited, &mut worklist);

        while let Some(&next) = worklist.first() {
            worklist.remove(0);
            self.sequence_block(next);
            self.enqueue_successors(next, &mut visited, &mut worklist);
        }

        // Anything unreached (EH-only or unreachable) goes last, in layout
        // order.
        for bi in 0..block_count {
            let id = BlockId(bi as u32);
            if !visited[bi] {
                visited[bi] = true;
                self.sequence_block(id);
            }
        }

        // Pick the map-seeding predecessor: the heaviest already-sequenced
        // predecessor, lowest block number on ties.
        for &id in &self.block_seq.clone() {
            let my_seq = self.block_info[id.index()].seq_num;
            let mut best: Option<BlockId> = None;
            for &p in &self.preds[id.index()] {
                if self.block_info[p.index()].seq_num >= my_seq {
                    continue;
                }
                best = match best {
                    None => Some(p),
                    Some(b) => {
                        let (bw, pw) =
                            (self.proc.block(b).weight, self.proc.block(p).weight);
                        if pw > bw || (pw == bw && p.0 < b.0) {
                            Some(p)
                        } else {
                            Some(b)
                        }
                    }
                };
            }
            self.block_info[id.index()].pred_for_seed = best;
        }

        log::trace!("block sequence: {:?}", self.block_seq);
    }

    fn sequence_block(&mut self, id: BlockId) {
        self.block_info[id.index()].seq_num = self.block_seq.len() as u32;
        self.block_seq.push(id);
    }

    fn enqueue_successors(
        &self,
        id: BlockId,
        visited: &mut [bool],
        worklist: &mut Vec<BlockId>,
    ) {
        for succ in self.proc.block(id).successors() {
            if visited[succ.index()] {
                continue;
            }
            visited[succ.index()] = true;
            let pos = worklist
                .iter()
                .position(|&other| self.higher_priority(succ, other))
                .unwrap_or(worklist.len());
            worklist.insert(pos, succ);
        }
    }

    /// Work-list priority: blocks whose placement is weight-driven (rarely
    /// run, or all predecessors already sequenced) compare by weight, then
    /// ascending block number; otherwise layout order wins.
    fn higher_priority(&self, b1: BlockId, b2: BlockId) -> bool {
        let weight_based = |b: BlockId| {
            self.proc.block(b).rarely_run
                || self.preds[b.index()]
                    .iter()
                    .all(|p| self.block_info[p.index()].seq_num != u32::MAX)
        };
        if weight_based(b1) || weight_based(b2) {
            let (w1, w2) = (self.proc.block(b1).weight, self.proc.block(b2).weight);
            if w1 != w2 {
                return w1 > w2;
            }
        }
        b1.0 < b2.0
    }
}

#[cfg(test)]
mod tests {
    use lsra_ir::parse_proc;

    use crate::{LinearScan, X64Target};

    fn sequence(text: &str) -> alloc::vec::Vec<u32> {
        let mut proc = parse_proc(text).unwrap();
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.block_seq.iter().map(|b| b.0).collect()
    }

    #[test]
    fn test_entry_first_every_block_once() {
        let seq = sequence(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    jmptrue v0, block1, block2
block1:
    goto block3
block2:
    goto block3
block3:
    ret
}"#,
        );
        assert_eq!(seq[0], 0);
        let mut sorted = seq.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, alloc::vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_cold_block_sequenced_late() {
        let seq = sequence(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    jmptrue v0, block1, block2
block1(cold):
    goto block3
block2(weight 10):
    goto block3
block3:
    ret
}"#,
        );
        let pos = |b: u32| seq.iter().position(|&x| x == b).unwrap();
        assert!(pos(2) < pos(1), "hot block should precede the cold one");
    }

    #[test]
    fn test_critical_edge_flags() {
        let mut proc = parse_proc(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    jmptrue v0, block1, block2
block1:
    v1 = lcl $a
    jmptrue v1, block2, block3
block2:
    ret
block3:
    ret
}"#,
        )
        .unwrap();
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        // block0 -> block2 and block1 -> block2 are critical: both sources
        // branch two ways and block2 has two predecessors.
        assert!(lsra.block_info[0].has_critical_out);
        assert!(lsra.block_info[1].has_critical_out);
        assert!(lsra.block_info[2].has_critical_in);
        assert!(!lsra.block_info[3].has_critical_in);
    }

    #[test]
    fn test_unreachable_block_appended() {
        let seq = sequence(
            r#"
proc %t() {
block0:
    ret
block1:
    ret
}"#,
        );
        assert_eq!(seq, alloc::vec![0, 1]);
    }

    #[test]
    fn test_pred_for_seed_prefers_heavy_pred() {
        let mut proc = parse_proc(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    jmptrue v0, block1, block2
block1(weight 9):
    goto block3
block2(weight 2):
    goto block3
block3:
    ret
}"#,
        )
        .unwrap();
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        assert_eq!(
            lsra.block_info[3].pred_for_seed,
            Some(lsra_ir::BlockId(1))
        );
    }

    #[test]
    fn test_eh_flags() {
        let mut proc = parse_proc(
            r#"
proc %t() {
block0:
    goto block1
block1(eh):
    ret
}"#,
        )
        .unwrap();
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        assert!(lsra.block_info[0].has_eh_out);
        assert!(lsra.block_info[1].has_eh_in);
    }
}
