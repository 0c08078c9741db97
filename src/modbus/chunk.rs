//! Grouping of registers into as few Modbus transactions as possible

use super::register::FunctionCode;
use std::collections::BTreeMap;

/// Address span requested by one register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub function: FunctionCode,
    pub address: u16,
    pub count: u16,
}

/// One Modbus request covering several registers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub function: FunctionCode,
    pub start: u16,
    pub count: u16,
    /// Indices into the span list this chunk serves, in address order
    pub members: Vec<usize>,
}

impl Chunk {
    fn end(&self) -> u32 {
        self.start as u32 + self.count as u32
    }
}

/// Plan requests for `spans`
///
/// Spans are grouped per function code and sorted by address. A chunk never
/// covers more than `max_regs` words (`max_bits` for bit tables), and a gap
/// wider than `max_hole` between consecutive spans starts a new chunk. With
/// `max_hole == None` half of the width limit is tolerated. A single span
/// wider than the limit gets a chunk of its own.
pub fn plan_chunks(
    spans: &[Span],
    max_regs: u16,
    max_bits: u16,
    max_hole: Option<u16>,
) -> Vec<Chunk> {
    let mut by_function: BTreeMap<FunctionCode, Vec<usize>> = BTreeMap::new();
    for (i, s) in spans.iter().enumerate() {
        by_function.entry(s.function).or_default().push(i);
    }

    let mut chunks = Vec::new();
    for (function, mut members) in by_function {
        members.sort_by_key(|&i| (spans[i].address, i));
        let width = if function.is_bit() { max_bits } else { max_regs }.max(1) as u32;
        let hole = max_hole.map(u32::from).unwrap_or(width / 2);

        let mut current: Option<Chunk> = None;
        for i in members {
            let s = spans[i];
            let start = s.address as u32;
            let end = start + s.count as u32;
            if let Some(c) = current.as_mut() {
                let gap = start.saturating_sub(c.end());
                let new_end = end.max(c.end());
                if gap <= hole && new_end - c.start as u32 <= width {
                    c.count = (new_end - c.start as u32) as u16;
                    c.members.push(i);
                    continue;
                }
            }
            if let Some(done) = current.take() {
                chunks.push(done);
            }
            current = Some(Chunk {
                function,
                start: s.address,
                count: s.count,
                members: vec![i],
            });
        }
        if let Some(done) = current {
            chunks.push(done);
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(address: u16, count: u16) -> Span {
        Span {
            function: FunctionCode::Input,
            address,
            count,
        }
    }

    #[test]
    fn test_adjacent_registers_share_a_chunk() {
        let spans = [span(0, 2), span(2, 2), span(4, 2)];
        let plan = plan_chunks(&spans, 40, 200, None);
        assert_eq!(plan.len(), 1);
        assert_eq!((plan[0].start, plan[0].count), (0, 6));
        assert_eq!(plan[0].members, vec![0, 1, 2]);
    }

    #[test]
    fn test_hole_splits() {
        let spans = [span(0, 2), span(30, 2)];
        assert_eq!(plan_chunks(&spans, 40, 200, None).len(), 2);
        assert_eq!(plan_chunks(&spans, 40, 200, Some(28)).len(), 1);
        let spans = [span(0, 1), span(2, 1)];
        assert_eq!(plan_chunks(&spans, 40, 200, Some(0)).len(), 2);
    }

    #[test]
    fn test_width_limit_splits() {
        let spans: Vec<Span> = (0..30).map(|i| span(i * 2, 2)).collect();
        let plan = plan_chunks(&spans, 40, 200, None);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|c| c.count <= 40));
    }

    #[test]
    fn test_groups_by_function_and_sorts() {
        let spans = [
            Span { function: FunctionCode::Holding, address: 5, count: 1 },
            span(9, 1),
            span(1, 1),
        ];
        let plan = plan_chunks(&spans, 40, 200, None);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].function, FunctionCode::Holding);
        assert_eq!(plan[1].members, vec![2, 1]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let spans = [span(7, 2), span(0, 1), span(100, 2), span(3, 1)];
        assert_eq!(
            plan_chunks(&spans, 40, 200, None),
            plan_chunks(&spans, 40, 200, None)
        );
    }
}
