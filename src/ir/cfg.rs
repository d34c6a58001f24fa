//! Control-flow helpers over a function's blocks.

use super::Function;

/// Successor block indices of `block`, in terminator operand order.
#[must_use]
pub fn successors(function: &Function, block: usize) -> Vec<usize> {
    function
        .blocks
        .get(block)
        .and_then(|block| block.insts.last())
        .map(|terminator| terminator.successors().collect())
        .unwrap_or_default()
}

/// Blocks reachable from the entry block.
#[must_use]
pub fn reachable(function: &Function) -> Vec<bool> {
    let mut seen = vec![false; function.blocks.len()];
    if function.blocks.is_empty() {
        return seen;
    }
    let mut stack = vec![0usize];
    while let Some(block) = stack.pop() {
        if block >= seen.len() || seen[block] {
            continue;
        }
        seen[block] = true;
        stack.extend(successors(function, block));
    }
    seen
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// True when a back edge is reachable from the entry block.
#[must_use]
pub fn has_loop(function: &Function) -> bool {
    let count = function.blocks.len();
    if count == 0 {
        return false;
    }
    let mut marks = vec![Mark::Unvisited; count];
    // (block, successors, next successor to visit)
    let mut stack: Vec<(usize, Vec<usize>, usize)> = vec![(0, successors(function, 0), 0)];
    marks[0] = Mark::OnStack;
    while let Some((block, succs, cursor)) = stack.last_mut() {
        if let Some(&next) = succs.get(*cursor) {
            *cursor += 1;
            if next >= count {
                continue;
            }
            match marks[next] {
                Mark::OnStack => return true,
                Mark::Done => {}
                Mark::Unvisited => {
                    marks[next] = Mark::OnStack;
                    let next_succs = successors(function, next);
                    stack.push((next, next_succs, 0));
                }
            }
        } else {
            marks[*block] = Mark::Done;
            stack.pop();
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, FunctionType, Instruction, Opcode, Operand, Type};

    fn function_with_edges(edges: &[&[usize]]) -> Function {
        let mut function = Function::declaration(FunctionType::void());
        for (index, targets) in edges.iter().enumerate() {
            let terminator = if targets.is_empty() {
                Instruction::ret(None)
            } else {
                Instruction::new(
                    if targets.len() == 1 { Opcode::Br } else { Opcode::CondBr },
                    Type::Void,
                    targets.iter().map(|target| Operand::Block(*target)).collect(),
                )
            };
            function.blocks.push(Block {
                name: format!("bb{index}"),
                insts: vec![terminator],
            });
        }
        function
    }

    #[test]
    fn straight_line_has_no_loop() {
        let function = function_with_edges(&[&[1], &[2], &[]]);
        assert!(!has_loop(&function));
    }

    #[test]
    fn diamond_has_no_loop() {
        let function = function_with_edges(&[&[1, 2], &[3], &[3], &[]]);
        assert!(!has_loop(&function));
    }

    #[test]
    fn back_edge_is_a_loop() {
        let function = function_with_edges(&[&[1], &[2, 1], &[]]);
        assert!(has_loop(&function));
    }

    #[test]
    fn unreachable_cycle_is_ignored() {
        let function = function_with_edges(&[&[], &[2], &[1]]);
        assert!(!has_loop(&function));
        assert_eq!(reachable(&function), vec![true, false, false]);
    }
}
