//! Constant-use enumeration.
//!
//! A global value is referenced through constant trees hanging off three
//! kinds of users: variable initializers, aliasees and instruction operands.
//! Each use records the child path from the root constant to the leaf, whether
//! every step on that path forwards the pointer bits unchanged, and the byte
//! offset of the leaf inside the root (meaningful for initializers).

use std::collections::BTreeMap;

use super::{Constant, GlobalKind, Module, Operand, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UserRef {
    Initializer(ValueId),
    Aliasee(ValueId),
    Operand {
        function: ValueId,
        block: usize,
        inst: usize,
        operand: usize,
    },
}

impl UserRef {
    /// Global value owning the use site.
    #[must_use]
    pub fn owner(self) -> ValueId {
        match self {
            UserRef::Initializer(id) | UserRef::Aliasee(id) => id,
            UserRef::Operand { function, .. } => function,
        }
    }

    #[must_use]
    pub fn is_instruction(self) -> bool {
        matches!(self, UserRef::Operand { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantUse {
    pub target: ValueId,
    pub user: UserRef,
    pub path: Vec<usize>,
    pub samebits: bool,
    pub offset: u64,
}

struct Frame<'a> {
    node: &'a Constant,
    path: Vec<usize>,
    samebits: bool,
    offset: u64,
}

/// Visit every `Global` leaf below `root` in left-to-right order.
pub fn walk_constant(root: &Constant, mut visit: impl FnMut(ValueId, &[usize], bool, u64)) {
    let mut stack = vec![Frame {
        node: root,
        path: Vec::new(),
        samebits: true,
        offset: 0,
    }];
    while let Some(frame) = stack.pop() {
        match frame.node {
            Constant::Global(id) => visit(*id, &frame.path, frame.samebits, frame.offset),
            Constant::Expr { op, operands, .. } => {
                for (index, child) in operands.iter().enumerate().rev() {
                    let mut path = frame.path.clone();
                    path.push(index);
                    stack.push(Frame {
                        node: child,
                        path,
                        samebits: frame.samebits && op.preserves_bits() && index == 0,
                        offset: frame.offset,
                    });
                }
            }
            Constant::Aggregate { ty, elements, .. } => {
                for (index, child) in elements.iter().enumerate().rev() {
                    let mut path = frame.path.clone();
                    path.push(index);
                    stack.push(Frame {
                        node: child,
                        path,
                        samebits: frame.samebits,
                        offset: frame.offset + ty.element_offset(index).unwrap_or(0),
                    });
                }
            }
            _ => {}
        }
    }
}

/// Uses of every referenced global, grouped by target.
#[derive(Debug, Default)]
pub struct UseIndex {
    uses: BTreeMap<ValueId, Vec<ConstantUse>>,
}

impl UseIndex {
    #[must_use]
    pub fn build(module: &Module) -> Self {
        let mut uses: BTreeMap<ValueId, Vec<ConstantUse>> = BTreeMap::new();
        let mut record = |user: UserRef, root: &Constant| {
            walk_constant(root, |target, path, samebits, offset| {
                uses.entry(target).or_default().push(ConstantUse {
                    target,
                    user,
                    path: path.to_vec(),
                    samebits,
                    offset,
                });
            });
        };
        for (id, value) in module.iter() {
            match &value.kind {
                GlobalKind::Variable(variable) => {
                    if let Some(init) = &variable.initializer {
                        record(UserRef::Initializer(id), init);
                    }
                }
                GlobalKind::Alias(alias) => record(UserRef::Aliasee(id), &alias.aliasee),
                GlobalKind::Function(function) => {
                    for (block_index, block) in function.blocks.iter().enumerate() {
                        for (inst_index, inst) in block.insts.iter().enumerate() {
                            for (operand_index, operand) in inst.operands.iter().enumerate() {
                                if let Operand::Const(constant) = operand {
                                    record(
                                        UserRef::Operand {
                                            function: id,
                                            block: block_index,
                                            inst: inst_index,
                                            operand: operand_index,
                                        },
                                        constant,
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
        Self { uses }
    }

    #[must_use]
    pub fn uses_of(&self, target: ValueId) -> &[ConstantUse] {
        self.uses.get(&target).map_or(&[], Vec::as_slice)
    }

    /// Uses from initializers and aliasees only.
    pub fn global_uses(&self, target: ValueId) -> impl Iterator<Item = &ConstantUse> {
        self.uses_of(target)
            .iter()
            .filter(|use_| !use_.user.is_instruction())
    }

    pub fn instruction_uses(&self, target: ValueId) -> impl Iterator<Item = &ConstantUse> {
        self.uses_of(target)
            .iter()
            .filter(|use_| use_.user.is_instruction())
    }

    /// Distinct functions whose instructions reference `target`.
    #[must_use]
    pub fn instruction_users(&self, target: ValueId) -> Vec<ValueId> {
        let mut users: Vec<ValueId> = self
            .instruction_uses(target)
            .map(|use_| use_.user.owner())
            .collect();
        users.dedup();
        users
    }

    pub fn targets(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.uses.keys().copied()
    }
}
