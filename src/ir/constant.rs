//! Constant trees: initializers, aliasees and constant operands.

use serde::{Deserialize, Serialize};

use super::{Type, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstOp {
    BitCast,
    PtrToInt,
    IntToPtr,
    Add,
    Sub,
    Trunc,
    GetElementPtr,
}

impl ConstOp {
    /// Whether the operation forwards its first operand's bits unchanged.
    #[must_use]
    pub fn preserves_bits(self) -> bool {
        matches!(
            self,
            ConstOp::BitCast | ConstOp::PtrToInt | ConstOp::IntToPtr
        )
    }

    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            ConstOp::BitCast => "bitcast",
            ConstOp::PtrToInt => "ptrtoint",
            ConstOp::IntToPtr => "inttoptr",
            ConstOp::Add => "add",
            ConstOp::Sub => "sub",
            ConstOp::Trunc => "trunc",
            ConstOp::GetElementPtr => "getelementptr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregateKind {
    Array,
    Struct,
    Vector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Constant {
    Null(Type),
    Undef(Type),
    Int { ty: Type, value: i64 },
    Float { ty: Type, bits: u64 },
    Bytes(Vec<u8>),
    /// Address of a global value.
    Global(ValueId),
    Expr {
        op: ConstOp,
        ty: Type,
        operands: Vec<Constant>,
    },
    Aggregate {
        kind: AggregateKind,
        ty: Type,
        elements: Vec<Constant>,
    },
}

impl Constant {
    #[must_use]
    pub fn null_ptr() -> Self {
        Constant::Null(Type::Ptr)
    }

    #[must_use]
    pub fn i32(value: i64) -> Self {
        Constant::Int {
            ty: Type::i32(),
            value,
        }
    }

    #[must_use]
    pub fn i64(value: i64) -> Self {
        Constant::Int {
            ty: Type::i64(),
            value,
        }
    }

    #[must_use]
    pub fn global(id: ValueId) -> Self {
        Constant::Global(id)
    }

    #[must_use]
    pub fn ptr_to_int(value: Constant) -> Self {
        Constant::Expr {
            op: ConstOp::PtrToInt,
            ty: Type::i64(),
            operands: vec![value],
        }
    }

    /// `trunc i32 (ptr - base)`: a position-independent 32-bit offset.
    #[must_use]
    pub fn ptrdiff32(ptr: Constant, base: Constant) -> Self {
        let ptr = if matches!(ptr.ty(), Type::Ptr) {
            Constant::ptr_to_int(ptr)
        } else {
            ptr
        };
        let diff = Constant::Expr {
            op: ConstOp::Sub,
            ty: Type::i64(),
            operands: vec![ptr, base],
        };
        Constant::Expr {
            op: ConstOp::Trunc,
            ty: Type::i32(),
            operands: vec![diff],
        }
    }

    /// Integer address of `global` displaced by `offset` bytes.
    #[must_use]
    pub fn address_plus(global: ValueId, offset: u64) -> Self {
        let base = Constant::ptr_to_int(Constant::Global(global));
        if offset == 0 {
            base
        } else {
            Constant::Expr {
                op: ConstOp::Add,
                ty: Type::i64(),
                operands: vec![base, Constant::i64(offset as i64)],
            }
        }
    }

    #[must_use]
    pub fn i32_array(values: Vec<Constant>) -> Self {
        Constant::Aggregate {
            kind: AggregateKind::Array,
            ty: Type::array(Type::i32(), values.len() as u64),
            elements: values,
        }
    }

    #[must_use]
    pub fn u32_array(values: &[u32]) -> Self {
        Constant::i32_array(
            values
                .iter()
                .map(|value| Constant::i32(i64::from(*value)))
                .collect(),
        )
    }

    #[must_use]
    pub fn ptr_array(values: Vec<Constant>) -> Self {
        Constant::Aggregate {
            kind: AggregateKind::Array,
            ty: Type::array(Type::Ptr, values.len() as u64),
            elements: values,
        }
    }

    #[must_use]
    pub fn ty(&self) -> Type {
        match self {
            Constant::Null(ty)
            | Constant::Undef(ty)
            | Constant::Int { ty, .. }
            | Constant::Float { ty, .. }
            | Constant::Expr { ty, .. }
            | Constant::Aggregate { ty, .. } => ty.clone(),
            Constant::Bytes(bytes) => Type::array(Type::i8(), bytes.len() as u64),
            Constant::Global(_) => Type::Ptr,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Constant::Null(_))
    }

    /// Direct children of this node.
    #[must_use]
    pub fn children(&self) -> &[Constant] {
        match self {
            Constant::Expr { operands, .. } => operands,
            Constant::Aggregate { elements, .. } => elements,
            _ => &[],
        }
    }

    pub fn children_mut(&mut self) -> &mut [Constant] {
        match self {
            Constant::Expr { operands, .. } => operands,
            Constant::Aggregate { elements, .. } => elements,
            _ => &mut [],
        }
    }

    /// Follow `path` (child indices from this node) to a descendant.
    #[must_use]
    pub fn at_path(&self, path: &[usize]) -> Option<&Constant> {
        let mut node = self;
        for index in path {
            node = node.children().get(*index)?;
        }
        Some(node)
    }

    pub fn at_path_mut(&mut self, path: &[usize]) -> Option<&mut Constant> {
        let mut node = self;
        for index in path {
            node = node.children_mut().get_mut(*index)?;
        }
        Some(node)
    }

    /// Every global value referenced anywhere in this tree, in visit order.
    #[must_use]
    pub fn referenced_globals(&self) -> Vec<ValueId> {
        let mut found = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let Constant::Global(id) = node {
                found.push(*id);
            }
            stack.extend(node.children().iter().rev());
        }
        found
    }

    /// Replace every `Global(from)` leaf with `Global(to)`.
    pub fn remap_globals(&mut self, map: &dyn Fn(ValueId) -> Option<ValueId>) {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let Constant::Global(id) = node {
                if let Some(mapped) = map(*id) {
                    *id = mapped;
                }
                continue;
            }
            stack.extend(node.children_mut().iter_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_address_nested_children() {
        let table = Constant::ptr_array(vec![
            Constant::null_ptr(),
            Constant::Expr {
                op: ConstOp::BitCast,
                ty: Type::Ptr,
                operands: vec![Constant::Global(ValueId(7))],
            },
        ]);
        assert_eq!(table.at_path(&[1, 0]), Some(&Constant::Global(ValueId(7))));
        assert_eq!(table.at_path(&[2]), None);
        assert_eq!(table.referenced_globals(), vec![ValueId(7)]);
    }

    #[test]
    fn remap_rewrites_only_mapped_leaves() {
        let mut value = Constant::ptr_array(vec![
            Constant::Global(ValueId(1)),
            Constant::Global(ValueId(2)),
        ]);
        value.remap_globals(&|id| (id == ValueId(2)).then_some(ValueId(9)));
        assert_eq!(value.referenced_globals(), vec![ValueId(1), ValueId(9)]);
    }

    #[test]
    fn ptrdiff_wraps_pointer_operands() {
        let diff = Constant::ptrdiff32(Constant::Global(ValueId(3)), Constant::i64(0));
        assert_eq!(diff.ty(), Type::i32());
        assert_eq!(
            diff.at_path(&[0, 0]).map(Constant::ty),
            Some(Type::i64()),
            "pointer operand is converted to an integer"
        );
    }
}
