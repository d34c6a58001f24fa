//! Folding constants into bytes plus symbolic fixups.
//!
//! Addresses are unknown until link time, so a folded scalar is either a
//! plain integer, an address with an addend, or the distance between two
//! addresses. Encoding an initializer writes integers in place and leaves a
//! [`Fixup`] for everything symbolic.

use super::{ConstOp, Constant, Type, ValueId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    Int(i64),
    Address {
        target: ValueId,
        addend: i64,
    },
    Difference {
        plus: ValueId,
        minus: ValueId,
        addend: i64,
    },
}

impl Scalar {
    /// Resolve against concrete addresses; `None` when a symbol is unknown.
    pub fn resolve(self, address_of: impl Fn(ValueId) -> Option<u64>) -> Option<i64> {
        match self {
            Scalar::Int(value) => Some(value),
            Scalar::Address { target, addend } => {
                Some((address_of(target)? as i64).wrapping_add(addend))
            }
            Scalar::Difference {
                plus,
                minus,
                addend,
            } => {
                let plus = address_of(plus)? as i64;
                let minus = address_of(minus)? as i64;
                Some(plus.wrapping_sub(minus).wrapping_add(addend))
            }
        }
    }

    fn offset(self, delta: i64) -> Scalar {
        match self {
            Scalar::Int(value) => Scalar::Int(value.wrapping_add(delta)),
            Scalar::Address { target, addend } => Scalar::Address {
                target,
                addend: addend.wrapping_add(delta),
            },
            Scalar::Difference {
                plus,
                minus,
                addend,
            } => Scalar::Difference {
                plus,
                minus,
                addend: addend.wrapping_add(delta),
            },
        }
    }
}

/// A symbolic value of `width` bytes at `offset` inside an encoded constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    pub offset: u64,
    pub width: u8,
    pub value: Scalar,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub fixups: Vec<Fixup>,
}

/// Keep the low `bits` of `value`.
#[must_use]
pub fn truncate(value: i64, bits: u32) -> i64 {
    if bits >= 64 {
        value
    } else {
        value & ((1i64 << bits) - 1)
    }
}

fn int_bits(ty: &Type) -> u32 {
    match ty {
        Type::Int(bits) => *bits,
        other => (other.size() * 8).min(64) as u32,
    }
}

/// Fold a scalar constant.
pub fn evaluate(constant: &Constant) -> Result<Scalar> {
    match constant {
        Constant::Null(_) | Constant::Undef(_) => Ok(Scalar::Int(0)),
        Constant::Int { ty, value } => Ok(Scalar::Int(truncate(*value, int_bits(ty)))),
        Constant::Float { bits, .. } => Ok(Scalar::Int(*bits as i64)),
        Constant::Global(id) => Ok(Scalar::Address {
            target: *id,
            addend: 0,
        }),
        Constant::Expr { op, ty, operands } => evaluate_expr(*op, ty, operands),
        Constant::Bytes(_) | Constant::Aggregate { .. } => Err(Error::invariant(
            "aggregate constant where a scalar was expected",
        )),
    }
}

fn operand(operands: &[Constant], index: usize, op: ConstOp) -> Result<Scalar> {
    let constant = operands.get(index).ok_or_else(|| {
        Error::invariant(format!("`{}` is missing operand {index}", op.mnemonic()))
    })?;
    evaluate(constant)
}

fn evaluate_expr(op: ConstOp, ty: &Type, operands: &[Constant]) -> Result<Scalar> {
    match op {
        ConstOp::BitCast | ConstOp::PtrToInt | ConstOp::IntToPtr => operand(operands, 0, op),
        ConstOp::Trunc => match operand(operands, 0, op)? {
            Scalar::Int(value) => Ok(Scalar::Int(truncate(value, int_bits(ty)))),
            symbolic => Ok(symbolic),
        },
        ConstOp::Add => {
            let lhs = operand(operands, 0, op)?;
            let rhs = operand(operands, 1, op)?;
            match (lhs, rhs) {
                (value, Scalar::Int(delta)) | (Scalar::Int(delta), value) => Ok(value.offset(delta)),
                _ => Err(Error::invariant("cannot add two symbolic constants")),
            }
        }
        ConstOp::Sub => {
            let lhs = operand(operands, 0, op)?;
            let rhs = operand(operands, 1, op)?;
            match (lhs, rhs) {
                (value, Scalar::Int(delta)) => Ok(value.offset(delta.wrapping_neg())),
                (
                    Scalar::Address {
                        target: plus,
                        addend: lhs,
                    },
                    Scalar::Address {
                        target: minus,
                        addend: rhs,
                    },
                ) => {
                    let addend = lhs.wrapping_sub(rhs);
                    if plus == minus {
                        Ok(Scalar::Int(addend))
                    } else {
                        Ok(Scalar::Difference {
                            plus,
                            minus,
                            addend,
                        })
                    }
                }
                _ => Err(Error::invariant("unsupported symbolic subtraction")),
            }
        }
        ConstOp::GetElementPtr => {
            let mut value = operand(operands, 0, op)?;
            for index in 1..operands.len() {
                match operand(operands, index, op)? {
                    Scalar::Int(delta) => value = value.offset(delta),
                    _ => return Err(Error::invariant("symbolic getelementptr offset")),
                }
            }
            Ok(value)
        }
    }
}

/// Lay `constant` out in memory.
pub fn encode(constant: &Constant) -> Result<Encoded> {
    let size = match constant {
        Constant::Bytes(bytes) => bytes.len() as u64,
        other => other.ty().size(),
    };
    let mut encoded = Encoded {
        bytes: vec![0; size as usize],
        fixups: Vec::new(),
    };
    let mut stack = vec![(constant, 0u64)];
    while let Some((constant, offset)) = stack.pop() {
        match constant {
            Constant::Bytes(bytes) => {
                let start = offset as usize;
                let slot = encoded
                    .bytes
                    .get_mut(start..start + bytes.len())
                    .ok_or_else(|| Error::invariant("byte string overruns its aggregate"))?;
                slot.copy_from_slice(bytes);
            }
            Constant::Aggregate { ty, elements, .. } => {
                for (index, element) in elements.iter().enumerate() {
                    let inner = ty.element_offset(index).ok_or_else(|| {
                        Error::invariant(format!("aggregate of type {ty} has no element {index}"))
                    })?;
                    stack.push((element, offset + inner));
                }
            }
            scalar => {
                let width = scalar.ty().size().min(8) as usize;
                match evaluate(scalar)? {
                    Scalar::Int(value) => write_int(&mut encoded.bytes, offset, width, value)?,
                    symbolic => encoded.fixups.push(Fixup {
                        offset,
                        width: width as u8,
                        value: symbolic,
                    }),
                }
            }
        }
    }
    encoded.fixups.sort_by_key(|fixup| fixup.offset);
    Ok(encoded)
}

/// Store the low `width` bytes of `value`, little endian.
pub fn write_int(bytes: &mut [u8], offset: u64, width: usize, value: i64) -> Result<()> {
    let start = offset as usize;
    let slot = bytes
        .get_mut(start..start + width)
        .ok_or_else(|| Error::invariant(format!("write of {width} bytes at {offset} overruns")))?;
    slot.copy_from_slice(&value.to_le_bytes()[..width]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_fold_into_differences() {
        let value = Constant::ptrdiff32(Constant::global(ValueId(3)), Constant::ptr_to_int(Constant::global(ValueId(1))));
        assert_eq!(
            evaluate(&value).expect("fold"),
            Scalar::Difference {
                plus: ValueId(3),
                minus: ValueId(1),
                addend: 0
            }
        );
        let same = Constant::ptrdiff32(
            Constant::address_plus(ValueId(1), 24),
            Constant::ptr_to_int(Constant::global(ValueId(1))),
        );
        assert_eq!(evaluate(&same).expect("fold"), Scalar::Int(24));
    }

    #[test]
    fn trunc_keeps_low_bits() {
        let value = Constant::Expr {
            op: ConstOp::Trunc,
            ty: Type::i32(),
            operands: vec![Constant::i64(0x1_0000_0005)],
        };
        assert_eq!(evaluate(&value).expect("fold"), Scalar::Int(5));
    }

    #[test]
    fn aggregates_leave_fixups_at_field_offsets() {
        let value = Constant::Aggregate {
            kind: crate::ir::AggregateKind::Struct,
            ty: Type::Struct(vec![Type::i32(), Type::Ptr]),
            elements: vec![Constant::i32(-1), Constant::global(ValueId(7))],
        };
        let encoded = encode(&value).expect("encode");
        assert_eq!(encoded.bytes.len(), 16);
        assert_eq!(&encoded.bytes[..4], &[0xff; 4]);
        assert_eq!(encoded.fixups.len(), 1);
        assert_eq!(encoded.fixups[0].offset, 8);
        assert_eq!(encoded.fixups[0].width, 8);
        let resolved = encoded.fixups[0]
            .value
            .resolve(|id| (id == ValueId(7)).then_some(0x2000));
        assert_eq!(resolved, Some(0x2000));
    }
}
