//! DWARF location expression evaluation
//!
//! Interprets a variable's raw location expression against a snapshot of
//! the tracee's registers using the standard DWARF stack-machine
//! semantics, yielding either a memory address or register pieces. Memory
//! access is deliberately outside the evaluator; dereferencing operations
//! are unsupported and surface as errors.

use gimli::{EndianSlice, LittleEndian, Operation};
use tracing::trace;

/// Host pointer size: x86-64 only.
pub const PTR_SIZE: u8 = 8;

/// DWARF register numbers for x86-64 (System V ABI).
pub mod regnum {
    pub const RAX: u16 = 0;
    pub const RDX: u16 = 1;
    pub const RCX: u16 = 2;
    pub const RBX: u16 = 3;
    pub const RSI: u16 = 4;
    pub const RDI: u16 = 5;
    pub const RBP: u16 = 6;
    pub const RSP: u16 = 7;
    pub const R8: u16 = 8;
    pub const R9: u16 = 9;
    pub const R10: u16 = 10;
    pub const R11: u16 = 11;
    pub const R12: u16 = 12;
    pub const R13: u16 = 13;
    pub const R14: u16 = 14;
    pub const R15: u16 = 15;
    pub const RIP: u16 = 16;
}

/// Human-readable name of a DWARF register number.
pub fn dwarf_reg_name(register: u16) -> Option<&'static str> {
    match register {
        0 => Some("RAX"),
        1 => Some("RDX"),
        2 => Some("RCX"),
        3 => Some("RBX"),
        4 => Some("RSI"),
        5 => Some("RDI"),
        6 => Some("RBP"),
        7 => Some("RSP"),
        8 => Some("R8"),
        9 => Some("R9"),
        10 => Some("R10"),
        11 => Some("R11"),
        12 => Some("R12"),
        13 => Some("R13"),
        14 => Some("R14"),
        15 => Some("R15"),
        16 => Some("RIP"),
        _ => None,
    }
}

/// Register snapshot the evaluator reads from, indexed by DWARF register
/// number.
#[derive(Debug, Clone, Copy, Default)]
pub struct DwarfRegisters {
    values: [Option<u64>; 17],
    /// Frame base (CFA) for `DW_OP_fbreg` relative locations, when the
    /// caller can supply one.
    pub frame_base: Option<u64>,
}

impl DwarfRegisters {
    pub fn set(&mut self, register: u16, value: u64) {
        if let Some(slot) = self.values.get_mut(register as usize) {
            *slot = Some(value);
        }
    }

    pub fn get(&self, register: u16) -> Option<u64> {
        self.values.get(register as usize).copied().flatten()
    }
}

/// One piece of a composite location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub location: PieceLocation,
    pub size_in_bits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceLocation {
    Register(u16),
    Address(u64),
}

/// Result of evaluating a location expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// The variable lives in memory at this address.
    Address(u64),
    /// The variable lives entirely in a register.
    Register(u16),
    /// Composite location split across registers and/or memory.
    Pieces(Vec<Piece>),
}

#[derive(thiserror::Error, Debug)]
pub enum EvalError {
    #[error("DWARF expression error: {0}")]
    Gimli(#[from] gimli::Error),
    #[error("empty location expression")]
    EmptyExpression,
    #[error("expression stack underflow")]
    StackUnderflow,
    #[error("register {0} not available in snapshot")]
    UnknownRegister(u16),
    #[error("no frame base available for frame-relative location")]
    NoFrameBase,
    #[error("unsupported DWARF operation: {0}")]
    UnsupportedOp(String),
}

/// Evaluate `expression` against `registers`.
pub fn evaluate(expression: &[u8], registers: &DwarfRegisters) -> Result<Location, EvalError> {
    if expression.is_empty() {
        return Err(EvalError::EmptyExpression);
    }

    let encoding = gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 4,
        address_size: PTR_SIZE,
    };

    let mut reader = EndianSlice::new(expression, LittleEndian);
    let mut stack: Vec<u64> = Vec::new();
    let mut pieces: Vec<Piece> = Vec::new();
    // Set by DW_OP_reg*: the value *is* the register, not an address.
    let mut pending_register: Option<u16> = None;

    while !reader.is_empty() {
        let operation = Operation::parse(&mut reader, encoding)?;
        trace!("location op: {:?}", operation);
        match operation {
            Operation::Address { address } => stack.push(address),
            Operation::UnsignedConstant { value } => stack.push(value),
            Operation::SignedConstant { value } => stack.push(value as u64),

            Operation::Register { register } => pending_register = Some(register.0),
            Operation::RegisterOffset {
                register, offset, ..
            } => {
                let base = registers
                    .get(register.0)
                    .ok_or(EvalError::UnknownRegister(register.0))?;
                stack.push(base.wrapping_add_signed(offset));
            }
            Operation::FrameOffset { offset } => {
                let base = registers.frame_base.ok_or(EvalError::NoFrameBase)?;
                stack.push(base.wrapping_add_signed(offset));
            }
            Operation::CallFrameCFA => {
                let base = registers.frame_base.ok_or(EvalError::NoFrameBase)?;
                stack.push(base);
            }

            Operation::Plus => binary_op(&mut stack, u64::wrapping_add)?,
            Operation::Minus => binary_op(&mut stack, u64::wrapping_sub)?,
            Operation::Mul => binary_op(&mut stack, u64::wrapping_mul)?,
            Operation::And => binary_op(&mut stack, |a, b| a & b)?,
            Operation::Or => binary_op(&mut stack, |a, b| a | b)?,
            Operation::Xor => binary_op(&mut stack, |a, b| a ^ b)?,
            Operation::Shl => binary_op(&mut stack, |a, b| a.wrapping_shl(b as u32))?,
            Operation::Shr => binary_op(&mut stack, |a, b| a.wrapping_shr(b as u32))?,
            Operation::PlusConstant { value } => {
                let top = stack.pop().ok_or(EvalError::StackUnderflow)?;
                stack.push(top.wrapping_add(value));
            }
            Operation::Neg => {
                let top = stack.pop().ok_or(EvalError::StackUnderflow)?;
                stack.push((top as i64).wrapping_neg() as u64);
            }
            Operation::Not => {
                let top = stack.pop().ok_or(EvalError::StackUnderflow)?;
                stack.push(!top);
            }

            Operation::Drop => {
                stack.pop().ok_or(EvalError::StackUnderflow)?;
            }
            Operation::Pick { index } => {
                let len = stack.len();
                let idx = index as usize;
                let value = *stack
                    .get(len.checked_sub(1 + idx).ok_or(EvalError::StackUnderflow)?)
                    .ok_or(EvalError::StackUnderflow)?;
                stack.push(value);
            }
            Operation::Swap => {
                let len = stack.len();
                if len < 2 {
                    return Err(EvalError::StackUnderflow);
                }
                stack.swap(len - 1, len - 2);
            }

            Operation::Piece {
                size_in_bits,
                bit_offset: _,
            } => {
                let location = match pending_register.take() {
                    Some(register) => PieceLocation::Register(register),
                    None => {
                        let address = stack.pop().ok_or(EvalError::StackUnderflow)?;
                        PieceLocation::Address(address)
                    }
                };
                pieces.push(Piece {
                    location,
                    size_in_bits,
                });
            }

            Operation::Nop => {}

            other => {
                return Err(EvalError::UnsupportedOp(format!("{other:?}")));
            }
        }
    }

    if !pieces.is_empty() {
        return Ok(Location::Pieces(pieces));
    }
    if let Some(register) = pending_register {
        return Ok(Location::Register(register));
    }
    match stack.pop() {
        Some(address) => Ok(Location::Address(address)),
        None => Err(EvalError::EmptyExpression),
    }
}

fn binary_op(stack: &mut Vec<u64>, op: impl Fn(u64, u64) -> u64) -> Result<(), EvalError> {
    let b = stack.pop().ok_or(EvalError::StackUnderflow)?;
    let a = stack.pop().ok_or(EvalError::StackUnderflow)?;
    stack.push(op(a, b));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DW_OP_ADDR: u8 = 0x03;
    const DW_OP_CONSTU: u8 = 0x10;
    const DW_OP_PLUS: u8 = 0x22;
    const DW_OP_REG5: u8 = 0x55;
    const DW_OP_BREG7: u8 = 0x77;
    const DW_OP_FBREG: u8 = 0x91;
    const DW_OP_PIECE: u8 = 0x93;

    fn regs() -> DwarfRegisters {
        let mut regs = DwarfRegisters::default();
        regs.set(regnum::RSP, 0x7fff_0000);
        regs.set(regnum::RBP, 0x7fff_0040);
        regs
    }

    #[test]
    fn absolute_address() {
        let mut expr = vec![DW_OP_ADDR];
        expr.extend_from_slice(&0x60_2040u64.to_le_bytes());
        assert_eq!(
            evaluate(&expr, &regs()).unwrap(),
            Location::Address(0x60_2040)
        );
    }

    #[test]
    fn register_location() {
        assert_eq!(
            evaluate(&[DW_OP_REG5], &regs()).unwrap(),
            Location::Register(regnum::RDI)
        );
    }

    #[test]
    fn register_relative_address() {
        // DW_OP_breg7 +8
        assert_eq!(
            evaluate(&[DW_OP_BREG7, 0x08], &regs()).unwrap(),
            Location::Address(0x7fff_0008)
        );
    }

    #[test]
    fn frame_relative_address() {
        // DW_OP_fbreg -16 (sleb128 -16 == 0x70)
        let mut regs = regs();
        regs.frame_base = Some(0x7fff_0050);
        assert_eq!(
            evaluate(&[DW_OP_FBREG, 0x70], &regs).unwrap(),
            Location::Address(0x7fff_0040)
        );
    }

    #[test]
    fn frame_relative_without_frame_base_fails() {
        assert!(matches!(
            evaluate(&[DW_OP_FBREG, 0x70], &regs()),
            Err(EvalError::NoFrameBase)
        ));
    }

    #[test]
    fn arithmetic_on_the_stack() {
        // constu 0x1000, constu 0x234, plus
        let expr = [DW_OP_CONSTU, 0x80, 0x20, DW_OP_CONSTU, 0xb4, 0x04, DW_OP_PLUS];
        assert_eq!(evaluate(&expr, &regs()).unwrap(), Location::Address(0x1234));
    }

    #[test]
    fn composite_register_pieces() {
        // reg5 piece(8 bytes), breg7 +0 piece(8 bytes)
        let expr = [
            DW_OP_REG5, DW_OP_PIECE, 8, DW_OP_BREG7, 0x00, DW_OP_PIECE, 8,
        ];
        let result = evaluate(&expr, &regs()).unwrap();
        assert_eq!(
            result,
            Location::Pieces(vec![
                Piece {
                    location: PieceLocation::Register(regnum::RDI),
                    size_in_bits: 64,
                },
                Piece {
                    location: PieceLocation::Address(0x7fff_0000),
                    size_in_bits: 64,
                },
            ])
        );
    }

    #[test]
    fn empty_expression_is_an_error() {
        assert!(matches!(
            evaluate(&[], &regs()),
            Err(EvalError::EmptyExpression)
        ));
    }

    #[test]
    fn unknown_register_is_an_error() {
        let empty = DwarfRegisters::default();
        assert!(matches!(
            evaluate(&[DW_OP_BREG7, 0x00], &empty),
            Err(EvalError::UnknownRegister(7))
        ));
    }
}
