//! Bounds-checked operand access over a code buffer.
//!
//! Multi-byte operands are stored big-endian. All accessors panic if the requested bytes are not
//! entirely within the buffer, since a well-formed buffer never triggers such an access.

use crate::opcode::Opcode;

/// A byte offset into a code buffer.
pub type CodeOffset = usize;

fn bytes_at<const N: usize>(code: &[u8], pc: CodeOffset) -> [u8; N] {
    match pc.checked_add(N).and_then(|end| code.get(pc..end)) {
        Some(bytes) => {
            let mut res = [0; N];
            res.copy_from_slice(bytes);
            res
        }
        None => panic!("operand read of {N} bytes at {pc} is outside the code buffer (len {})", code.len()),
    }
}
fn bytes_at_mut<const N: usize>(code: &mut [u8], pc: CodeOffset) -> &mut [u8] {
    let len = code.len();
    match pc.checked_add(N).and_then(|end| code.get_mut(pc..end)) {
        Some(bytes) => bytes,
        None => panic!("operand write of {N} bytes at {pc} is outside the code buffer (len {len})"),
    }
}

pub fn get_int1_at(code: &[u8], pc: CodeOffset) -> i8 { i8::from_be_bytes(bytes_at(code, pc)) }
pub fn get_uint1_at(code: &[u8], pc: CodeOffset) -> u8 { bytes_at::<1>(code, pc)[0] }
pub fn get_int4_at(code: &[u8], pc: CodeOffset) -> i32 { i32::from_be_bytes(bytes_at(code, pc)) }
pub fn get_uint4_at(code: &[u8], pc: CodeOffset) -> u32 { u32::from_be_bytes(bytes_at(code, pc)) }

pub fn set_int1_at(code: &mut [u8], pc: CodeOffset, val: i8) { bytes_at_mut::<1>(code, pc).copy_from_slice(&val.to_be_bytes()) }
pub fn set_uint1_at(code: &mut [u8], pc: CodeOffset, val: u8) { bytes_at_mut::<1>(code, pc)[0] = val }
pub fn set_int4_at(code: &mut [u8], pc: CodeOffset, val: i32) { bytes_at_mut::<4>(code, pc).copy_from_slice(&val.to_be_bytes()) }
pub fn set_uint4_at(code: &mut [u8], pc: CodeOffset, val: u32) { bytes_at_mut::<4>(code, pc).copy_from_slice(&val.to_be_bytes()) }

/// Decodes the opcode at `pc`.
/// Panics if `pc` is out of bounds or does not hold an assigned opcode.
pub fn opcode_at(code: &[u8], pc: CodeOffset) -> Opcode {
    let byte = get_uint1_at(code, pc);
    match Opcode::from_byte(byte) {
        Some(op) => op,
        None => panic!("byte {byte:#04x} at {pc} is not an opcode"),
    }
}

/// Overwrites the opcode byte at `pc`.
pub fn set_opcode_at(code: &mut [u8], pc: CodeOffset, op: Opcode) {
    set_uint1_at(code, pc, op as u8)
}

/// Computes the absolute target of a displacement taken relative to `pc`.
/// Returns [`None`] if the target would be negative or overflow.
pub fn jump_target(pc: CodeOffset, displacement: i32) -> Option<CodeOffset> {
    pc.checked_add_signed(displacement as isize)
}

#[test]
fn test_int4_big_endian() {
    let mut buf = [0u8; 6];
    set_int4_at(&mut buf, 1, -2);
    assert_eq!(buf, [0, 0xff, 0xff, 0xff, 0xfe, 0]);
    assert_eq!(get_int4_at(&buf, 1), -2);
    assert_eq!(get_uint4_at(&buf, 1), 0xfffffffe);

    set_uint4_at(&mut buf, 2, 0x01020304);
    assert_eq!(buf, [0, 0xff, 1, 2, 3, 4]);
    assert_eq!(get_int4_at(&buf, 2), 0x01020304);
}

#[test]
fn test_int1_sign() {
    let mut buf = [0u8; 2];
    set_int1_at(&mut buf, 1, -128);
    assert_eq!(buf, [0, 0x80]);
    assert_eq!(get_int1_at(&buf, 1), -128);
    assert_eq!(get_uint1_at(&buf, 1), 128);
    set_uint1_at(&mut buf, 0, 255);
    assert_eq!(get_int1_at(&buf, 0), -1);
}

#[test]
#[should_panic(expected = "outside the code buffer")]
fn test_int4_overrun() {
    let buf = [0u8; 4];
    get_int4_at(&buf, 1);
}

#[test]
fn test_jump_target() {
    assert_eq!(jump_target(10, -10), Some(0));
    assert_eq!(jump_target(10, -11), None);
    assert_eq!(jump_target(10, 5), Some(15));
    assert_eq!(jump_target(usize::MAX, 1), None);
}
