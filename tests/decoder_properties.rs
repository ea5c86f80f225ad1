//! Decoder totality and known-encoding round-trip checks (P2).

use esp_decoder::{decode, DecodeError, InstructionId};

fn addi_word(rt: u32, ra: u32, simm: u16) -> u32 {
    (14 << 26) | (rt << 21) | (ra << 16) | simm as u32
}

fn b_word(li: i32, aa: bool, lk: bool) -> u32 {
    (18 << 26) | ((li as u32) & 0x03ff_fffc) | ((aa as u32) << 1) | lk as u32
}

#[test]
fn decode_is_total_over_the_primary_opcode_space() {
    // Every primary opcode must either decode or return `UnknownEncoding`,
    // never panic.
    for opcode in 0u32..64 {
        let word = opcode << 26;
        let _ = decode(word);
    }
}

#[test]
fn known_encodings_decode_to_the_expected_instruction_id() {
    let word = addi_word(3, 0, 42);
    let inst = decode(word).unwrap();
    assert_eq!(inst.mnemonic(), "addi");
    assert_eq!(inst.rt(), 3);
    assert_eq!(inst.simm(), 42);

    let word = b_word(0x100, false, false);
    let inst = decode(word).unwrap();
    assert_eq!(inst.mnemonic(), "b");
    assert_eq!(inst.li(), 0x100);
}

#[test]
fn unallocated_primary_opcode_is_reported_not_panicked() {
    // Primary opcode 1 carries no defined instruction on this architecture.
    let err = decode(1u32 << 26).unwrap_err();
    assert_eq!(err, DecodeError::UnknownEncoding(1u32 << 26));
}

#[test]
fn sc_encoding_round_trips_through_decode() {
    let word = 17u32 << 26 | 2;
    let inst = decode(word).unwrap();
    assert!(matches!(
        inst.mnemonic(),
        "sc"
    ));
    let _ = InstructionId::Sc;
}
