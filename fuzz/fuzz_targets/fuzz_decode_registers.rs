#![no_main]
use libfuzzer_sys::fuzz_target;
use pvctl::modbus::{RegisterDescriptor, WireType, WordOrder};

fuzz_target!(|data: &[u8]| {
    // Interpret the input as u16 register stream in big-endian pairs
    let regs: Vec<u16> = data
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect();

    let h = RegisterDescriptor::holding;
    let table = [
        h("u16", 0, WireType::U16).scaled(0.1, 1),
        h("i16", 0, WireType::I16),
        h("i32", 0, WireType::I32).word_order(WordOrder::LowFirst),
        h("u64", 0, WireType::U64).scaled(0.01, 2),
        h("f32", 0, WireType::F32).byte_swapped(),
        h("flags", 0, WireType::U16).bitfield(&["a", "b", "c"]),
    ];
    // Short input must fail cleanly; decoded values must encode again
    for reg in &table {
        if let Ok(Some(v)) = reg.decode(&regs) {
            let _ = reg.encode(v);
        }
    }
});
