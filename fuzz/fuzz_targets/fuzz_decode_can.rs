#![no_main]
use libfuzzer_sys::fuzz_target;
use pvctl::can::{BmsFrame, RawFrame};

fuzz_target!(|data: &[u8]| {
    let Some((&hi, rest)) = data.split_first() else {
        return;
    };
    let Some((&lo, payload)) = rest.split_first() else {
        return;
    };
    let id = u16::from_be_bytes([hi & 0x07, lo]);
    let Ok(frame) = RawFrame::new(id, payload) else {
        return;
    };
    // Anything decoded must survive a re-encode
    if let Ok(decoded) = BmsFrame::decode(&frame) {
        let _ = BmsFrame::decode(&decoded.encode());
    }
});
