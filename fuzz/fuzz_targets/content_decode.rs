#![no_main]

use libfuzzer_sys::fuzz_target;

use fetchstore::decode::{ContentEncoding, DecodeBridge};

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let encoding = if selector & 1 == 0 {
        ContentEncoding::Gzip
    } else {
        ContentEncoding::Bzip2
    };
    let mut bridge = DecodeBridge::new(Some(encoding));
    for piece in rest.chunks(usize::from(selector >> 1).max(1)) {
        let mut piece = piece;
        while !piece.is_empty() {
            let Ok(accepted) = bridge.push(piece) else {
                return;
            };
            piece = &piece[accepted..];
            if bridge.drain().is_err() {
                return;
            }
        }
    }
    let _ = bridge.finish();
});
