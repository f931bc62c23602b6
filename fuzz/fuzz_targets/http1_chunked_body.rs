#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

use fetchstore::transfer::{BodyDecoder, BodyPlan};

// The first byte picks how the rest is split into socket deliveries.
fuzz_target!(|data: &[u8]| {
    let Some((&step, rest)) = data.split_first() else {
        return;
    };
    let step = usize::from(step).max(1);

    let mut decoder = BodyDecoder::new(BodyPlan::Chunked);
    let mut input = BytesMut::new();
    let mut payload = BytesMut::new();
    for delivery in rest.chunks(step) {
        input.extend_from_slice(delivery);
        match decoder.decode(&mut input, &mut payload) {
            Ok(true) => {
                assert!(decoder.is_done());
                return;
            }
            Ok(false) => {}
            Err(_) => return,
        }
    }
    let _ = decoder.on_eof();
});
