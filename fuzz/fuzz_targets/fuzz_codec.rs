//! Fuzz target for message decoding.
//!
//! Arbitrary bytes must never panic the decoder, the frame reader or the
//! typed parsers, and anything that decodes must encode back to
//! something decodable.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;
use tether::codec;
use tether::protocol::{Reply, Request};
use tether::transport::{self, MAX_FRAME_SIZE};
use tokio::runtime::Runtime;

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
    })
}

fuzz_target!(|data: &[u8]| {
    let _ = codec::decode(data);

    if let Ok(msg) = codec::decode_message(data) {
        let _ = Request::from_tlv(&msg);
        let _ = Reply::from_tlv(&msg);
        if let Ok(encoded) = msg.encode(usize::MAX) {
            assert!(codec::decode_message(&encoded).is_ok());
        }
    }

    // as if read off a socket
    let mut stream = data;
    runtime().block_on(async {
        while let Ok(msg) = transport::recv(&mut stream).await {
            assert!(msg.encoded_len() <= MAX_FRAME_SIZE);
        }
    });
});
