//! Fuzz target for request encoding.
//!
//! Builds structured requests and checks they survive encode and decode.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether::codec;
use tether::protocol::{ExpectFlags, PassRequest, Request, Settings, Subcommand};

#[derive(Debug, Arbitrary)]
enum FuzzRequest {
    Hello(Option<i32>),
    Pass {
        subcommand: u8,
        flags: i32,
        pattern: Option<Vec<u8>>,
        timeout: Option<i32>,
        lookback: Option<i32>,
    },
    Send(Vec<u8>),
    Input(Vec<u8>),
    Winch(u16, u16),
    Kill(i32),
    Set {
        autowait: Option<bool>,
        nonblock: Option<bool>,
        timeout: Option<i32>,
        ttl: Option<i32>,
        idle: Option<i32>,
    },
    ExpectOut(i32),
}

fuzz_target!(|req: FuzzRequest| {
    let request = match req {
        FuzzRequest::Hello(version) => Request::Hello { version },
        FuzzRequest::Pass {
            subcommand,
            flags,
            pattern,
            timeout,
            lookback,
        } => Request::Pass(PassRequest {
            subcommand: match subcommand % 3 {
                0 => Subcommand::Expect,
                1 => Subcommand::Interact,
                _ => Subcommand::Wait,
            },
            flags: ExpectFlags::from_bits(flags),
            pattern,
            timeout,
            lookback,
        }),
        FuzzRequest::Send(data) => Request::Send(data),
        FuzzRequest::Input(data) => Request::Input(data),
        FuzzRequest::Winch(rows, cols) => Request::Winch { rows, cols },
        FuzzRequest::Kill(signal) => Request::Kill { signal },
        FuzzRequest::Set {
            autowait,
            nonblock,
            timeout,
            ttl,
            idle,
        } => Request::Set(Settings {
            autowait,
            nonblock,
            timeout,
            ttl,
            idle,
        }),
        FuzzRequest::ExpectOut(index) => Request::ExpectOut { index },
    };

    // oversized payloads are refused by the encoder, never truncated
    let Ok(bytes) = request.to_tlv().encode(usize::MAX) else {
        return;
    };
    let msg = codec::decode_message(&bytes).expect("encoded request must decode");
    let _ = Request::from_tlv(&msg);
});
