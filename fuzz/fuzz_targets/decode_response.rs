#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mbench::protocol::{CommandKind, decode_response, encode_response};
use pretty_assertions::assert_eq;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    kind: u8,
    bytes: &'a [u8],
}

fuzz_target!(|input: Input<'_>| {
    let kind = CommandKind::ALL[usize::from(input.kind) % CommandKind::ALL.len()];

    let Ok(Some((response, used))) = decode_response(kind, input.bytes) else {
        return;
    };

    let encoded = encode_response(kind, &response).unwrap();
    assert_eq!(encoded.as_slice(), &input.bytes[..used]);
});
