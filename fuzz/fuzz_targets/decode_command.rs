#![no_main]

use libfuzzer_sys::fuzz_target;
use mbench::protocol::{decode_command, encode_command};
use pretty_assertions::assert_eq;

fuzz_target!(|data: &[u8]| {
    let Ok(Some((command, used))) = decode_command(data) else {
        return;
    };

    // a decoded frame re-encodes to the exact bytes it was read from
    let mut encoded = vec![];
    encode_command(&command, &mut encoded);

    assert_eq!(encoded.as_slice(), &data[..used]);
});
