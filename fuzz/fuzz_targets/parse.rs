#![no_main]
use battleye_rcon::Packet;
use libfuzzer_sys::fuzz_target;

// `Packet::from_buffer` must reject malformed input with an `Error`, never
// panic. Most decoded variants (everything but the three a client can send)
// are not serialisable, so there is no general round-trip to assert here —
// unlike the source protocol, this wire format is asymmetric between what a
// client sends and what it receives.
fuzz_target!(|data: &[u8]| {
    let _ = Packet::from_buffer(data);
});
