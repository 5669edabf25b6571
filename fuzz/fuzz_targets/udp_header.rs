#![no_main]

use libfuzzer_sys::fuzz_target;
use skein_core::wire::{self, UdpHeader, UDP_HEADER_LEN};

fuzz_target!(|data: &[u8]| {
    if let Ok(hdr) = UdpHeader::parse(data) {
        let _ = hdr.payload_length();
        // Re-encoding a parsed header must be lossless.
        let reparsed = UdpHeader::parse(&hdr.encode()).unwrap();
        assert_eq!(reparsed, hdr);
        // Checksumming arbitrary tails must not panic.
        let _ = wire::checksum(&data[UDP_HEADER_LEN..], hdr.checksum);
    } else {
        assert!(data.len() < UDP_HEADER_LEN);
    }
});
