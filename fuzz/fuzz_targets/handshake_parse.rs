#![no_main]

use libfuzzer_sys::fuzz_target;
use rtmfp::message::{AddressExchange, Challenge70, Commit38, Complete78, Hello30, Redirect71};

fuzz_target!(|data: &[u8]| {
    let _ = Hello30::parse(data);
    let _ = Challenge70::parse(data);
    let _ = Commit38::parse(data);
    let _ = Complete78::parse(data);
    let _ = Redirect71::parse(data);
    let _ = AddressExchange::parse(data);
});
