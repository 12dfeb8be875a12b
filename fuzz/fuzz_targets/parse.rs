#![no_main]
#[macro_use] extern crate libfuzzer_sys;
extern crate kobold;

use kobold::pe::options::ParseOptions;

fuzz_target!(|data: &[u8]| {
    if let Ok(binary) = kobold::pe::parse(data, "fuzz") {
        // the digest walk must stay inside the buffer too
        let _ = binary.authenticode_ranges(data).count();
    }
    let _ = kobold::pe::parse_with_opts(data, "fuzz", &ParseOptions::permissive());
});
