#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use tether_dap::dap_tokio::DapReader;

mod utils;

fn runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("build tokio runtime")
    })
}

fuzz_target!(|data: &[u8]| {
    let input = utils::truncate(data);

    // Malformed framing must surface as an error, never a panic or a hang.
    runtime().block_on(async {
        let mut reader = DapReader::new(input);
        while let Ok(Some(_)) = reader.read_request().await {}
    });
});
