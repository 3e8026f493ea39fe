use std::env;

fn main() {
    // The linker script only applies to the bare-metal kernel link; host
    // builds (cargo test) use the platform's default linkage.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        println!(
            "cargo:rustc-link-search=native={}",
            concat!(env!("CARGO_MANIFEST_DIR"))
        );
        println!("cargo:rustc-link-arg=-Tlinker.ld");
    }
    println!("cargo:rerun-if-changed=linker.ld");
}
