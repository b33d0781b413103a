use std::{env, fs, path::PathBuf};

/// Generates a self-signed DER certificate/key pair at build time and writes
/// them next to the build output, mirroring the original's build-time
/// embedded certificate (there it was a generated C header; here it's two
/// `.der` files pulled in via `include_bytes!`).
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR set by cargo"));

    let subject_alt_names = vec!["localhost".to_string()];
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(subject_alt_names).expect("generate self-signed cert");

    fs::write(out_dir.join("cert.der"), cert.der()).expect("write cert.der");
    fs::write(
        out_dir.join("key.der"),
        key_pair.serialize_der(),
    )
    .expect("write key.der");

    println!("cargo::rerun-if-changed=build.rs");
}
