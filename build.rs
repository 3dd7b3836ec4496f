use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=FDE_KEYMGR_BUILD_STATIC");
    // Only the hardware TPM backend links native libraries
    if env::var_os("CARGO_FEATURE_TPM2").is_none() {
        return;
    }
    let build_static = env::var("FDE_KEYMGR_BUILD_STATIC").unwrap_or_default();
    if !matches!(build_static.to_lowercase().as_ref(), "1" | "y" | "yes" | "true") {
        return;
    }
    println!("cargo:rustc-link-arg=-l:libc.a");
    println!("cargo:rustc-link-arg=-l:libtss2-tcti-device.a");
    for lib in ["crypto", "ssl", "tss2-esys", "tss2-mu", "tss2-sys", "uuid"] {
        println!("cargo:rustc-link-lib=static={}", lib);
    }
    println!("cargo:rustc-link-search=/usr/lib");
    println!("cargo:rustc-link-search=/usr/local/ssl/lib");
}
