//! Embed the build identity strings.
//!
//! CI sets `CRASHLAB_BUILD_REVISION`, `CRASHLAB_BUILD_BRANCH` and
//! `CRASHLAB_BUILD_TIMESTAMP`; local builds fall back to "unknown".

const BUILD_VARS: [&str; 3] = [
    "CRASHLAB_BUILD_REVISION",
    "CRASHLAB_BUILD_BRANCH",
    "CRASHLAB_BUILD_TIMESTAMP",
];

fn main() {
    for var in BUILD_VARS {
        println!("cargo:rerun-if-env-changed={}", var);
        let value = std::env::var(var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        println!("cargo:rustc-env={}={}", var, value.trim());
    }
    println!("cargo:rerun-if-changed=build.rs");
}
