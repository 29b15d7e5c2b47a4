use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=lib.c");
    println!("cargo:rerun-if-changed=lib.h");

    let dpdk = pkg_config::Config::new()
        .probe("libdpdk")
        .expect("Could not find dpdk via pkg-config");

    // lib.c turns the static inline fast-path functions into symbols.
    let mut build = cc::Build::new();
    build.file("lib.c");
    for include_path in &dpdk.include_paths {
        build.include(include_path);
    }
    for (define, value) in &dpdk.defines {
        build.define(define, value.as_deref());
    }
    build.flag("-mssse3");
    build.flag("-O3");
    build.compile("lib");

    let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));

    let mut builder = bindgen::Builder::default().header("lib.h");
    for include_path in &dpdk.include_paths {
        builder = builder.clang_arg(format!("-I{}", include_path.display()));
    }
    let bindings = builder
        .blocklist_type("rte_ether_addr")
        .blocklist_type("rte_arp_ipv4")
        .blocklist_type("rte_arp_hdr")
        .blocklist_type("rte_l2tpv2_combined_msg_hdr")
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .generate_inline_functions(true)
        .wrap_static_fns_path(out_path.join("extern"))
        .generate()
        .expect("Unable to generate bindings for DPDK");

    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");
}
