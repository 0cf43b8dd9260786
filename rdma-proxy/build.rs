use std::env;
use std::path::PathBuf;

fn main() {
    let rdmacm = pkg_config::probe_library("librdmacm").expect("librdmacm not found via pkg-config");
    let verbs = pkg_config::probe_library("libibverbs").expect("libibverbs not found via pkg-config");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    let mut builder = bindgen::Builder::default()
        .header("wrapper.h")
        .allowlist_function("rdma_.*")
        .allowlist_function("ibv_.*")
        .allowlist_type("rdma_.*")
        .allowlist_type("ibv_.*")
        .allowlist_var("RDMA_.*")
        .allowlist_var("IBV_.*")
        .allowlist_var("AF_INET")
        .derive_debug(true)
        .derive_default(true)
        .layout_tests(false)
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()));

    for path in rdmacm.include_paths.iter().chain(verbs.include_paths.iter()) {
        builder = builder.clang_arg(format!("-I{}", path.display()));
    }

    let bindings = builder.generate().expect("failed generating rdma-cm/ibverbs bindings");

    bindings
        .write_to_file(out_dir.join("bindings.rs"))
        .expect("failed writing bindings.rs");

    println!("cargo:rustc-link-lib=rdmacm");
    println!("cargo:rustc-link-lib=ibverbs");
    println!("cargo:rerun-if-changed=wrapper.h");
}
