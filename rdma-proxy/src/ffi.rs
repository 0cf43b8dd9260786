//! Raw bindings to `librdmacm`/`libibverbs`, generated at build time from
//! system headers (see `build.rs`). Nothing above this module should need
//! to reach for these types directly; `cm` and `verbs` wrap them safely.
#![allow(
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    dead_code,
    clippy::all
)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
