//! Platform backends for mapping, shared memory regions, and loaded-library
//! layout discovery.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub(crate) mod unix;
        pub use unix::*;
    } else {
        compile_error!("shared RELRO coordination requires a unix host");
    }
}
