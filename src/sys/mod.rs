cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub(crate) use unix::{alloc_fixed, allocation_granularity, dealloc_fixed, protect};
    } else if #[cfg(windows)] {
        mod windows;
        pub(crate) use windows::{alloc_fixed, allocation_granularity, dealloc_fixed, protect};
    }
}
