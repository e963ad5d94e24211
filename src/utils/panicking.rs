//! Diverging helpers for programmer errors
#[cold]
pub fn polled_after_completion() -> ! {
    panic!("future polled after completion");
}
