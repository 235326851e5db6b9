pub mod distributed;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
